//! Binary protocol for snapshot pulls
//!
//! Uses bincode over TCP. A connection starts with [`MAGIC_HEADER`],
//! optionally runs the HMAC challenge, then carries request/response pairs.

use serde::{Deserialize, Serialize};

use crate::model::Snapshot;

/// Sent by the client first on every connection
pub const MAGIC_HEADER: &[u8; 9] = b"dcsync-v1";

/// Messages exchanged between a puller and a peer's sync server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    // === Authentication ===
    /// Server sends challenge
    AuthChallenge { challenge: Vec<u8> },
    /// Client responds with HMAC
    AuthResponse { hmac: Vec<u8> },
    /// Server confirms auth result
    AuthResult { success: bool, message: String },

    // === Pull ===
    /// Ask for the full registry state
    PullRequest,
    /// Full registry state of the serving cluster
    PullResponse { snapshot: Snapshot },

    /// Request could not be served
    Error { message: String },
}

impl SyncMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::AuthChallenge { .. } => "AuthChallenge",
            SyncMessage::AuthResponse { .. } => "AuthResponse",
            SyncMessage::AuthResult { .. } => "AuthResult",
            SyncMessage::PullRequest => "PullRequest",
            SyncMessage::PullResponse { .. } => "PullResponse",
            SyncMessage::Error { .. } => "Error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstanceRecord, ServiceRecord};

    #[test]
    fn test_pull_response_decode() {
        let msg = SyncMessage::PullResponse {
            snapshot: Snapshot::new(
                vec![ServiceRecord::new("s1")],
                vec![InstanceRecord::new("i1", "s1")],
            ),
        };

        let encoded = bincode::serialize(&msg).unwrap();
        match bincode::deserialize::<SyncMessage>(&encoded).unwrap() {
            SyncMessage::PullResponse { snapshot } => {
                assert_eq!(snapshot.services[0].service_id, "s1");
                assert_eq!(snapshot.instances[0].instance_id, "i1");
            }
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_magic_header() {
        assert_eq!(MAGIC_HEADER.len(), 9);
        assert!(MAGIC_HEADER.starts_with(b"dcsync"));
    }
}
