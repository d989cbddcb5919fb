//! Snapshot pull replication between clusters
//!
//! - Binary protocol using bincode over TCP, LZ4 for large frames
//! - Optional HMAC challenge/response from a shared keyfile
//! - `SyncServer` answers pulls from the local registry
//! - `ClientPool` caches one client per peer address
//! - `SyncWorker` runs a pull-and-reconcile round per tick

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod worker;

pub use client::{ClientPool, SyncClient};
pub use protocol::SyncMessage;
pub use server::SyncServer;
pub use transport::{Keyfile, TransportError};
pub use worker::{reconcile, RoundReport, SyncWorker};
