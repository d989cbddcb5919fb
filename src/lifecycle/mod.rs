//! Supervised module lifecycle
//!
//! Every long-running subsystem (gossip agent, storage backend, sync server)
//! implements [`Module`]. A module owns a [`Lifecycle`] cell that moves
//! through `NotStarted -> Starting -> {Ready, Error} -> Stopped` and lets the
//! orchestrator wait for the first of ready / failed.

pub mod pool;
pub mod signal;
pub mod ticker;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{SyncError, SyncResult};

pub use pool::TaskPool;
pub use signal::{Signal, SignalDispatcher};
pub use ticker::{TaskTicker, TickHandler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleState {
    NotStarted,
    Starting,
    Ready,
    Error(String),
    Stopped,
}

impl ModuleState {
    fn is_settled(&self) -> bool {
        matches!(
            self,
            ModuleState::Ready | ModuleState::Error(_) | ModuleState::Stopped
        )
    }
}

/// State cell shared between a module and whoever supervises it.
pub struct Lifecycle {
    name: &'static str,
    state: watch::Sender<ModuleState>,
}

impl Lifecycle {
    pub fn new(name: &'static str) -> Self {
        let (state, _) = watch::channel(ModuleState::NotStarted);
        Self { name, state }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ModuleState {
        self.state.borrow().clone()
    }

    /// Returns false if the module was already started.
    pub fn mark_starting(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ModuleState::NotStarted {
                *state = ModuleState::Starting;
                true
            } else {
                false
            }
        })
    }

    /// Ready is reached at most once, and only from Starting.
    pub fn mark_ready(&self) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == ModuleState::Starting {
                *state = ModuleState::Ready;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!("Module {} is ready", self.name);
        }
        changed
    }

    /// Records a fatal error. At most one error is ever published.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let changed = self.state.send_if_modified(|state| match state {
            ModuleState::Starting | ModuleState::Ready => {
                *state = ModuleState::Error(message.clone());
                true
            }
            _ => false,
        });
        if changed {
            tracing::error!("Module {} failed: {}", self.name, message);
        }
        changed
    }

    /// Idempotent.
    pub fn mark_stopped(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ModuleState::Stopped {
                false
            } else {
                *state = ModuleState::Stopped;
                true
            }
        })
    }

    pub fn is_stopped(&self) -> bool {
        *self.state.borrow() == ModuleState::Stopped
    }

    /// Resolves once the module is Ready, or with its error if it failed
    /// (or was stopped) first.
    pub async fn wait_settled(&self) -> SyncResult<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(ModuleState::is_settled)
            .await
            .map(|state| state.clone())
            .map_err(|_| self.failure("lifecycle dropped"))?;
        match state {
            ModuleState::Ready => Ok(()),
            ModuleState::Error(message) => Err(self.failure(message)),
            _ => Err(self.failure("stopped before becoming ready")),
        }
    }

    /// Resolves with the module's fatal error, or `None` once it stops
    /// without one.
    pub async fn wait_error(&self) -> Option<SyncError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| matches!(state, ModuleState::Error(_) | ModuleState::Stopped))
            .await
            .ok()?
            .clone();
        match state {
            ModuleState::Error(message) => Some(self.failure(message)),
            _ => None,
        }
    }

    fn failure(&self, message: impl Into<String>) -> SyncError {
        SyncError::ModuleFailed {
            module: self.name.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// A supervised subsystem.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    fn lifecycle(&self) -> &Lifecycle;

    /// Begins background work on `pool` and returns immediately. Readiness
    /// is reported through [`Module::ready`].
    fn start(self: Arc<Self>, pool: &TaskPool);

    /// Stops background work. Safe to call more than once, and on a module
    /// that never started.
    async fn stop(&self);

    fn name(&self) -> &'static str {
        self.lifecycle().name()
    }

    async fn ready(&self) -> SyncResult<()> {
        self.lifecycle().wait_settled().await
    }

    async fn error(&self) -> Option<SyncError> {
        self.lifecycle().wait_error().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_state_transitions() {
        let lifecycle = Lifecycle::new("test");
        assert_eq!(lifecycle.state(), ModuleState::NotStarted);

        // Ready cannot be reached without starting
        assert!(!lifecycle.mark_ready());

        assert!(lifecycle.mark_starting());
        assert!(!lifecycle.mark_starting());
        assert!(lifecycle.mark_ready());
        assert!(!lifecycle.mark_ready());
        assert_eq!(lifecycle.state(), ModuleState::Ready);

        assert!(lifecycle.mark_stopped());
        assert!(!lifecycle.mark_stopped());
        assert!(lifecycle.is_stopped());
    }

    #[test]
    fn test_fail_publishes_once() {
        let lifecycle = Lifecycle::new("test");
        assert!(!lifecycle.fail("not started yet"));

        lifecycle.mark_starting();
        assert!(lifecycle.fail("bind failed"));
        assert!(!lifecycle.fail("second error"));
        assert_eq!(lifecycle.state(), ModuleState::Error("bind failed".to_string()));
    }

    #[tokio::test]
    async fn test_wait_settled_ready() {
        let lifecycle = Arc::new(Lifecycle::new("test"));
        lifecycle.mark_starting();

        let waiter = lifecycle.clone();
        let handle = tokio::spawn(async move { waiter.wait_settled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        lifecycle.mark_ready();

        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_settled_error() {
        let lifecycle = Lifecycle::new("storage");
        lifecycle.mark_starting();
        lifecycle.fail("disk full");

        let err = lifecycle.wait_settled().await.unwrap_err();
        assert_eq!(err.to_string(), "Module 'storage' failed: disk full");
    }

    #[tokio::test]
    async fn test_wait_error_none_after_stop() {
        let lifecycle = Lifecycle::new("test");
        lifecycle.mark_starting();
        lifecycle.mark_ready();
        lifecycle.mark_stopped();

        assert!(lifecycle.wait_error().await.is_none());
    }
}
