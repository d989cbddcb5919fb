//! System signal dispatch
//!
//! Callbacks are registered per signal. [`SignalDispatcher::run`] listens
//! once: it returns after the first recognized signal (running that
//! signal's callbacks in registration order) or when cancelled, and every
//! later call is a no-op until [`SignalDispatcher::rearm`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Hangup,
    Interrupt,
    Terminate,
    /// Cannot be caught; never registered
    Kill,
}

impl Signal {
    pub const RECOGNIZED: [Signal; 3] = [Signal::Hangup, Signal::Interrupt, Signal::Terminate];

    pub fn name(&self) -> &'static str {
        match self {
            Signal::Hangup => "SIGHUP",
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

pub struct SignalDispatcher {
    handlers: RwLock<HashMap<Signal, Vec<Callback>>>,
    started: AtomicBool,
}

impl Default for SignalDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalDispatcher {
    pub fn new() -> Self {
        let handlers = Signal::RECOGNIZED
            .iter()
            .map(|sig| (*sig, Vec::new()))
            .collect();
        Self {
            handlers: RwLock::new(handlers),
            started: AtomicBool::new(false),
        }
    }

    pub fn add_handler<F>(&self, signal: Signal, callback: F) -> SyncResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_handlers(&[signal], callback)
    }

    /// Registers one callback for several signals. Nothing is registered if
    /// any of them is unrecognized.
    pub fn add_handlers<F>(&self, signals: &[Signal], callback: F) -> SyncResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let mut handlers = self.handlers.write();
        if let Some(sig) = signals.iter().find(|sig| !handlers.contains_key(*sig)) {
            return Err(SyncError::UnregisteredSignal(sig.to_string()));
        }
        for sig in signals {
            if let Some(list) = handlers.get_mut(sig) {
                list.push(callback.clone());
            }
        }
        Ok(())
    }

    pub fn handler_count(&self, signal: Signal) -> usize {
        self.handlers.read().get(&signal).map_or(0, Vec::len)
    }

    /// Listens for OS termination signals.
    pub async fn run(&self, cancel: CancellationToken) {
        self.run_with(cancel, next_os_signal()).await
    }

    /// Same as [`run`](Self::run) with an explicit signal source.
    pub async fn run_with<S>(&self, cancel: CancellationToken, source: S)
    where
        S: Future<Output = Option<Signal>>,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Signal listener cancelled");
            }
            received = source => {
                if let Some(sig) = received {
                    info!("system signal: {}", sig);
                    self.dispatch(sig);
                }
            }
        }
    }

    /// Allows another [`run`](Self::run).
    pub fn rearm(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn dispatch(&self, signal: Signal) {
        // Callbacks run without the lock held so they may register more.
        let calls = self.handlers.read().get(&signal).cloned().unwrap_or_default();
        for call in calls {
            call();
        }
    }
}

#[cfg(unix)]
async fn next_os_signal() -> Option<Signal> {
    use tokio::signal::unix::{signal, SignalKind};

    let listeners = (
        signal(SignalKind::hangup()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    );
    let (mut hup, mut int, mut term) = match listeners {
        (Ok(hup), Ok(int), Ok(term)) => (hup, int, term),
        _ => {
            error!("Failed to install system signal listeners");
            return None;
        }
    };

    tokio::select! {
        _ = hup.recv() => Some(Signal::Hangup),
        _ = int.recv() => Some(Signal::Interrupt),
        _ = term.recv() => Some(Signal::Terminate),
    }
}

#[cfg(not(unix))]
async fn next_os_signal() -> Option<Signal> {
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some(Signal::Interrupt),
        Err(e) => {
            error!("Failed to install Ctrl+C handler: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    #[test]
    fn test_unregistered_signal() {
        let dispatcher = SignalDispatcher::new();
        let err = dispatcher.add_handler(Signal::Kill, || {}).unwrap_err();
        assert_eq!(err.to_string(), "System signal SIGKILL is not registered");

        // A bad signal in the list registers nothing
        assert!(dispatcher
            .add_handlers(&[Signal::Interrupt, Signal::Kill], || {})
            .is_err());
        assert_eq!(dispatcher.handler_count(Signal::Interrupt), 0);
    }

    #[tokio::test]
    async fn test_callbacks_run_in_registration_order() {
        let dispatcher = SignalDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            dispatcher
                .add_handler(Signal::Terminate, move || order.lock().push(i))
                .unwrap();
        }

        dispatcher
            .run_with(CancellationToken::new(), async { Some(Signal::Terminate) })
            .await;

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_one_shot_delivery() {
        let dispatcher = SignalDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dispatcher
            .add_handler(Signal::Interrupt, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(Signal::Interrupt).unwrap();
        tx.send(Signal::Interrupt).unwrap();

        dispatcher
            .run_with(CancellationToken::new(), rx.recv())
            .await;
        // Not re-armed: the second delivery is never observed
        dispatcher
            .run_with(CancellationToken::new(), rx.recv())
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);

        dispatcher.rearm();
        dispatcher
            .run_with(CancellationToken::new(), rx.recv())
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_without_callbacks() {
        let dispatcher = SignalDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dispatcher
            .add_handler(Signal::Hangup, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        dispatcher
            .run_with(cancel, std::future::pending::<Option<Signal>>())
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_other_signal_callbacks_not_invoked() {
        let dispatcher = SignalDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dispatcher
            .add_handler(Signal::Terminate, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        dispatcher
            .run_with(CancellationToken::new(), async { Some(Signal::Hangup) })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
