//! Process orchestration
//!
//! Starts the modules in dependency order (membership, storage, sync
//! server), then the sync ticker, and tears everything down in reverse once
//! the stop token is cancelled by a signal or by a failing module.

pub mod cluster;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cluster::{MemberEventHandler, MembershipAgent, TAG_RPC_PORT};
use crate::config::SyncerConfig;
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::{Module, ModuleState, Signal, SignalDispatcher, TaskPool, TaskTicker};
use crate::registry::RegistrySource;
use crate::storage::{Reconciler, StorageBackend};
use crate::sync::{ClientPool, SyncServer, SyncWorker};

pub use cluster::configure_cluster;

pub struct Server {
    config: SyncerConfig,
    agent: Arc<MembershipAgent>,
    storage: Arc<StorageBackend>,
    rpc: Arc<SyncServer>,
    worker: Arc<SyncWorker>,
    worker_handler: Arc<dyn MemberEventHandler>,
    ticker: Arc<TaskTicker>,
    signals: Arc<SignalDispatcher>,
    tasks: TaskPool,
    stop: CancellationToken,
    /// First module error after startup
    failure: Arc<Mutex<Option<SyncError>>>,
    shut_down: AtomicBool,
}

impl Server {
    pub fn new(config: SyncerConfig, registry: Arc<dyn RegistrySource>) -> SyncResult<Self> {
        Self::with_signal_dispatcher(config, registry, Arc::new(SignalDispatcher::new()))
    }

    pub fn with_signal_dispatcher(
        config: SyncerConfig,
        registry: Arc<dyn RegistrySource>,
        signals: Arc<SignalDispatcher>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let keyfile = config.load_keyfile()?;

        let agent = Arc::new(MembershipAgent::new(config.gossip_config()));
        let clients = Arc::new(ClientPool::new(keyfile.clone(), config.pull_timeout()));
        let rpc = Arc::new(SyncServer::new(config.rpc_addr.clone(), keyfile, registry));
        let storage = Arc::new(StorageBackend::new(config.data_dir.clone()));
        let worker = Arc::new(SyncWorker::new(agent.clone(), clients));
        let worker_handler: Arc<dyn MemberEventHandler> = worker.clone();

        let stop = CancellationToken::new();
        let ticker = Arc::new(TaskTicker::new(
            config.ticker_interval(),
            worker.tick_handler(stop.clone()),
        ));

        let on_signal = stop.clone();
        signals.add_handlers(&[Signal::Interrupt, Signal::Terminate], move || {
            on_signal.cancel()
        })?;

        Ok(Self {
            config,
            agent,
            storage,
            rpc,
            worker,
            worker_handler,
            ticker,
            signals,
            tasks: TaskPool::new(),
            stop,
            failure: Arc::new(Mutex::new(None)),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Starts every module and blocks until stopped. Returns the error that
    /// aborted startup or the module failure that stopped the process;
    /// shutdown runs either way.
    pub async fn run(&self) -> SyncResult<()> {
        let signals = self.signals.clone();
        let stop = self.stop.clone();
        self.tasks.spawn(async move { signals.run(stop).await });

        if let Err(e) = self.bootstrap().await {
            error!("Startup aborted: {}", e);
            self.shutdown().await;
            return Err(e);
        }

        info!(
            "Syncer {} running in group {}",
            self.config.node_name, self.config.cluster_name
        );
        self.stop.cancelled().await;
        info!("Stop requested, shutting down");
        self.shutdown().await;
        match self.failure.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn bootstrap(&self) -> SyncResult<()> {
        self.start_module(self.agent.clone()).await?;

        let local = self.agent.local_member();
        let members = self.agent.group_members(&self.config.cluster_name);
        let cluster = configure_cluster(
            &local,
            &members,
            self.config.cluster_port,
            &self.config.cluster_name,
        )?;
        info!("Storage cluster: {}", cluster.initial_cluster);
        self.storage.configure(cluster);
        self.start_module(self.storage.clone()).await?;

        self.start_module(self.rpc.clone()).await?;
        if let Some(addr) = self.rpc.local_addr() {
            if local.rpc_port() != Some(addr.port()) {
                self.agent.set_tag(TAG_RPC_PORT, addr.port().to_string());
            }
        }

        let engine = self.storage.engine()?;
        self.worker.bind_storage(Arc::new(Reconciler::new(engine)));
        self.agent.register_event_handler(self.worker_handler.clone());

        self.watch(self.agent.clone());
        self.watch(self.storage.clone());
        self.watch(self.rpc.clone());

        self.ticker.start(&self.tasks);
        Ok(())
    }

    async fn start_module<M: Module>(&self, module: Arc<M>) -> SyncResult<()> {
        info!("Starting module {}", module.name());
        module.clone().start(&self.tasks);
        tokio::select! {
            _ = self.stop.cancelled() => Err(SyncError::Stopped),
            ready = module.ready() => ready,
        }
    }

    /// A module error after startup stops the whole process
    fn watch<M: Module>(&self, module: Arc<M>) {
        let stop = self.stop.clone();
        let failure = self.failure.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                failed = module.error() => {
                    if let Some(e) = failed {
                        error!("{}", e);
                        let mut first = failure.lock();
                        if first.is_none() {
                            *first = Some(e);
                        }
                        drop(first);
                        stop.cancel();
                    }
                }
            }
        });
    }

    /// Idempotent.
    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.cancel();

        self.ticker.stop();
        self.agent.deregister_event_handler(&self.worker_handler);
        self.agent.stop().await;
        self.rpc.stop().await;
        self.worker.unbind_storage().await;
        self.storage.stop().await;

        self.tasks.close_and_wait().await;
        info!("Shutdown complete");
    }

    /// Requests shutdown; `run` returns once it completes.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn module_states(&self) -> Vec<(&'static str, ModuleState)> {
        vec![
            (self.agent.name(), self.agent.lifecycle().state()),
            (self.storage.name(), self.storage.lifecycle().state()),
            (self.rpc.name(), self.rpc.lifecycle().state()),
        ]
    }

    pub fn config(&self) -> &SyncerConfig {
        &self.config
    }

    pub fn agent(&self) -> &Arc<MembershipAgent> {
        &self.agent
    }

    pub fn rpc(&self) -> &Arc<SyncServer> {
        &self.rpc
    }

    pub fn worker(&self) -> &Arc<SyncWorker> {
        &self.worker
    }
}
