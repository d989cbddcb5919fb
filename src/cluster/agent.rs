//! Gossip membership agent
//!
//! Every member keeps a full membership table and periodically pushes it to
//! a few random live peers, which answer with theirs (push-pull). A member
//! is alive as long as its heartbeat counter keeps advancing somewhere in
//! the mesh.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::GossipConfig;
use super::health::HealthMonitor;
use super::node::{Member, MemberStatus, TAG_CLUSTER};
use super::state::{MemberEvent, MemberTable};
use super::transport::{self, GossipMessage};
use crate::lifecycle::{Lifecycle, Module, TaskPool};

/// Peers contacted per gossip round
const GOSSIP_FANOUT: usize = 3;

/// Receives membership changes. Called synchronously from the gossip
/// tasks, so implementations must not block.
pub trait MemberEventHandler: Send + Sync {
    fn handle_event(&self, event: &MemberEvent);
}

pub struct MembershipAgent {
    lifecycle: Lifecycle,
    config: GossipConfig,
    table: Arc<MemberTable>,
    health: HealthMonitor,
    handlers: RwLock<Vec<Arc<dyn MemberEventHandler>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    stopping: AtomicBool,
    shutdown: CancellationToken,
}

impl MembershipAgent {
    pub fn new(config: GossipConfig) -> Self {
        let port = config
            .bind_addr
            .parse::<SocketAddr>()
            .map(|addr| addr.port())
            .unwrap_or(0);
        let mut local = Member::new(config.node_name.clone(), config.advertise_addr.clone(), port)
            .with_tag(TAG_CLUSTER, config.group.clone());
        for (key, value) in &config.tags {
            local.tags.insert(key.clone(), value.clone());
        }

        let table = Arc::new(MemberTable::new(local));
        let health = HealthMonitor::new(config.health.clone(), table.clone());

        Self {
            lifecycle: Lifecycle::new("membership"),
            config,
            table,
            health,
            handlers: RwLock::new(Vec::new()),
            local_addr: Mutex::new(None),
            stopping: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn local_member(&self) -> Member {
        self.table.local()
    }

    /// Live members of `group`, self included. Empty until gossip has
    /// converged enough to know about anyone in the group.
    pub fn group_members(&self, group: &str) -> Vec<Member> {
        self.table.group_members(group)
    }

    pub fn members(&self) -> Vec<Member> {
        self.table.members()
    }

    pub fn group(&self) -> &str {
        &self.config.group
    }

    /// Gossip address actually bound, once ready
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Changes a local tag; peers pick it up with the next heartbeat
    pub fn set_tag(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        self.table.update_local(|m| {
            m.tags.insert(key.to_string(), value);
            m.heartbeat += 1;
        });
    }

    pub fn register_event_handler(&self, handler: Arc<dyn MemberEventHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn deregister_event_handler(&self, handler: &Arc<dyn MemberEventHandler>) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        handlers.len() != before
    }

    fn emit(&self, events: Vec<MemberEvent>) {
        if events.is_empty() {
            return;
        }
        let handlers = self.handlers.read().clone();
        for event in events {
            info!("{}: {}", event.kind(), event.member().name);
            for handler in &handlers {
                handler.handle_event(&event);
            }
        }
    }

    async fn join_seeds(&self) -> usize {
        let local = self.table.local();
        let own = self.local_addr().map(|addr| addr.to_string());
        let seeds: Vec<&String> = self
            .config
            .seeds
            .iter()
            .filter(|seed| own.as_deref() != Some(seed.as_str()))
            .collect();

        let msg = GossipMessage::Join { member: local };
        let replies = join_all(
            seeds
                .iter()
                .map(|seed| transport::exchange(seed, &msg, self.config.exchange_timeout)),
        )
        .await;

        let mut joined = 0;
        for (seed, reply) in seeds.iter().zip(replies) {
            match reply {
                Ok(GossipMessage::Members { members }) => {
                    joined += 1;
                    let events = self.table.merge_all(members);
                    self.emit(events);
                }
                Ok(other) => warn!("Seed {} answered join with {:?}", seed, other),
                Err(e) => warn!("Failed to join via seed {}: {:#}", seed, e),
            }
        }
        joined
    }

    async fn gossip_round(&self) {
        let local = self.table.bump_local();
        let events = self.health.check_members();
        self.emit(events);

        let peers = self.table.live_peers();
        if peers.is_empty() {
            if !self.config.seeds.is_empty() {
                debug!("No live peers, retrying seeds");
                self.join_seeds().await;
            }
            return;
        }

        let targets: Vec<Member> = peers
            .choose_multiple(&mut rand::thread_rng(), GOSSIP_FANOUT)
            .cloned()
            .collect();
        let msg = GossipMessage::Gossip {
            from: local.name,
            members: self.table.members(),
        };

        let replies = join_all(targets.iter().map(|peer| {
            let addr = peer.gossip_addr();
            let msg = &msg;
            async move { transport::exchange(&addr, msg, self.config.exchange_timeout).await }
        }))
        .await;

        for (peer, reply) in targets.iter().zip(replies) {
            match reply {
                Ok(GossipMessage::Members { members }) => {
                    let events = self.table.merge_all(members);
                    self.emit(events);
                }
                Ok(_) => {}
                Err(e) => debug!("Gossip to {} failed: {:#}", peer.name, e),
            }
        }
    }

    /// Answers one request. A peer gets `exchange_timeout` to send it, and
    /// shutdown abandons the exchange.
    async fn handle_connection(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let limit = self.config.exchange_timeout;
        let request = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            read = tokio::time::timeout(limit, transport::read_frame(&mut stream)) => {
                read.map_err(|_| anyhow::anyhow!("no request within {:?}", limit))??
            }
        };

        let reply = match request {
            GossipMessage::Join { member } => {
                debug!("Join request from {}", member.name);
                let events = self.table.merge(member).into_iter().collect();
                self.emit(events);
                GossipMessage::Members {
                    members: self.table.members(),
                }
            }
            GossipMessage::Gossip { members, .. } => {
                let events = self.table.merge_all(members);
                self.emit(events);
                GossipMessage::Members {
                    members: self.table.members(),
                }
            }
            GossipMessage::Leave { member } => {
                let events = self.table.merge(member).into_iter().collect();
                self.emit(events);
                GossipMessage::Ack
            }
            GossipMessage::Members { .. } | GossipMessage::Ack => GossipMessage::Ack,
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(()),
            written = tokio::time::timeout(limit, transport::write_frame(&mut stream, &reply)) => {
                written.map_err(|_| anyhow::anyhow!("reply not sent within {:?}", limit))?
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, pool: TaskPool) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let agent = self.clone();
                    pool.spawn(async move {
                        if let Err(e) = agent.handle_connection(stream).await {
                            debug!("Gossip connection from {} failed: {:#}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Failed to accept gossip connection: {}", e),
            }
        }
        debug!("Gossip accept loop exited");
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.gossip_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; the join already gossiped
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => self.gossip_round().await,
            }
        }
        debug!("Gossip loop exited");
    }

    async fn broadcast_leave(&self) {
        let local = self.table.update_local(|m| {
            m.heartbeat += 1;
            m.status = MemberStatus::Left;
        });
        let msg = GossipMessage::Leave { member: local };
        let peers = self.table.live_peers();
        join_all(peers.iter().map(|peer| {
            let addr = peer.gossip_addr();
            let msg = &msg;
            async move {
                if let Err(e) = transport::exchange(&addr, msg, self.config.exchange_timeout).await {
                    debug!("Leave notice to {} failed: {:#}", addr, e);
                }
            }
        }))
        .await;
    }
}

#[async_trait]
impl Module for MembershipAgent {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn start(self: Arc<Self>, pool: &TaskPool) {
        if !self.lifecycle.mark_starting() {
            return;
        }
        let task_pool = pool.clone();
        pool.spawn(async move {
            let listener = match TcpListener::bind(&self.config.bind_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    self.lifecycle
                        .fail(format!("failed to bind {}: {}", self.config.bind_addr, e));
                    return;
                }
            };
            if let Ok(addr) = listener.local_addr() {
                *self.local_addr.lock() = Some(addr);
                self.table.update_local(|m| m.gossip_port = addr.port());
            }
            info!(
                "Gossip agent {} listening on {}",
                self.config.node_name, self.config.bind_addr
            );
            task_pool.spawn(self.clone().accept_loop(listener, task_pool.clone()));

            if !self.config.seeds.is_empty() {
                let joined = self.join_seeds().await;
                if joined == 0 {
                    warn!("No seed answered, waiting for peers to find us");
                }
            }

            self.lifecycle.mark_ready();
            self.gossip_loop().await;
        });
    }

    async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.local_addr().is_some() {
            self.broadcast_leave().await;
        }
        self.shutdown.cancel();
        self.lifecycle.mark_stopped();
        info!("Gossip agent {} stopped", self.config.node_name);
    }
}
