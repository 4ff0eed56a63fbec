//! Reconnecting agent peer registry.
//!
//! The installer and updater stream commands to a dynamic set of remote
//! agents. Peers can drop out mid-operation; the group keeps working with
//! the remaining peers, recovers the rest on the configured cadence and
//! evicts those whose retry budget runs out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use slog::{debug, info, o, warn, Logger};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tonic::Status;

use crate::defaults;
use crate::error::{Error, Result};
use crate::rpc::backoff::{Backoff, ExponentialBackoff};
use crate::rpc::client::{AgentClient, Credentials};

/// A remote agent reachable at a network address. Peer identity is the
/// address.
#[derive(Clone, Debug)]
pub struct Peer {
    addr: String,
    creds: Credentials,
}

impl Peer {
    pub fn new(addr: impl Into<String>, creds: Credentials) -> Self {
        Self {
            addr: addr.into(),
            creds,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

/// Emitted on every externally observable peer transition: a successful
/// (re)connect carries a client, a failure carries the error, an eviction
/// carries the error with no client.
#[derive(Debug)]
pub struct WatchEvent {
    pub peer: Peer,
    pub client: Option<AgentClient>,
    pub error: Option<Error>,
}

/// Governs recovery of unreachable peers.
pub struct ReconnectStrategy {
    /// Produces a fresh pacing policy for each reconnect episode
    pub backoff: Arc<dyn Fn() -> Box<dyn Backoff> + Send + Sync>,
    /// Decides whether the connect error is worth another attempt; returning
    /// false evicts the peer
    pub should_reconnect: Arc<dyn Fn(&Error) -> bool + Send + Sync>,
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self {
            backoff: Arc::new(|| Box::new(ExponentialBackoff::default())),
            should_reconnect: Arc::new(|_| true),
        }
    }
}

/// Agent group configuration.
pub struct AgentGroupConfig {
    /// Health-check cadence and per-probe deadline
    pub health_check_timeout: Duration,
    /// Bound on establishing a transport to a peer
    pub dial_timeout: Duration,
    pub reconnect_strategy: ReconnectStrategy,
    /// Receives peer transition events. Sends are best effort: when the
    /// buffer is full the event is dropped, so give the channel a capacity
    /// of at least a couple of events per peer.
    pub watch_tx: Option<mpsc::Sender<WatchEvent>>,
    pub logger: Logger,
}

impl AgentGroupConfig {
    pub fn new(logger: Logger) -> Self {
        Self {
            health_check_timeout: defaults::HEALTH_CHECK_TIMEOUT,
            dial_timeout: defaults::DIAL_TIMEOUT,
            reconnect_strategy: ReconnectStrategy::default(),
            watch_tx: None,
            logger,
        }
    }
}

enum PeerState {
    /// Initial connect has not succeeded yet
    Connecting,
    Connected(AgentClient),
    /// Lost its transport; the monitor is trying to get it back
    Reconnecting { last_error: Status },
}

struct GroupInner {
    /// Peer state keyed by address
    peers: RwLock<HashMap<String, PeerState>>,
    health_check_timeout: Duration,
    dial_timeout: Duration,
    reconnect_strategy: ReconnectStrategy,
    /// Dropped last during close so subscribers observe every event of the
    /// shutdown
    watch_tx: Mutex<Option<mpsc::Sender<WatchEvent>>>,
    shutdown_rx: watch::Receiver<bool>,
    logger: Logger,
}

/// A set of remote agents with automatic health checking, reconnection and
/// eviction.
pub struct AgentGroup {
    inner: Arc<GroupInner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
    /// Peers registered before start
    pending: Mutex<Vec<Peer>>,
    started: AtomicBool,
}

impl AgentGroup {
    /// Creates a group over the initial peers. Connections are not attempted
    /// until start.
    pub fn new(config: AgentGroupConfig, initial_peers: Vec<Peer>) -> Result<Self> {
        if config.health_check_timeout.is_zero() {
            return Err(Error::BadParameter(
                "health check timeout must be positive".to_string(),
            ));
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut peers = HashMap::new();
        for peer in &initial_peers {
            peers.insert(peer.addr().to_string(), PeerState::Connecting);
        }
        let inner = Arc::new(GroupInner {
            peers: RwLock::new(peers),
            health_check_timeout: config.health_check_timeout,
            dial_timeout: config.dial_timeout,
            reconnect_strategy: config.reconnect_strategy,
            watch_tx: Mutex::new(config.watch_tx),
            shutdown_rx,
            logger: config.logger,
        });
        Ok(Self {
            inner,
            shutdown_tx,
            tasks: Mutex::new(JoinSet::new()),
            pending: Mutex::new(initial_peers),
            started: AtomicBool::new(false),
        })
    }

    /// Begins asynchronous connects for all registered peers.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let peers = std::mem::take(&mut *self.pending.lock().await);
        let mut tasks = self.tasks.lock().await;
        for peer in peers {
            tasks.spawn(monitor_peer(self.inner.clone(), peer));
        }
    }

    /// Registers another peer. Adding a peer already present is a no-op.
    pub async fn add_peer(&self, peer: Peer) {
        {
            let mut peers = self.inner.peers.write().await;
            if peers.contains_key(peer.addr()) {
                return;
            }
            peers.insert(peer.addr().to_string(), PeerState::Connecting);
        }
        if self.started.load(Ordering::SeqCst) {
            self.tasks.lock().await.spawn(monitor_peer(self.inner.clone(), peer));
        } else {
            self.pending.lock().await.push(peer);
        }
    }

    /// Number of peers currently in the group. Decreases on eviction.
    pub async fn num_peers(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    /// A handle bound to the peer at addr for command dispatch.
    pub fn with_peer(&self, addr: &str) -> AgentHandle {
        AgentHandle {
            inner: self.inner.clone(),
            addr: addr.to_string(),
        }
    }

    /// Stops health checking, cancels outstanding reconnects, waits for all
    /// peer monitors to finish and closes the watch channel last.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        self.inner.watch_tx.lock().await.take();
    }
}

/// Command dispatch bound to a single peer.
pub struct AgentHandle {
    inner: Arc<GroupInner>,
    addr: String,
}

impl AgentHandle {
    /// Runs a command on the bound peer, streaming output into writer. When
    /// the peer is not connected, returns its last transport error.
    pub async fn command<W>(&self, logger: &Logger, writer: &mut W, args: &[String]) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let client = {
            let peers = self.inner.peers.read().await;
            match peers.get(&self.addr) {
                Some(PeerState::Connected(client)) => Ok(client.clone()),
                Some(PeerState::Reconnecting { last_error }) => Err(Error::Rpc(last_error.clone())),
                Some(PeerState::Connecting) => Err(Error::Rpc(Status::unavailable(format!(
                    "agent {} is not connected",
                    self.addr
                )))),
                None => Err(Error::NotFound(format!("peer {} not found", self.addr))),
            }
        }?;
        client.command(logger, writer, args).await
    }
}

/// Owns the full lifecycle of one peer. Health checks cannot race a
/// reconnect: both run on this task.
async fn monitor_peer(inner: Arc<GroupInner>, peer: Peer) {
    let logger = inner.logger.new(o!("peer" => peer.addr().to_string()));
    let mut shutdown_rx = inner.shutdown_rx.clone();

    let mut client = match reconnect(&inner, &peer, &logger, &mut shutdown_rx).await {
        Some(client) => client,
        None => return,
    };
    set_connected(&inner, &peer, &client).await;
    emit(
        &inner,
        WatchEvent {
            peer: peer.clone(),
            client: Some(client.clone()),
            error: None,
        },
    )
    .await;

    let period = inner.health_check_timeout;
    let mut probes = interval_at(Instant::now() + period, period);
    probes.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = probes.tick() => {
                match client.health_check(inner.health_check_timeout).await {
                    Ok(()) => {}
                    Err(err) => {
                        warn!(logger, "Health check failed."; "error" => %err);
                        set_reconnecting(&inner, &peer, status_of(&err)).await;
                        emit(&inner, WatchEvent {
                            peer: peer.clone(),
                            client: None,
                            error: Some(err),
                        }).await;
                        client = match reconnect(&inner, &peer, &logger, &mut shutdown_rx).await {
                            Some(client) => client,
                            None => return,
                        };
                        set_connected(&inner, &peer, &client).await;
                        info!(logger, "Reconnected.");
                        emit(&inner, WatchEvent {
                            peer: peer.clone(),
                            client: Some(client.clone()),
                            error: None,
                        }).await;
                        probes.reset();
                    }
                }
            }
        }
    }
}

/// Connects with the configured pacing until success, eviction or shutdown.
/// Failed attempts are not externally observable: no client was ever handed
/// out for this episode, so no event is emitted until the episode resolves.
async fn reconnect(
    inner: &Arc<GroupInner>,
    peer: &Peer,
    logger: &Logger,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<AgentClient> {
    let mut backoff = (inner.reconnect_strategy.backoff)();
    loop {
        if *shutdown_rx.borrow() {
            return None;
        }
        let attempt = AgentClient::connect(peer.addr(), &peer.creds, inner.dial_timeout);
        let result = tokio::select! {
            _ = shutdown_rx.changed() => return None,
            result = attempt => result,
        };
        match result {
            Ok(client) => return Some(client),
            Err(err) => {
                debug!(logger, "Connect attempt failed."; "error" => %err);
                if !(inner.reconnect_strategy.should_reconnect)(&err) {
                    evict(inner, peer, err).await;
                    return None;
                }
                match backoff.next_backoff() {
                    Some(pause) => {
                        tokio::select! {
                            _ = shutdown_rx.changed() => return None,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                    None => {
                        evict(inner, peer, err).await;
                        return None;
                    }
                }
            }
        }
    }
}

/// Eviction is permanent: the peer leaves the group before the final failure
/// event is emitted, so observers of the event see the reduced group.
async fn evict(inner: &Arc<GroupInner>, peer: &Peer, err: Error) {
    inner.peers.write().await.remove(peer.addr());
    warn!(inner.logger, "Evicting unreachable peer."; "peer" => peer.addr().to_string(), "error" => %err);
    emit(
        inner,
        WatchEvent {
            peer: peer.clone(),
            client: None,
            error: Some(err),
        },
    )
    .await;
}

async fn set_connected(inner: &Arc<GroupInner>, peer: &Peer, client: &AgentClient) {
    if let Some(state) = inner.peers.write().await.get_mut(peer.addr()) {
        *state = PeerState::Connected(client.clone());
    }
}

async fn set_reconnecting(inner: &Arc<GroupInner>, peer: &Peer, last_error: Status) {
    if let Some(state) = inner.peers.write().await.get_mut(peer.addr()) {
        *state = PeerState::Reconnecting { last_error };
    }
}

fn status_of(err: &Error) -> Status {
    match err.status() {
        Some(status) => status.clone(),
        None => Status::unavailable(err.to_string()),
    }
}

async fn emit(inner: &Arc<GroupInner>, event: WatchEvent) {
    if let Some(watch_tx) = inner.watch_tx.lock().await.as_ref() {
        match watch_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!(inner.logger, "Watch channel full, dropping event."; "peer" => event.peer.addr().to_string());
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn duplicate_peer_is_not_registered_twice() {
        let group = AgentGroup::new(
            AgentGroupConfig::new(test_logger()),
            vec![Peer::new("192.0.2.1:6767", Credentials::insecure())],
        )
        .expect("group");

        assert_eq!(group.num_peers().await, 1);
        group.add_peer(Peer::new("192.0.2.1:6767", Credentials::insecure())).await;
        assert_eq!(group.num_peers().await, 1);
        group.add_peer(Peer::new("192.0.2.2:6767", Credentials::insecure())).await;
        assert_eq!(group.num_peers().await, 2);
        group.close().await;
    }

    #[tokio::test]
    async fn command_to_unknown_peer_is_not_found() {
        let group = AgentGroup::new(AgentGroupConfig::new(test_logger()), vec![]).expect("group");
        let mut sink = Vec::new();
        let err = group
            .with_peer("192.0.2.9:6767")
            .command(&test_logger(), &mut sink, &["test".to_string()])
            .await
            .expect_err("unknown peer");
        assert!(err.is_not_found());
        group.close().await;
    }

    #[tokio::test]
    async fn command_to_unconnected_peer_is_unavailable() {
        let group = AgentGroup::new(
            AgentGroupConfig::new(test_logger()),
            vec![Peer::new("192.0.2.1:6767", Credentials::insecure())],
        )
        .expect("group");
        let mut sink = Vec::new();
        let err = group
            .with_peer("192.0.2.1:6767")
            .command(&test_logger(), &mut sink, &["test".to_string()])
            .await
            .expect_err("not connected");
        let status = err.status().expect("transport error");
        assert_eq!(status.code(), tonic::Code::Unavailable);
        group.close().await;
    }

    #[tokio::test]
    async fn zero_health_check_timeout_is_rejected() {
        let mut config = AgentGroupConfig::new(test_logger());
        config.health_check_timeout = Duration::ZERO;
        match AgentGroup::new(config, vec![]) {
            Ok(_) => panic!("config should be rejected"),
            Err(err) => assert!(err.is_bad_parameter()),
        }
    }
}
