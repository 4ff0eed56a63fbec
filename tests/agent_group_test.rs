//! Agent group behavior against real loopback transports.
//!
//! Peers that need their link manipulated go through a small TCP proxy, so
//! tests can drop and restore connectivity without touching the agent
//! process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slog::Logger;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;

use groundwork::error::Result;
use groundwork::rpc::{
    AgentGroup, AgentGroupConfig, AgentServer, AgentServerConfig, CommandExecutor, Credentials,
    Peer, ReconnectStrategy, StopBackoff, WatchEvent,
};

fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

/// Echoes every command back as "<args> output".
struct EchoExecutor;

#[async_trait]
impl CommandExecutor for EchoExecutor {
    async fn execute(&self, args: &[String], output: mpsc::Sender<Vec<u8>>) -> Result<()> {
        let response = format!("{} output", args.join(" "));
        let _ = output.send(response.into_bytes()).await;
        Ok(())
    }
}

async fn start_agent() -> AgentServer {
    AgentServer::bind(
        "127.0.0.1:0",
        AgentServerConfig {
            executor: Arc::new(EchoExecutor),
            tls: None,
            logger: test_logger(),
        },
    )
    .await
    .expect("agent server should bind")
}

/// A TCP link that can be dropped and re-established on the same address.
struct Proxy {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_handle: JoinHandle<()>,
}

impl Proxy {
    async fn start(listen_addr: &str, upstream: SocketAddr) -> Proxy {
        // Reuse the address so a restarted proxy can take over the same
        // endpoint while old links linger in TIME_WAIT
        let socket = TcpSocket::new_v4().expect("proxy socket");
        socket.set_reuseaddr(true).expect("reuseaddr");
        socket
            .bind(listen_addr.parse().expect("proxy listen addr"))
            .expect("proxy should bind");
        let listener = socket.listen(64).expect("proxy should listen");
        let addr = listener.local_addr().expect("proxy local addr");
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let conn_shutdown_rx = shutdown_rx.clone();
        let accept_handle = tokio::spawn(async move {
            let mut conns = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        let Ok((inbound, _)) = accepted else { break };
                        conns.spawn(forward(inbound, upstream, conn_shutdown_rx.clone()));
                    }
                }
            }
            // Kill active links so the peer observes the outage
            conns.shutdown().await;
        });
        Proxy {
            addr,
            shutdown_tx,
            accept_handle,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Drops the link. The listen address is free again once this returns.
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.accept_handle.await;
    }
}

async fn forward(mut inbound: TcpStream, upstream: SocketAddr, mut shutdown_rx: watch::Receiver<bool>) {
    let Ok(mut outbound) = TcpStream::connect(upstream).await else {
        return;
    };
    tokio::select! {
        _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
        _ = shutdown_rx.changed() => {}
    }
}

fn group_config(watch_tx: mpsc::Sender<WatchEvent>, health_check_timeout: Duration) -> AgentGroupConfig {
    let mut config = AgentGroupConfig::new(test_logger());
    config.health_check_timeout = health_check_timeout;
    config.watch_tx = Some(watch_tx);
    config
}

async fn expect_event(watch_rx: &mut mpsc::Receiver<WatchEvent>, deadline: Duration) -> WatchEvent {
    timeout(deadline, watch_rx.recv())
        .await
        .expect("timed out waiting for watch event")
        .expect("watch channel closed")
}

#[tokio::test]
async fn no_event_for_unreachable_peer() {
    let (watch_tx, mut watch_rx) = mpsc::channel(2);
    let check_timeout = Duration::from_millis(100);
    let group = AgentGroup::new(
        group_config(watch_tx, check_timeout),
        vec![Peer::new("198.51.100.1:6767", Credentials::insecure())],
    )
    .expect("group");
    group.start().await;

    // The peer is non-routable, so no successful connect may surface
    assert!(
        timeout(check_timeout, watch_rx.recv()).await.is_err(),
        "unexpected connect"
    );
    group.close().await;
}

#[tokio::test]
async fn executes_commands_remotely() {
    let agent1 = start_agent().await;
    let agent2 = start_agent().await;
    let agent2_addr = agent2.addr().to_string();

    let (watch_tx, mut watch_rx) = mpsc::channel(2);
    let group = AgentGroup::new(
        group_config(watch_tx, Duration::from_millis(100)),
        vec![
            Peer::new(agent1.addr().to_string(), Credentials::insecure()),
            Peer::new(agent2_addr.clone(), Credentials::insecure()),
        ],
    )
    .expect("group");
    group.start().await;

    for _ in 0..2 {
        let event = expect_event(&mut watch_rx, Duration::from_secs(60)).await;
        assert!(event.client.is_some(), "expected successful connect");
    }

    let mut buf = Vec::new();
    group
        .with_peer(&agent2_addr)
        .command(&test_logger(), &mut buf, &["test".to_string()])
        .await
        .expect("command should run");
    assert_eq!(String::from_utf8(buf).expect("utf8 output"), "test output");

    group.close().await;
    agent1.stop().await;
    agent2.stop().await;
}

#[tokio::test]
async fn reconnects_after_link_recovery() {
    let agent = start_agent().await;
    let proxy = Proxy::start("127.0.0.1:0", agent.addr()).await;
    let proxy_addr = proxy.addr().to_string();

    let check_timeout = Duration::from_millis(100);
    let (watch_tx, mut watch_rx) = mpsc::channel(8);
    let group = AgentGroup::new(
        group_config(watch_tx, check_timeout),
        vec![Peer::new(proxy_addr.clone(), Credentials::insecure())],
    )
    .expect("group");
    group.start().await;

    let event = expect_event(&mut watch_rx, Duration::from_secs(5)).await;
    assert!(event.client.is_some(), "expected initial connect");

    // Drop the link and give the transport enough time to fail
    proxy.stop().await;
    tokio::time::sleep(check_timeout).await;

    let event = expect_event(&mut watch_rx, Duration::from_secs(5)).await;
    assert!(event.error.is_some(), "expected health check failure");

    // While disconnected, commands surface the transport error code
    let mut sink = Vec::new();
    let err = group
        .with_peer(&proxy_addr)
        .command(&test_logger(), &mut sink, &["test".to_string()])
        .await
        .expect_err("command should fail while disconnected");
    let code = err.status().expect("transport error").code();
    assert!(
        code == tonic::Code::Unavailable || code == tonic::Code::Unknown,
        "unexpected code {:?}",
        code
    );

    // Restore the link on the same address
    let proxy = Proxy::start(&proxy_addr, agent.addr()).await;

    let event = loop {
        let event = expect_event(&mut watch_rx, Duration::from_secs(5)).await;
        if event.client.is_some() {
            break event;
        }
    };
    assert_eq!(event.peer.addr(), proxy_addr);

    let mut buf = Vec::new();
    group
        .with_peer(&proxy_addr)
        .command(&test_logger(), &mut buf, &["test".to_string()])
        .await
        .expect("command should run after reconnect");
    assert_eq!(String::from_utf8(buf).expect("utf8 output"), "test output");

    group.close().await;
    proxy.stop().await;
    agent.stop().await;
}

#[tokio::test]
async fn evicts_peer_it_cannot_reconnect() {
    let agent = start_agent().await;
    let proxy = Proxy::start("127.0.0.1:0", agent.addr()).await;

    let check_timeout = Duration::from_millis(100);
    let (watch_tx, mut watch_rx) = mpsc::channel(4);
    let mut config = group_config(watch_tx, check_timeout);
    // Do not try to reconnect
    config.reconnect_strategy = ReconnectStrategy {
        backoff: Arc::new(|| Box::new(StopBackoff)),
        should_reconnect: Arc::new(|_| true),
    };
    let group = AgentGroup::new(
        config,
        vec![Peer::new(proxy.addr().to_string(), Credentials::insecure())],
    )
    .expect("group");
    group.start().await;

    let event = expect_event(&mut watch_rx, Duration::from_secs(5)).await;
    assert!(event.client.is_some(), "expected initial connect");

    proxy.stop().await;
    tokio::time::sleep(check_timeout).await;

    // Health check failure, then the eviction with no client attached
    let event = expect_event(&mut watch_rx, Duration::from_secs(5)).await;
    assert!(event.error.is_some(), "expected failure event");
    let event = expect_event(&mut watch_rx, Duration::from_secs(5)).await;
    assert!(event.error.is_some(), "expected eviction event");
    assert!(event.client.is_none());
    assert_eq!(group.num_peers().await, 0);

    group.close().await;
    agent.stop().await;
}
