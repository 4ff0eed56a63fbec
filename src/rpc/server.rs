//! Serving side of the agent protocol.
//!
//! An agent runs on every node taking part in an operation. It executes the
//! commands the installer dispatches to it and answers health checks.

use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use slog::{info, o, warn, Logger};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::{Server, ServerTlsConfig};
use tonic::{Request, Response, Status};

use crate::error::{Error, Result};
use crate::rpc::proto::agent_server::{Agent, AgentServer as GrpcAgentServer};
use crate::rpc::proto::{CommandOutput, CommandRequest, HealthCheckRequest, HealthCheckResponse};
use crate::signals::Stopper;

/// Executes agent commands, streaming output chunks as they are produced.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, args: &[String], output: mpsc::Sender<Vec<u8>>) -> Result<()>;
}

/// Runs the command as a local process and streams its stdout.
pub struct LocalExecutor;

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn execute(&self, args: &[String], output: mpsc::Sender<Vec<u8>>) -> Result<()> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| Error::BadParameter("no command specified".to_string()))?;
        let mut child = tokio::process::Command::new(program)
            .args(rest)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(Error::Io)?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Other("child process has no stdout".to_string()))?;

        let mut buf = vec![0u8; 4096];
        loop {
            let n = stdout.read(&mut buf).await.map_err(Error::Io)?;
            if n == 0 {
                break;
            }
            if output.send(buf[..n].to_vec()).await.is_err() {
                // Caller went away; stop streaming but let the command finish
                break;
            }
        }

        let status = child.wait().await.map_err(Error::Io)?;
        if !status.success() {
            return Err(Error::ExitCode {
                code: status.code().unwrap_or(255),
                message: format!("command {:?} failed", args),
            });
        }
        Ok(())
    }
}

/// Configuration of an agent server.
pub struct AgentServerConfig {
    pub executor: Arc<dyn CommandExecutor>,
    /// TLS configuration; absent for plaintext transports (tests only)
    pub tls: Option<ServerTlsConfig>,
    pub logger: Logger,
}

/// A running agent server.
pub struct AgentServer {
    addr: SocketAddr,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AgentServer {
    /// Binds listen_addr and starts serving. Returns once the socket is
    /// bound, so the effective address is available immediately.
    pub async fn bind(listen_addr: &str, config: AgentServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await.map_err(Error::Io)?;
        let addr = listener.local_addr().map_err(Error::Io)?;
        let logger = config.logger.new(o!("server" => addr.to_string()));

        let service = AgentService {
            executor: config.executor,
            logger: logger.clone(),
        };
        let mut builder = Server::builder();
        if let Some(tls) = config.tls {
            builder = builder.tls_config(tls).map_err(Error::Transport)?;
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            info!(logger, "Agent server starting.");
            let result = builder
                .add_service(GrpcAgentServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(err) = result {
                warn!(logger, "Agent server terminated."; "error" => %err);
            }
        });

        Ok(Self {
            addr,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting connections and waits for the serve loop to finish.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl Stopper for AgentServer {
    async fn stop(&self) -> Result<()> {
        AgentServer::stop(self).await;
        Ok(())
    }
}

struct AgentService {
    executor: Arc<dyn CommandExecutor>,
    logger: Logger,
}

#[tonic::async_trait]
impl Agent for AgentService {
    type CommandStream = ReceiverStream<std::result::Result<CommandOutput, Status>>;

    async fn command(
        &self,
        request: Request<CommandRequest>,
    ) -> std::result::Result<Response<Self::CommandStream>, Status> {
        let args = request.into_inner().args;
        let (response_tx, response_rx) = mpsc::channel(16);
        let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(16);

        let forward_tx = response_tx.clone();
        tokio::spawn(async move {
            while let Some(chunk) = output_rx.recv().await {
                if forward_tx.send(Ok(CommandOutput { chunk })).await.is_err() {
                    break;
                }
            }
        });

        let executor = self.executor.clone();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            if let Err(err) = executor.execute(&args, output_tx).await {
                warn!(logger, "Command failed."; "args" => format!("{:?}", args), "error" => %err);
                let _ = response_tx.send(Err(Status::unknown(err.to_string()))).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(response_rx)))
    }

    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> std::result::Result<Response<HealthCheckResponse>, Status> {
        Ok(Response::new(HealthCheckResponse {}))
    }
}
