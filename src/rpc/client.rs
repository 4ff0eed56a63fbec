//! Agent transport client.

use std::time::Duration;

use slog::{debug, Logger};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::Status;

use crate::error::{Error, Result};
use crate::rpc::proto::agent_client::AgentClient as GrpcAgentClient;
use crate::rpc::proto::{CommandRequest, HealthCheckRequest};

/// Client-side credentials for the agent transport.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    /// TLS configuration; absent for plaintext transports (tests only)
    pub tls: Option<ClientTlsConfig>,
}

impl Credentials {
    pub fn insecure() -> Self {
        Self { tls: None }
    }

    pub fn with_tls(tls: ClientTlsConfig) -> Self {
        Self { tls: Some(tls) }
    }
}

/// A connected client to a single agent.
#[derive(Clone, Debug)]
pub struct AgentClient {
    inner: GrpcAgentClient<Channel>,
    addr: String,
}

impl AgentClient {
    /// Establishes an authenticated channel to the agent at addr, bounded by
    /// dial_timeout.
    pub async fn connect(addr: &str, creds: &Credentials, dial_timeout: Duration) -> Result<Self> {
        let scheme = if creds.tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{}://{}", scheme, addr))
            .map_err(Error::Transport)?
            .connect_timeout(dial_timeout);
        if let Some(tls) = &creds.tls {
            endpoint = endpoint.tls_config(tls.clone()).map_err(Error::Transport)?;
        }
        let channel = endpoint.connect().await.map_err(Error::Transport)?;
        Ok(Self {
            inner: GrpcAgentClient::new(channel),
            addr: addr.to_string(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Fast liveness probe bounded by deadline.
    pub async fn health_check(&self, deadline: Duration) -> Result<()> {
        let mut client = self.inner.clone();
        let probe = client.health_check(HealthCheckRequest {});
        match tokio::time::timeout(deadline, probe).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(status)) => Err(Error::Rpc(status)),
            Err(_) => Err(Error::Rpc(Status::deadline_exceeded(format!(
                "health check to {} timed out",
                self.addr
            )))),
        }
    }

    /// Runs a command on the agent, copying the streamed output into writer
    /// until the stream ends.
    pub async fn command<W>(&self, logger: &Logger, writer: &mut W, args: &[String]) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        debug!(logger, "Executing remote command."; "peer" => &self.addr, "args" => format!("{:?}", args));
        let mut client = self.inner.clone();
        let mut stream = client
            .command(CommandRequest { args: args.to_vec() })
            .await
            .map_err(Error::Rpc)?
            .into_inner();
        while let Some(output) = stream.message().await.map_err(Error::Rpc)? {
            writer.write_all(&output.chunk).await.map_err(Error::Io)?;
        }
        Ok(())
    }
}
