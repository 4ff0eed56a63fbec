use std::sync::Arc;

use clap::Parser;
use slog::{crit, info, o, Drain, Logger};

use groundwork::rpc::{AgentServer, AgentServerConfig, LocalExecutor};
use groundwork::signals::{watch_termination_signals, Stoppable};
use groundwork::Result;

/// Runs the node agent: executes commands dispatched by the installer and
/// answers health checks.
#[derive(Parser)]
#[command(name = "groundwork-agent", about = "Cluster node agent")]
struct Args {
    /// Address to listen on for agent RPC
    #[arg(long, default_value = "0.0.0.0:3012")]
    listen_addr: String,

    /// Enable verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let logger = terminal_logger(args.debug);
    if let Err(err) = run(args, logger.clone()).await {
        crit!(logger, "Agent failed."; "error" => %err);
        std::process::exit(err.exit_code());
    }
}

async fn run(args: Args, logger: Logger) -> Result<()> {
    let server = AgentServer::bind(
        &args.listen_addr,
        AgentServerConfig {
            executor: Arc::new(LocalExecutor),
            tls: None,
            logger: logger.clone(),
        },
    )
    .await?;
    info!(logger, "Agent listening."; "addr" => server.addr().to_string());

    let handler = watch_termination_signals(
        logger.clone(),
        || {},
        Stoppable::Graceful(Box::new(server)),
    );
    handler.done().await;
    handler.close().await;
    Ok(())
}

fn terminal_logger(debug: bool) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = drain
        .filter_level(if debug {
            slog::Level::Debug
        } else {
            slog::Level::Info
        })
        .fuse();
    Logger::root(drain, o!())
}
