//! Interrupt signal handling.
//!
//! Converts OS termination signals and explicit triggers into an orderly
//! shutdown of a dynamically-registered set of workers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use slog::{info, warn, Logger};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::defaults;
use crate::error::Result;

/// A termination signal the handler listens for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Quit,
    Hangup,
}

impl Signal {
    fn kind(&self) -> SignalKind {
        match self {
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Terminate => SignalKind::terminate(),
            Signal::Quit => SignalKind::quit(),
            Signal::Hangup => SignalKind::hangup(),
        }
    }

    fn raw(&self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Quit => libc::SIGQUIT,
            Signal::Hangup => libc::SIGHUP,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Interrupt => "interrupt",
            Signal::Terminate => "terminate",
            Signal::Quit => "quit",
            Signal::Hangup => "hangup",
        };
        f.write_str(name)
    }
}

/// Signals monitored unless overridden.
pub const DEFAULT_SIGNALS: [Signal; 3] = [Signal::Interrupt, Signal::Terminate, Signal::Quit];

/// A worker that supports graceful termination.
#[async_trait]
pub trait Stopper: Send + Sync {
    /// Gracefully stops the worker.
    async fn stop(&self) -> Result<()>;
}

/// A worker that additionally supports forced termination.
#[async_trait]
pub trait Aborter: Stopper {
    /// Forcefully terminates the worker, discarding in-flight work.
    async fn abort(&self) -> Result<()>;
}

/// A registered worker tagged with its termination capabilities.
pub enum Stoppable {
    /// Supports graceful stop only
    Graceful(Box<dyn Stopper>),
    /// Supports graceful stop and forced abort
    Abortable(Box<dyn Aborter>),
}

impl Stoppable {
    /// Aborts iff the worker has the capability and the handler was
    /// explicitly interrupted; stops otherwise.
    async fn terminate(&self, interrupted: bool) -> Result<()> {
        match self {
            Stoppable::Abortable(worker) if interrupted => worker.abort().await,
            Stoppable::Abortable(worker) => worker.stop().await,
            Stoppable::Graceful(worker) => worker.stop().await,
        }
    }
}

/// Wraps a closure as a graceful stopper.
pub fn stopper_fn<F, Fut>(f: F) -> Box<dyn Stopper>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    struct FnStopper<F>(F);

    #[async_trait]
    impl<F, Fut> Stopper for FnStopper<F>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        async fn stop(&self) -> Result<()> {
            (self.0)().await
        }
    }

    Box::new(FnStopper(f))
}

/// Coordinates process termination.
///
/// The handler forwards monitored signals to the receiver returned from the
/// constructor; the consumer decides policy (usually calling abort on the
/// first signal). Once the handler is cancelled it stops every registered
/// worker within the shutdown window and invokes the parent cancel function.
pub struct InterruptHandler {
    cancel_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
    term_tx: mpsc::UnboundedSender<Stoppable>,
    interrupted: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl InterruptHandler {
    /// Creates a handler monitoring the default signal set. Returns the
    /// handler and the channel delivering each inbound signal exactly once.
    pub fn new(
        logger: Logger,
        parent_cancel: impl FnOnce() + Send + 'static,
    ) -> (Self, mpsc::Receiver<Signal>) {
        Self::with_signals(logger, parent_cancel, DEFAULT_SIGNALS.to_vec())
    }

    /// Creates a handler monitoring the given signals.
    pub fn with_signals(
        logger: Logger,
        parent_cancel: impl FnOnce() + Send + 'static,
        signals: Vec<Signal>,
    ) -> (Self, mpsc::Receiver<Signal>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let (signal_tx, signal_rx) = mpsc::channel(4);
        let (term_tx, term_rx) = mpsc::unbounded_channel();
        let interrupted = Arc::new(AtomicBool::new(false));

        for &sig in &signals {
            spawn_signal_forwarder(sig, signal_tx.clone(), cancel_rx.clone(), logger.clone());
        }

        let handle = tokio::spawn(run_loop(
            signals,
            term_rx,
            cancel_rx.clone(),
            interrupted.clone(),
            Box::new(parent_cancel),
            logger,
        ));

        (
            Self {
                cancel_tx,
                done_rx: cancel_rx,
                term_tx,
                interrupted,
                handle: Mutex::new(Some(handle)),
            },
            signal_rx,
        )
    }

    /// Registers a worker with the termination loop. Once the handler has
    /// shut down the addition is silently dropped.
    pub fn add_stopper(&self, stopper: Stoppable) {
        let _ = self.term_tx.send(stopper);
    }

    /// Resolves once the handler has been cancelled.
    pub async fn done(&self) {
        let mut done_rx = self.done_rx.clone();
        while !*done_rx.borrow() {
            if done_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Marks the handler interrupted and triggers shutdown. Abortable
    /// workers will be aborted rather than stopped.
    pub fn abort(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let _ = self.cancel_tx.send(true);
    }

    /// Triggers shutdown without marking the handler interrupted.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Triggers shutdown and waits until the termination loop has finished.
    pub async fn close(&self) {
        let _ = self.cancel_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

fn spawn_signal_forwarder(
    sig: Signal,
    signal_tx: mpsc::Sender<Signal>,
    mut cancel_rx: watch::Receiver<bool>,
    logger: Logger,
) {
    let mut stream = match signal(sig.kind()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(logger, "Failed to install signal handler."; "signal" => %sig, "error" => %err);
            return;
        }
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                // Exiting only stops forwarding; the termination loop hands
                // the signal back to the kernel when shutdown starts
                _ = cancel_rx.changed() => return,
                received = stream.recv() => match received {
                    Some(()) => {
                        if signal_tx.send(sig).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                },
            }
        }
    });
}

async fn run_loop(
    signals: Vec<Signal>,
    mut term_rx: mpsc::UnboundedReceiver<Stoppable>,
    mut cancel_rx: watch::Receiver<bool>,
    interrupted: Arc<AtomicBool>,
    parent_cancel: Box<dyn FnOnce() + Send>,
    logger: Logger,
) {
    let mut stoppers: Vec<Stoppable> = Vec::new();
    let mut term_open = true;
    loop {
        tokio::select! {
            _ = cancel_rx.changed() => break,
            stopper = term_rx.recv(), if term_open => match stopper {
                Some(stopper) => stoppers.push(stopper),
                None => term_open = false,
            },
        }
    }

    // tokio never deregisters its process-wide handler, so hand the signals
    // back to the kernel: a second one force-kills the process
    for sig in &signals {
        unsafe {
            libc::signal(sig.raw(), libc::SIG_DFL);
        }
    }

    if !stoppers.is_empty() {
        let was_interrupted = interrupted.load(Ordering::SeqCst);
        let deadline = Instant::now() + defaults::SHUTDOWN_TIMEOUT;
        for stopper in &stoppers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, stopper.terminate(was_interrupted)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(logger, "Failed to stop worker."; "error" => %err);
                }
                Err(_) => {
                    warn!(logger, "Timed out waiting for worker to shut down.");
                }
            }
        }
    }
    parent_cancel();
}

/// Stops the provided worker when one of the monitored signals arrives. A
/// convenience wrapper over InterruptHandler: the first signal aborts the
/// handler, which in turn aborts or stops the worker.
pub fn watch_termination_signals(
    logger: Logger,
    parent_cancel: impl FnOnce() + Send + 'static,
    stopper: Stoppable,
) -> InterruptHandler {
    let (handler, mut signals) = InterruptHandler::new(logger.clone(), parent_cancel);
    handler.add_stopper(stopper);
    let cancel_tx = handler.cancel_tx.clone();
    let interrupted = handler.interrupted.clone();
    tokio::spawn(async move {
        if let Some(sig) = signals.recv().await {
            info!(logger, "Received {} signal, terminating.", sig);
            interrupted.store(true, Ordering::SeqCst);
            let _ = cancel_tx.send(true);
        }
    });
    handler
}
