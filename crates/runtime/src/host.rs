//! Single-worker execution host.
//!
//! The host owns a piece of state on one dedicated OS thread running a
//! current-thread tokio runtime. Callers submit closures that borrow the
//! state mutably; the worker runs them one at a time, in submission order,
//! each to completion. Callers wait with a timeout, and a timed-out caller
//! only stops waiting: the work itself still runs and its result is dropped.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

const WORKER_THREAD_NAME: &str = "keel-worker";

#[derive(Debug, Error)]
pub enum HostError {
    #[error("worker is not ready yet")]
    NotReady,

    #[error("timed out after {0:?} waiting for the worker")]
    Timeout(Duration),

    #[error("worker has shut down")]
    Closed,

    #[error("operation panicked: {0}")]
    Panicked(String),

    #[error("failed to start worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// State that can live on the worker.
pub trait Hosted: Send + 'static {
    /// Runs on the worker before the host reports ready.
    fn start(&mut self) -> impl Future<Output = ()>;

    /// Runs on the worker after the last operation.
    fn stop(&mut self) -> impl Future<Output = ()>;
}

type Job<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> LocalBoxFuture<'a, ()> + Send>;

enum Command<S> {
    Run(Job<S>),
    Shutdown(oneshot::Sender<()>),
}

/// Pins the higher-ranked signature so closures passed in infer correctly.
fn job<S: 'static, F>(f: F) -> Job<S>
where
    F: for<'a> FnOnce(&'a mut S) -> LocalBoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

/// Handle to a worker thread that owns `S`.
///
/// The handle is `Send + Sync`; share it behind an `Arc` to submit from
/// many tasks.
pub struct ExecutionHost<S> {
    inbox: mpsc::UnboundedSender<Command<S>>,
    ready: watch::Receiver<bool>,
    closed: AtomicBool,
}

impl<S: Hosted> ExecutionHost<S> {
    /// Spawn the worker and begin `S::start` on it. Returns immediately;
    /// use [`wait_ready`](Self::wait_ready) to block until start finishes.
    pub fn start(state: S) -> Result<Self, HostError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (inbox, commands) = mpsc::unbounded_channel();
        let (ready_tx, ready) = watch::channel(false);

        std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(run_worker(state, commands, ready_tx)))?;

        Ok(Self {
            inbox,
            ready,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the worker has finished starting. Returns `false` if it
    /// did not within `timeout` or the worker is gone.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.clone();
        matches!(
            tokio::time::timeout(timeout, ready.wait_for(|r| *r)).await,
            Ok(Ok(_))
        )
    }

    /// Queue `operation` behind everything submitted before it and wait up
    /// to `timeout` for its result.
    ///
    /// Fails fast with [`HostError::NotReady`] until start has finished. A
    /// panic inside `operation` is reported as [`HostError::Panicked`] and
    /// the worker keeps serving.
    pub async fn submit<T, F>(&self, timeout: Duration, operation: F) -> Result<T, HostError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut S) -> LocalBoxFuture<'a, T> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::Closed);
        }
        if !self.is_ready() {
            return Err(HostError::NotReady);
        }

        let (reply, result) = oneshot::channel();
        let job = job(move |state: &mut S| {
            async move {
                let outcome = AssertUnwindSafe(async move { operation(state).await })
                    .catch_unwind()
                    .await;
                if reply.send(outcome.map_err(panic_message)).is_err() {
                    debug!("caller stopped waiting; result dropped");
                }
            }
            .boxed_local()
        });
        self.inbox
            .send(Command::Run(job))
            .map_err(|_| HostError::Closed)?;

        match tokio::time::timeout(timeout, result).await {
            Err(_) => Err(HostError::Timeout(timeout)),
            Ok(Err(_)) => Err(HostError::Closed),
            Ok(Ok(Err(message))) => Err(HostError::Panicked(message)),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }

    /// Run `S::stop` after everything already queued, then end the worker.
    /// Later submissions fail with [`HostError::Closed`]. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (ack, done) = oneshot::channel();
        if self.inbox.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

async fn run_worker<S: Hosted>(
    mut state: S,
    mut commands: mpsc::UnboundedReceiver<Command<S>>,
    ready: watch::Sender<bool>,
) {
    state.start().await;
    ready.send_replace(true);
    info!("worker ready");

    while let Some(command) = commands.recv().await {
        match command {
            Command::Run(job) => job(&mut state).await,
            Command::Shutdown(ack) => {
                state.stop().await;
                let _ = ack.send(());
                info!("worker stopped");
                return;
            }
        }
    }

    // Every handle was dropped without an explicit shutdown.
    state.stop().await;
    info!("worker stopped");
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        error!("operation panicked with a non-string payload");
        "unknown panic".to_string()
    }
}
