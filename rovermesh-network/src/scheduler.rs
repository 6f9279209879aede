//! Task group over the tokio runtime.
//!
//! Every long-running piece of the mesh (beacon loops, the accept loop,
//! per-peer connection machines) runs as a *daemon*: a task that is
//! restarted with a small backoff if it fails or panics, and that exits
//! cleanly when the group's cancellation token fires. `stop()` cancels
//! the token and joins everything that was spawned.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::lock;

/// Delay before a failed daemon is restarted.
const RESTART_BACKOFF: Duration = Duration::from_millis(50);

pub struct Scheduler {
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// A child of the group token; cancelled when the group stops, or
    /// individually by the holder.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Spawn a one-shot task. It is abandoned mid-await on `stop()`.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = future => {}
            }
        });
        lock(&self.tasks).push(handle);
    }

    /// Spawn a supervised daemon.
    ///
    /// `factory` builds a fresh future for every (re)start. A future
    /// that resolves `Ok(())` is considered done and is not restarted;
    /// an `Err` or a panic is logged and the daemon restarts after
    /// [`RESTART_BACKOFF`].
    pub fn spawn_daemon<F, Fut>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let run = AssertUnwindSafe(factory()).catch_unwind();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = run => match outcome {
                        Ok(Ok(())) => break,
                        Ok(Err(err)) => warn!("daemon {name} failed: {err:#}"),
                        Err(_) => error!("daemon {name} panicked"),
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RESTART_BACKOFF) => {}
                }
            }
        });
        lock(&self.tasks).push(handle);
    }

    /// Spawn a daemon that runs `f` then sleeps `period`, forever.
    pub fn spawn_periodic<F, Fut>(&self, period: Duration, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let f = std::sync::Arc::new(f);
        self.spawn_daemon("periodic", move || periodic_loop(f.clone(), period));
    }

    /// Cancel every task and wait for them to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn periodic_loop<F, Fut>(f: std::sync::Arc<F>, period: Duration) -> anyhow::Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        f().await;
        tokio::time::sleep(period).await;
    }
}
