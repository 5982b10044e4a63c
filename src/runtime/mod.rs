//! PipelineRuntime - Dedicated Single-Thread Executor
//!
//! ## Responsibilities
//!
//! - Own one OS thread running a current-thread tokio runtime; every
//!   pipeline task (sources, samplers, scheduler, aggregators) lives
//!   there, so cross-task state needs no fine-grained locking
//! - Hand out [`TaskHandle`]s that callers on any thread can cancel
//!   or block on with a deadline
//! - Tear the loop down on shutdown, cancelling everything still
//!   running

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::{mpsc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Handle to a task on the pipeline thread. Cancellation is abrupt;
/// graceful teardown is the session layer's job.
pub struct TaskHandle {
    join: JoinHandle<()>,
    // Mutex makes the receiver Sync so TaskHandle can live inside
    // shared (Arc) state sent across threads.
    done_rx: Mutex<mpsc::Receiver<()>>,
}

impl TaskHandle {
    pub(crate) fn from_parts(join: JoinHandle<()>, done_rx: mpsc::Receiver<()>) -> Self {
        Self {
            join,
            done_rx: Mutex::new(done_rx),
        }
    }

    pub fn cancel(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Block the calling (non-pipeline) thread until the task ends or
    /// the deadline passes. A cancelled task counts as ended.
    pub fn await_done(&self, timeout: Duration) -> Result<()> {
        let done_rx = self
            .done_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match done_rx.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => Ok(()),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(Error::Runtime("task did not finish within deadline".into()))
            }
        }
    }
}

/// The pipeline executor: a named worker thread parked on a
/// current-thread tokio runtime until shutdown.
pub struct PipelineRuntime {
    handle: Handle,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PipelineRuntime {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("trafficwatch-pipeline".into())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                // Dropping the runtime here cancels remaining tasks
                tracing::debug!("pipeline runtime stopped");
            })
            .map_err(|e| Error::Runtime(format!("failed to start pipeline thread: {e}")))?;

        Ok(Self {
            handle,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a future onto the pipeline thread
    pub fn spawn<F>(&self, fut: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel();
        let join = self.handle.spawn(async move {
            fut.await;
            let _ = done_tx.send(());
        });
        TaskHandle::from_parts(join, done_rx)
    }

    /// Stop the executor; everything still running is cancelled
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("pipeline thread panicked during shutdown");
            }
        }
    }
}

impl Drop for PipelineRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_spawned_task_runs_and_await_done_returns() {
        let mut rt = PipelineRuntime::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = rt.spawn(async move {
            flag.store(true, Ordering::SeqCst);
        });
        handle.await_done(Duration::from_secs(1)).unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(handle.is_finished());
        rt.shutdown();
    }

    #[test]
    fn test_cancel_ends_a_stuck_task() {
        let mut rt = PipelineRuntime::new().unwrap();
        let handle = rt.spawn(async {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });
        assert!(handle.await_done(Duration::from_millis(50)).is_err());
        handle.cancel();
        handle.await_done(Duration::from_secs(1)).unwrap();
        rt.shutdown();
    }

    #[test]
    fn test_shutdown_cancels_outstanding_tasks() {
        let mut rt = PipelineRuntime::new().unwrap();
        let handle = rt.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        rt.shutdown();
        // The done channel sender was dropped without a send
        handle.await_done(Duration::from_secs(1)).unwrap();
    }
}
