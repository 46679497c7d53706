//! Bounded worker pool executing method bodies off the connection I/O path.
//!
//! A fixed set of workers pulls tasks from a shared queue. Admission is
//! decided up front with a semaphore holding `workers + queue_size` permits:
//! a task either takes a permit immediately or is rejected with
//! [`ExecutorError::ResourceExhausted`]. The permit travels with the task and
//! is returned when the task finishes, whatever the outcome.
//!
//! Every task runs under its own deadline and inside `catch_unwind`, so a
//! slow or panicking handler costs one task, never a worker. The deadline is
//! fixed at admission: time spent queued counts against it, and a task whose
//! deadline passed while queued is reported as timed out without running.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use courier_rpc::RpcError;

use crate::config::ExecutorConfig;
use crate::metrics::{
    DISPATCH_ADMITTED_TOTAL, DISPATCH_IN_FLIGHT, DISPATCH_PANICS_TOTAL,
    DISPATCH_QUEUE_WAIT_SECONDS, DISPATCH_REJECTED_TOTAL, DISPATCH_TIMEOUTS_TOTAL,
};

/// Work submitted to a dispatcher.
pub struct DispatchTask {
    /// Label used in logs (the method name for RPC calls).
    pub label: String,
    work: BoxFuture<'static, Result<Value, RpcError>>,
}

impl DispatchTask {
    /// Wrap a future as a task.
    pub fn new<F>(label: impl Into<String>, work: F) -> Self
    where
        F: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        Self {
            label: label.into(),
            work: Box::pin(work),
        }
    }
}

impl std::fmt::Debug for DispatchTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTask")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// How an admitted task ended.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The task ran to completion.
    Completed(Result<Value, RpcError>),
    /// The deadline elapsed first; the task was dropped.
    TimedOut,
    /// The task panicked.
    Panicked(String),
    /// The pool was torn down before the task reported back.
    Abandoned,
}

impl TaskOutcome {
    /// Collapse into the result reported to the caller.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self {
            Self::Completed(result) => result,
            Self::TimedOut => Err(RpcError::internal("timed out")),
            Self::Panicked(message) => Err(RpcError::internal(format!("handler panicked: {message}"))),
            Self::Abandoned => Err(RpcError::internal("server shutting down")),
        }
    }
}

/// Receipt for an admitted task.
#[derive(Debug)]
pub struct TaskHandle {
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    /// Wait for the task to end.
    pub async fn outcome(self) -> TaskOutcome {
        self.rx.await.unwrap_or(TaskOutcome::Abandoned)
    }
}

/// Why a task was not admitted.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Every worker is busy and the queue is full.
    #[error("dispatcher saturated ({capacity} tasks in flight)")]
    ResourceExhausted {
        /// Workers plus queue slots.
        capacity: usize,
    },
    /// The pool no longer accepts work.
    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

impl ExecutorError {
    /// Error reported to the caller of a rejected request.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError::ResourceExhausted {
            message: self.to_string(),
        }
    }
}

/// Anything that can run dispatch tasks.
///
/// `dispatch` must never wait for capacity: it either admits the task or
/// fails immediately.
#[cfg_attr(test, mockall::automock)]
pub trait TaskDispatcher: Send + Sync {
    /// Admit `task`, to be abandoned if it runs longer than `timeout`.
    fn dispatch(&self, task: DispatchTask, timeout: Duration) -> Result<TaskHandle, ExecutorError>;
}

struct Job {
    task: DispatchTask,
    timeout: Duration,
    deadline: Instant,
    reply: oneshot::Sender<TaskOutcome>,
    permit: OwnedSemaphorePermit,
    queued_at: Instant,
}

/// Fixed-size worker pool with a bounded queue.
pub struct Executor {
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// Start the workers. Must be called inside a Tokio runtime.
    pub fn new(config: ExecutorConfig) -> Self {
        let workers = config.worker_count();
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers)
            .map(|index| tokio::spawn(worker_loop(index, Arc::clone(&rx))))
            .collect();

        info!(workers, queue_size = config.queue_size, "executor started");
        Self {
            permits: Arc::new(Semaphore::new(config.capacity())),
            config,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Pool sizing.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Tasks admitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.config.capacity().saturating_sub(self.permits.available_permits())
    }

    /// Stop admitting work, let queued tasks finish within `grace`, then
    /// abort whatever is still running.
    pub async fn shutdown(&self, grace: Duration) {
        self.permits.close();
        drop(self.sender.lock().take());

        let workers = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, futures::future::join_all(workers))
            .await
            .is_err()
        {
            warn!(?grace, "executor drain timed out, aborting workers");
            for handle in aborts {
                handle.abort();
            }
        } else {
            info!("executor drained");
        }
    }
}

impl TaskDispatcher for Executor {
    fn dispatch(&self, task: DispatchTask, timeout: Duration) -> Result<TaskHandle, ExecutorError> {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                counter!(DISPATCH_REJECTED_TOTAL, "reason" => "saturated").increment(1);
                warn!(task = %task.label, capacity = self.config.capacity(), "dispatcher saturated, rejecting task");
                return Err(ExecutorError::ResourceExhausted {
                    capacity: self.config.capacity(),
                });
            }
            Err(TryAcquireError::Closed) => {
                counter!(DISPATCH_REJECTED_TOTAL, "reason" => "shutdown").increment(1);
                return Err(ExecutorError::ShuttingDown);
            }
        };

        let (reply, rx) = oneshot::channel();
        let queued_at = Instant::now();
        let job = Job {
            task,
            timeout,
            deadline: queued_at.checked_add(timeout).unwrap_or_else(far_future),
            reply,
            permit,
            queued_at,
        };

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(ExecutorError::ShuttingDown);
        };
        if sender.send(job).is_err() {
            return Err(ExecutorError::ShuttingDown);
        }

        counter!(DISPATCH_ADMITTED_TOTAL).increment(1);
        gauge!(DISPATCH_IN_FLIGHT).increment(1.0);
        Ok(TaskHandle { rx })
    }
}

async fn worker_loop(index: usize, rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(job) = job else { break };
        run_job(job).await;
    }
    debug!(worker = index, "worker stopped");
}

async fn run_job(job: Job) {
    let Job {
        task,
        timeout,
        deadline,
        reply,
        permit,
        queued_at,
    } = job;
    histogram!(DISPATCH_QUEUE_WAIT_SECONDS).record(queued_at.elapsed().as_secs_f64());

    let label = task.label;
    if Instant::now() >= deadline {
        counter!(DISPATCH_TIMEOUTS_TOTAL).increment(1);
        warn!(task = %label, ?timeout, "task deadline passed while queued, skipping");
        drop(permit);
        gauge!(DISPATCH_IN_FLIGHT).decrement(1.0);
        let _ = reply.send(TaskOutcome::TimedOut);
        return;
    }

    let outcome = match tokio::time::timeout_at(deadline, AssertUnwindSafe(task.work).catch_unwind()).await {
        Ok(Ok(result)) => TaskOutcome::Completed(result),
        Ok(Err(payload)) => {
            let message = panic_message(payload.as_ref());
            counter!(DISPATCH_PANICS_TOTAL).increment(1);
            error!(task = %label, panic = %message, "task panicked");
            TaskOutcome::Panicked(message)
        }
        Err(_) => {
            counter!(DISPATCH_TIMEOUTS_TOTAL).increment(1);
            warn!(task = %label, ?timeout, "task exceeded its deadline");
            TaskOutcome::TimedOut
        }
    };

    // Free the slot before reporting so a caller that saw the outcome can
    // immediately reuse the capacity.
    drop(permit);
    gauge!(DISPATCH_IN_FLIGHT).decrement(1.0);
    let _ = reply.send(outcome);
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
