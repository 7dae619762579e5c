use async_trait::async_trait;
use dagcore::DagError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Unit of work accepted by a [`TaskExecutor`]
pub type Task = BoxFuture<'static, ()>;

/// Queue length below which the pool warns at construction
const MIN_QUEUE_LENGTH: usize = 32;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("task queue is full")]
    Full,

    #[error("task executor has been stopped")]
    Stopped,
}

/// Runs fire-and-forget tasks on behalf of the engine
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Enqueue `task`, waiting for room if the queue is full
    async fn submit(&self, task: Task) -> Result<(), DagError>;

    /// Enqueue `task` only if that is possible without waiting
    fn try_submit(&self, task: Task) -> Result<(), SubmitError>;

    /// Close intake, let queued tasks drain and wait for every worker
    async fn stop(&self);

    fn is_stopped(&self) -> bool;
}

/// Bounded queue serviced by a fixed number of tokio tasks
pub struct WorkerPool {
    sender: RwLock<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `workers` workers behind a queue of `queue_length` tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(queue_length: usize, workers: usize) -> Self {
        if queue_length < MIN_QUEUE_LENGTH {
            tracing::warn!(
                "Task queue length {} is small, consider at least {}",
                queue_length,
                MIN_QUEUE_LENGTH
            );
        }
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel(queue_length.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers)
            .map(|id| tokio::spawn(worker_loop(id, receiver.clone())))
            .collect();

        tracing::info!("Started worker pool with {} workers", workers);
        Self {
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Task>> {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn worker_loop(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Task>>>) {
    loop {
        let task = receiver.lock().await.recv().await;
        let Some(task) = task else { break };
        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            tracing::error!("Worker {} caught a panicking task", id);
        }
    }
    tracing::debug!("Worker {} stopped", id);
}

#[async_trait]
impl TaskExecutor for WorkerPool {
    async fn submit(&self, task: Task) -> Result<(), DagError> {
        let Some(sender) = self.sender() else {
            tracing::error!("Task submitted to a stopped executor");
            return Err(DagError::ExecutorStopped);
        };
        sender.send(task).await.map_err(|_| {
            tracing::error!("Task submitted to a stopped executor");
            DagError::ExecutorStopped
        })
    }

    fn try_submit(&self, task: Task) -> Result<(), SubmitError> {
        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(SubmitError::Stopped)?;
        sender.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Stopped,
        })
    }

    async fn stop(&self) {
        let sender = self
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Worker join error: {}", e);
            }
        }
        tracing::info!("Worker pool stopped");
    }

    fn is_stopped(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
