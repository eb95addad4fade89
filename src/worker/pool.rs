use super::{ReplyJob, ReplyOutcome, WorkerCoordinator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Background reply workers with bounded concurrency. Jobs past the limit
/// wait for a permit instead of being rejected.
pub struct WorkerPool {
    coordinator: Arc<WorkerCoordinator>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<ReplyOutcome>>,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(coordinator: Arc<WorkerCoordinator>, max_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Queues `job`. Returns false once shutdown has started.
    pub fn submit(&self, job: ReplyJob) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            warn!(
                "Worker pool is shutting down, dropping reply for conversation {}",
                job.conversation_id
            );
            return false;
        }

        let coordinator = self.coordinator.clone();
        let permits = self.permits.clone();
        let Ok(mut tasks) = self.tasks.lock() else {
            warn!("Worker pool state is poisoned, dropping reply");
            return false;
        };
        while tasks.try_join_next().is_some() {}

        debug!("Queued reply for conversation {}", job.conversation_id);
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return ReplyOutcome::Abandoned("worker pool closed".to_string());
            };
            coordinator.run(job).await
        });
        true
    }

    /// Stops accepting jobs and waits up to `grace` for in-flight ones.
    /// Returns the outcomes of the jobs that finished in time.
    pub async fn shutdown(&self, grace: Duration) -> Vec<ReplyOutcome> {
        self.closed.store(true, Ordering::SeqCst);
        let mut tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return Vec::new(),
        };

        let pending = tasks.len();
        let mut outcomes = Vec::with_capacity(pending);
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => warn!("Reply worker panicked: {}", e),
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} reply workers still running after {:?}, aborting them",
                tasks.len(),
                grace
            );
            tasks.abort_all();
        } else if pending > 0 {
            info!("Worker pool drained {} jobs", pending);
        }
        outcomes
    }
}
