//! Retention: bounded history per task.
//!
//! A task's `clean_config` selects either "keep N days" or "keep the N
//! newest records". Cleanup runs off the write path on a single worker fed
//! by a bounded queue; when the queue is full the new job is dropped with a
//! warning. Sweeps are idempotent and the next completion of the same task
//! enqueues it again, so a dropped job only delays cleanup.

use std::sync::Arc;

use chrono::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::Result;
use crate::tasks::{RetentionKind, RetentionPolicy};

/// Applies a task's retention policy to its execution records.
pub struct RetentionSweeper {
    store: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Delete the records the task's policy no longer keeps and return how
    /// many went. Missing tasks, empty or unparsable policies, non-positive
    /// `keep` values and day windows older than any date are no-ops.
    pub async fn apply(&self, task_id: i64) -> Result<u64> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(0);
        };

        let policy = match task.retention_policy() {
            Ok(Some(policy)) => policy,
            Ok(None) => return Ok(0),
            Err(e) => {
                tracing::error!(task_id, "Invalid retention policy: {}", e);
                return Ok(0);
            }
        };

        let deleted = self.apply_policy(task_id, policy).await?;
        if deleted > 0 {
            tracing::info!(task_id, deleted, "Pruned execution history");
        }
        Ok(deleted)
    }

    async fn apply_policy(&self, task_id: i64, policy: RetentionPolicy) -> Result<u64> {
        if policy.keep <= 0 {
            return Ok(0);
        }

        match policy.kind {
            RetentionKind::Day => {
                let cutoff = Duration::try_days(i64::from(policy.keep))
                    .and_then(|window| self.clock.now().checked_sub_signed(window));
                // A window reaching past the earliest representable instant
                // keeps everything.
                let Some(cutoff) = cutoff else {
                    return Ok(0);
                };
                Ok(self
                    .store
                    .delete_executions_created_before(task_id, cutoff)
                    .await?)
            }
            RetentionKind::Count => {
                let boundary = self
                    .store
                    .nth_latest_execution_id(task_id, i64::from(policy.keep) - 1)
                    .await?;
                match boundary {
                    Some(id) => Ok(self.store.delete_executions_below_id(task_id, id).await?),
                    None => Ok(0),
                }
            }
        }
    }
}

/// Sending side of the retention work queue.
#[derive(Clone)]
pub struct RetentionQueue {
    tx: Option<mpsc::Sender<i64>>,
}

impl RetentionQueue {
    /// Start the worker and return the queue handle plus the worker task.
    ///
    /// The worker exits once every clone of the handle is dropped.
    pub fn spawn(sweeper: Arc<RetentionSweeper>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<i64>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(task_id) = rx.recv().await {
                if let Err(e) = sweeper.apply(task_id).await {
                    tracing::error!(task_id, "Retention sweep failed: {}", e);
                }
            }
            tracing::debug!("Retention worker stopped");
        });

        (Self { tx: Some(tx) }, handle)
    }

    /// A queue that accepts and discards every job.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue a sweep for `task_id`. Returns false when the job was dropped.
    pub fn enqueue(&self, task_id: i64) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(task_id) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(task_id, "Retention queue full, dropping cleanup job");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(task_id, "Retention worker is gone, dropping cleanup job");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::InMemoryStore;
    use crate::ledger::{ExecutionRecord, ExecutionStatus};
    use crate::tasks::Task;

    fn task(id: i64, clean_config: &str) -> Task {
        Task {
            id,
            name: format!("task-{}", id),
            command: "echo hi".into(),
            schedule: "* * * * *".into(),
            timeout: 30,
            work_dir: String::new(),
            envs: String::new(),
            enabled: true,
            agent_id: None,
            clean_config: clean_config.into(),
            last_run: None,
        }
    }

    async fn seed(store: &InMemoryStore, task_id: i64, created_at: chrono::DateTime<Utc>) -> i64 {
        store
            .insert_execution(&ExecutionRecord {
                id: 0,
                task_id,
                agent_id: None,
                command: "echo hi".into(),
                output: String::new(),
                error: None,
                status: ExecutionStatus::Success,
                duration_ms: 1,
                exit_code: Some(0),
                start_time: Some(created_at),
                end_time: Some(created_at),
                created_at,
            })
            .await
            .unwrap()
    }

    fn sweeper(store: &Arc<InMemoryStore>, clock: &Arc<ManualClock>) -> RetentionSweeper {
        RetentionSweeper::new(store.clone(), clock.clone())
    }

    #[tokio::test]
    async fn test_count_policy_keeps_newest() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        store
            .put_task(task(1, r#"{"type":"count","keep":3}"#))
            .await;
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(seed(&store, 1, clock.now()).await);
        }
        // Another task's history is never touched.
        seed(&store, 2, clock.now()).await;

        let sweeper = sweeper(&store, &clock);
        assert_eq!(sweeper.apply(1).await.unwrap(), 2);

        let remaining: Vec<i64> = store
            .list_executions(1)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(remaining, vec![ids[4], ids[3], ids[2]]);
        assert_eq!(store.list_executions(2).await.unwrap().len(), 1);

        // Idempotent.
        assert_eq!(sweeper.apply(1).await.unwrap(), 0);
        assert_eq!(store.list_executions(1).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_day_policy_never_deletes_recent_records() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        store.put_task(task(1, r#"{"type":"day","keep":7}"#)).await;

        let now = clock.now();
        seed(&store, 1, now - Duration::days(30)).await;
        seed(&store, 1, now - Duration::days(8)).await;
        let kept_edge = seed(&store, 1, now - Duration::days(7) + Duration::minutes(1)).await;
        let kept_new = seed(&store, 1, now).await;

        assert_eq!(sweeper(&store, &clock).apply(1).await.unwrap(), 2);
        let remaining: Vec<i64> = store
            .list_executions(1)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(remaining, vec![kept_new, kept_edge]);
    }

    #[tokio::test]
    async fn test_no_policy_is_noop() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        store.put_task(task(1, "")).await;
        store.put_task(task(2, "not json")).await;
        store.put_task(task(3, r#"{"type":"count","keep":0}"#)).await;
        for id in 1..=3 {
            seed(&store, id, clock.now() - Duration::days(400)).await;
        }

        let sweeper = sweeper(&store, &clock);
        for id in 1..=4 {
            assert_eq!(sweeper.apply(id).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_queue_worker_applies_jobs() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        store.put_task(task(1, r#"{"type":"count","keep":1}"#)).await;
        for _ in 0..3 {
            seed(&store, 1, clock.now()).await;
        }

        let (queue, worker) = RetentionQueue::spawn(Arc::new(sweeper(&store, &clock)), 4);
        assert!(queue.enqueue(1));
        drop(queue);
        worker.await.unwrap();

        assert_eq!(store.list_executions(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_huge_day_window_keeps_everything_and_worker_survives() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        store
            .put_task(task(1, r#"{"type":"day","keep":100000000}"#))
            .await;
        store.put_task(task(2, r#"{"type":"count","keep":1}"#)).await;
        seed(&store, 1, clock.now() - Duration::days(4000)).await;
        for _ in 0..3 {
            seed(&store, 2, clock.now()).await;
        }

        assert_eq!(sweeper(&store, &clock).apply(1).await.unwrap(), 0);

        let (queue, worker) = RetentionQueue::spawn(Arc::new(sweeper(&store, &clock)), 4);
        assert!(queue.enqueue(1));
        assert!(queue.enqueue(2));
        drop(queue);
        worker.await.unwrap();

        assert_eq!(store.list_executions(1).await.unwrap().len(), 1);
        assert_eq!(store.list_executions(2).await.unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_queue_drops_jobs() {
        assert!(!RetentionQueue::disabled().enqueue(1));
    }
}
