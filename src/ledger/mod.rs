//! Execution ledger: persisted runs, their compressed output and the
//! bookkeeping that follows a completed run.
//!
//! Persisting the record is the only step whose failure reaches the caller.
//! Everything after it (task last-run, statistics, retention) is best-effort
//! and logged.

mod model;
mod retention;

use std::sync::Arc;

pub use model::{AgentTaskResult, ExecutionRecord, ExecutionStatus};
pub use retention::{RetentionQueue, RetentionSweeper};

use crate::clock::Clock;
use crate::codec::OutputCodec;
use crate::db::Database;
use crate::error::{DispatchError, Result};
use crate::stats::Incrementer;

pub struct ExecutionLedger {
    store: Arc<dyn Database>,
    stats: Arc<dyn Incrementer>,
    codec: Arc<dyn OutputCodec>,
    clock: Arc<dyn Clock>,
    sweeper: RetentionSweeper,
    retention: RetentionQueue,
}

impl ExecutionLedger {
    /// Completed runs queue their task's retention sweep on `retention`.
    /// Pass [`RetentionQueue::disabled`] to prune only through
    /// [`apply_retention`](Self::apply_retention).
    pub fn new(
        store: Arc<dyn Database>,
        stats: Arc<dyn Incrementer>,
        codec: Arc<dyn OutputCodec>,
        clock: Arc<dyn Clock>,
        retention: RetentionQueue,
    ) -> Self {
        Self {
            sweeper: RetentionSweeper::new(Arc::clone(&store), Arc::clone(&clock)),
            store,
            stats,
            codec,
            clock,
            retention,
        }
    }

    /// Compress captured output for storage. Failure yields the empty
    /// sentinel and is logged.
    pub fn compress_output(&self, output: &str) -> String {
        match self.codec.compress(output) {
            Ok(compressed) => compressed,
            Err(e) => {
                tracing::error!("Failed to compress execution output: {}", e);
                String::new()
            }
        }
    }

    /// Persist a `running` record for a run that is just starting.
    pub async fn create_empty_log(&self, task_id: i64, command: &str) -> Result<ExecutionRecord> {
        let now = self.clock.now();
        let mut record = ExecutionRecord {
            id: 0,
            task_id,
            agent_id: None,
            command: command.to_string(),
            output: String::new(),
            error: None,
            status: ExecutionStatus::Running,
            duration_ms: 0,
            exit_code: None,
            start_time: Some(now),
            end_time: None,
            created_at: now,
        };
        record.id = self.store.insert_execution(&record).await?;
        tracing::debug!(task_id, record_id = record.id, "Execution started");
        Ok(record)
    }

    /// Turn an agent-reported result into a terminal record and run the
    /// completion bookkeeping.
    pub async fn record_agent_result(&self, result: &AgentTaskResult) -> Result<ExecutionRecord> {
        let mut record = ExecutionRecord {
            id: 0,
            task_id: result.task_id,
            agent_id: Some(result.agent_id),
            command: result.command.clone(),
            output: self.compress_output(&result.output),
            error: result.error.clone(),
            status: result.status,
            duration_ms: result.duration,
            exit_code: Some(result.exit_code),
            start_time: result.start(),
            end_time: result.end(),
            created_at: self.clock.now(),
        };

        record.id = self.store.insert_execution(&record).await?;
        self.after_completion(&record).await;

        tracing::info!(
            task_id = record.task_id,
            agent_id = result.agent_id,
            record_id = record.id,
            status = %record.status,
            duration_ms = record.duration_ms,
            "Agent execution recorded"
        );
        Ok(record)
    }

    /// Insert a new record (id 0) or overwrite a still-running one, then
    /// stamp the task's last run.
    ///
    /// Terminal records are immutable: updating one fails with
    /// `InvalidState`.
    pub async fn save_or_update(&self, record: &mut ExecutionRecord) -> Result<()> {
        if !record.is_consistent() {
            return Err(DispatchError::Validation(
                "running records cannot carry an end time or exit code".into(),
            ));
        }

        if record.is_persisted() {
            if !self.store.update_running_execution(record).await? {
                return Err(self.not_running(record.id).await);
            }
        } else {
            record.id = self.store.insert_execution(record).await?;
        }

        self.touch_last_run(record.task_id).await;
        Ok(())
    }

    /// Record in-flight progress for a running execution. Finished records
    /// keep their final duration and fail with `InvalidState`.
    pub async fn update_duration(&self, record_id: i64, duration_ms: i64) -> Result<()> {
        if !self
            .store
            .update_execution_duration(record_id, duration_ms)
            .await?
        {
            return Err(self.not_running(record_id).await);
        }
        Ok(())
    }

    /// Save a finished local run, then count it and queue retention.
    pub async fn complete(&self, record: &mut ExecutionRecord) -> Result<()> {
        if !record.status.is_terminal() {
            return Err(DispatchError::Validation(
                "only finished executions can be completed".into(),
            ));
        }
        self.save_or_update(record).await?;
        self.count(record).await;
        self.retention.enqueue(record.task_id);
        Ok(())
    }

    /// Apply the task's retention policy now, bypassing the queue.
    pub async fn apply_retention(&self, task_id: i64) -> Result<u64> {
        self.sweeper.apply(task_id).await
    }

    async fn after_completion(&self, record: &ExecutionRecord) {
        self.touch_last_run(record.task_id).await;
        self.count(record).await;
        self.retention.enqueue(record.task_id);
    }

    async fn touch_last_run(&self, task_id: i64) {
        if let Err(e) = self
            .store
            .touch_task_last_run(task_id, self.clock.now())
            .await
        {
            tracing::warn!(task_id, "Failed to update task last run: {}", e);
        }
    }

    /// Why an update restricted to running records matched nothing.
    async fn not_running(&self, record_id: i64) -> DispatchError {
        match self.store.get_execution(record_id).await {
            Ok(Some(_)) => DispatchError::InvalidState(format!(
                "execution record {} is already finished",
                record_id
            )),
            Ok(None) => DispatchError::NotFound(format!("Execution record {}", record_id)),
            Err(e) => e.into(),
        }
    }

    async fn count(&self, record: &ExecutionRecord) {
        if let Err(e) = self.stats.increment(record.task_id, record.status).await {
            tracing::error!(task_id = record.task_id, "Failed to update task stats: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::{CodecError, GzipBase64};
    use crate::db::InMemoryStore;
    use crate::stats::DailyTaskStats;
    use crate::tasks::Task;

    struct FailingCodec;

    impl OutputCodec for FailingCodec {
        fn compress(&self, _output: &str) -> std::result::Result<String, CodecError> {
            Err(CodecError::Compress(std::io::Error::other("disk on fire")))
        }

        fn decompress(&self, _stored: &str) -> std::result::Result<String, CodecError> {
            Err(CodecError::Decompress(std::io::Error::other("disk on fire")))
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            store
                .put_task(Task {
                    id: 7,
                    name: "backup".into(),
                    command: "backup.sh".into(),
                    schedule: "0 3 * * *".into(),
                    timeout: 600,
                    work_dir: String::new(),
                    envs: String::new(),
                    enabled: true,
                    agent_id: Some(1),
                    clean_config: r#"{"type":"count","keep":2}"#.into(),
                    last_run: None,
                })
                .await;
            Self {
                store,
                clock: Arc::new(ManualClock::new(Utc::now())),
            }
        }

        fn ledger(&self, codec: Arc<dyn OutputCodec>) -> ExecutionLedger {
            self.ledger_with(codec, RetentionQueue::disabled())
        }

        fn ledger_with(
            &self,
            codec: Arc<dyn OutputCodec>,
            retention: RetentionQueue,
        ) -> ExecutionLedger {
            let stats = Arc::new(DailyTaskStats::new(self.store.clone(), self.clock.clone()));
            ExecutionLedger::new(self.store.clone(), stats, codec, self.clock.clone(), retention)
        }
    }

    fn agent_result(status: ExecutionStatus) -> AgentTaskResult {
        AgentTaskResult {
            task_id: 7,
            agent_id: 1,
            command: "backup.sh".into(),
            output: "42 files copied".into(),
            error: None,
            status,
            duration: 1200,
            exit_code: 0,
            start_time: 1_700_000_000,
            end_time: 1_700_000_001,
        }
    }

    #[tokio::test]
    async fn test_record_agent_result() {
        let f = Fixture::new().await;
        let ledger = f.ledger(Arc::new(GzipBase64));

        let record = ledger
            .record_agent_result(&agent_result(ExecutionStatus::Success))
            .await
            .unwrap();

        let stored = f.store.get_execution(record.id).await.unwrap().unwrap();
        assert_eq!(stored.agent_id, Some(1));
        assert_eq!(stored.exit_code, Some(0));
        assert_eq!(GzipBase64.decompress(&stored.output).unwrap(), "42 files copied");

        let task = f.store.get_task(7).await.unwrap().unwrap();
        assert_eq!(task.last_run, Some(f.clock.now()));

        let stats = f.store.list_task_stats(7).await.unwrap();
        assert_eq!((stats[0].success_count, stats[0].fail_count), (1, 0));
    }

    #[tokio::test]
    async fn test_record_persists_when_compression_fails() {
        let f = Fixture::new().await;
        let ledger = f.ledger(Arc::new(FailingCodec));

        let record = ledger
            .record_agent_result(&agent_result(ExecutionStatus::Failed))
            .await
            .unwrap();

        let stored = f.store.get_execution(record.id).await.unwrap().unwrap();
        assert_eq!(stored.output, "");
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert_eq!(f.store.list_task_stats(7).await.unwrap()[0].fail_count, 1);
    }

    #[tokio::test]
    async fn test_running_record_lifecycle() {
        let f = Fixture::new().await;
        let ledger = f.ledger(Arc::new(GzipBase64));

        let mut record = ledger.create_empty_log(7, "backup.sh").await.unwrap();
        assert!(record.is_persisted());
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.start_time, Some(f.clock.now()));

        f.clock.advance(Duration::seconds(3));
        ledger.update_duration(record.id, 3000).await.unwrap();
        assert_eq!(
            f.store.get_execution(record.id).await.unwrap().unwrap().duration_ms,
            3000
        );

        record.status = ExecutionStatus::Success;
        record.exit_code = Some(0);
        record.end_time = Some(f.clock.now());
        record.duration_ms = 3000;
        record.output = ledger.compress_output("done");
        ledger.complete(&mut record).await.unwrap();

        let stored = f.store.get_execution(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Success);
        assert_eq!(stored.created_at, record.start_time.unwrap());
        assert_eq!(f.store.list_task_stats(7).await.unwrap()[0].success_count, 1);

        // Finished records are immutable.
        record.status = ExecutionStatus::Failed;
        let err = ledger.save_or_update(&mut record).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidState(_)));

        let err = ledger.update_duration(record.id, 99_999).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidState(_)));
        let stored = f.store.get_execution(record.id).await.unwrap().unwrap();
        assert_eq!(stored.duration_ms, 3000);
        assert_eq!(stored.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_save_or_update_errors() {
        let f = Fixture::new().await;
        let ledger = f.ledger(Arc::new(GzipBase64));

        let mut record = ledger.create_empty_log(7, "backup.sh").await.unwrap();
        record.exit_code = Some(1);
        assert!(matches!(
            ledger.save_or_update(&mut record).await,
            Err(DispatchError::Validation(_))
        ));

        record.exit_code = None;
        record.id = 999;
        assert!(matches!(
            ledger.save_or_update(&mut record).await,
            Err(DispatchError::NotFound(_))
        ));
        assert!(matches!(
            ledger.update_duration(999, 1).await,
            Err(DispatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_completion_queues_retention() {
        let f = Fixture::new().await;
        let sweeper = Arc::new(RetentionSweeper::new(f.store.clone(), f.clock.clone()));
        let (queue, worker) = RetentionQueue::spawn(sweeper, 8);
        let ledger = f.ledger_with(Arc::new(GzipBase64), queue);

        for _ in 0..4 {
            ledger
                .record_agent_result(&agent_result(ExecutionStatus::Success))
                .await
                .unwrap();
        }
        drop(ledger);
        worker.await.unwrap();

        assert_eq!(f.store.list_executions(7).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_retention_directly() {
        let f = Fixture::new().await;
        let ledger = f.ledger(Arc::new(GzipBase64));
        for _ in 0..5 {
            ledger
                .record_agent_result(&agent_result(ExecutionStatus::Success))
                .await
                .unwrap();
        }
        assert_eq!(ledger.apply_retention(7).await.unwrap(), 3);
        assert_eq!(ledger.apply_retention(7).await.unwrap(), 0);
    }
}
