//! Per-task success/failure counters.
//!
//! The ledger only needs to bump a counter, so it depends on the narrow
//! [`Incrementer`] capability rather than on a concrete stats service.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::db::Database;
use crate::error::DatabaseError;
use crate::ledger::ExecutionStatus;

/// Anything that can count a finished run.
#[async_trait]
pub trait Incrementer: Send + Sync {
    async fn increment(&self, task_id: i64, status: ExecutionStatus) -> Result<(), DatabaseError>;
}

/// Counters for one task on one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub task_id: i64,
    pub day: NaiveDate,
    pub success_count: i64,
    pub fail_count: i64,
}

/// Daily counters kept in the main store.
pub struct DailyTaskStats {
    store: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
}

impl DailyTaskStats {
    pub fn new(store: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl Incrementer for DailyTaskStats {
    async fn increment(&self, task_id: i64, status: ExecutionStatus) -> Result<(), DatabaseError> {
        if !status.is_terminal() {
            tracing::debug!(task_id, "Ignoring stats increment for running record");
            return Ok(());
        }
        let day = self.clock.now().date_naive();
        self.store.increment_task_stats(task_id, day, status).await
    }
}
