//! Storage abstraction for agents, registration codes, tasks, execution
//! records and task statistics.
//!
//! Two backends implement it: [`PgStore`] for production and
//! [`InMemoryStore`] for tests and single-process development. Operations
//! that must be atomic across several rows (code redemption, reference
//! checked deletion, conditional offline marking) are single trait methods
//! so each backend can make them atomic its own way.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use crate::agents::{Agent, AgentStatus, NewAgent, NewRegistrationCode, RegistrationCode};
use crate::error::DatabaseError;
use crate::ledger::{ExecutionRecord, ExecutionStatus};
use crate::stats::TaskStats;
use crate::tasks::Task;

/// Which agents a listing returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentListFilter {
    /// Agents awaiting approval.
    Pending,
    /// Everything that has been approved (online or offline).
    Approved,
}

/// Outcome of a reference-checked soft delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentDeletion {
    Deleted,
    NotFound,
    /// Tasks still point at the agent.
    Referenced(i64),
}

/// Outcome of a registration code redemption.
#[derive(Debug, Clone, PartialEq)]
pub enum Redemption {
    /// The code was consumed and this agent is now online with a token.
    Redeemed(Agent),
    NotFound,
    Expired,
    Exhausted,
}

/// Database abstraction layer.
#[async_trait]
pub trait Database: Send + Sync {
    // --- Agents ---

    async fn insert_agent(&self, agent: &NewAgent) -> Result<Agent, DatabaseError>;

    async fn get_agent(&self, id: i64) -> Result<Option<Agent>, DatabaseError>;

    async fn get_agent_by_token(&self, token: &str) -> Result<Option<Agent>, DatabaseError>;

    async fn find_pending_agent_by_name(&self, name: &str) -> Result<Option<Agent>, DatabaseError>;

    async fn find_agent_by_name_and_ip(
        &self,
        name: &str,
        ip: &str,
    ) -> Result<Option<Agent>, DatabaseError>;

    /// Newest first.
    async fn list_agents(&self, filter: AgentListFilter) -> Result<Vec<Agent>, DatabaseError>;

    /// Write every mutable field of an existing agent, provided its stored
    /// status is still `expected`. Returns false if the agent no longer
    /// exists or its status has moved on.
    async fn save_agent(&self, agent: &Agent, expected: AgentStatus)
    -> Result<bool, DatabaseError>;

    /// Remove the row outright (used by reject). Tasks assigned to the agent
    /// are left unassigned.
    async fn hard_delete_agent(&self, id: i64) -> Result<bool, DatabaseError>;

    /// Soft delete unless a task references the agent, as one atomic step.
    async fn soft_delete_agent(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<AgentDeletion, DatabaseError>;

    /// Ids of online agents last seen before `cutoff`.
    async fn list_stale_online_agents(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<i64>, DatabaseError>;

    /// Mark one agent offline if it is still online and still stale.
    async fn mark_agent_offline_if_stale(
        &self,
        id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // --- Registration codes ---

    async fn insert_registration_code(
        &self,
        code: &NewRegistrationCode,
    ) -> Result<RegistrationCode, DatabaseError>;

    /// Newest first.
    async fn list_registration_codes(&self) -> Result<Vec<RegistrationCode>, DatabaseError>;

    async fn delete_registration_code(&self, id: i64) -> Result<bool, DatabaseError>;

    /// Check redeemability, bump `used_count` and create (or approve the
    /// same-named pending) agent, all atomically. `agent.now` is the
    /// redemption instant.
    async fn redeem_registration_code(
        &self,
        code: &str,
        agent: &NewAgent,
    ) -> Result<Redemption, DatabaseError>;

    // --- Tasks ---

    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError>;

    /// Enabled tasks assigned to the agent, by id.
    async fn list_agent_tasks(&self, agent_id: i64) -> Result<Vec<Task>, DatabaseError>;

    async fn touch_task_last_run(
        &self,
        task_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // --- Execution records ---

    /// Persist a new record and return its id.
    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<i64, DatabaseError>;

    /// Overwrite a record that is still running. Returns false if the record
    /// is missing or already terminal.
    async fn update_running_execution(
        &self,
        record: &ExecutionRecord,
    ) -> Result<bool, DatabaseError>;

    /// Set the duration of a record that is still running. Returns false if
    /// the record is missing or already terminal.
    async fn update_execution_duration(
        &self,
        id: i64,
        duration_ms: i64,
    ) -> Result<bool, DatabaseError>;

    async fn get_execution(&self, id: i64) -> Result<Option<ExecutionRecord>, DatabaseError>;

    /// Newest first.
    async fn list_executions(&self, task_id: i64) -> Result<Vec<ExecutionRecord>, DatabaseError>;

    async fn delete_executions_created_before(
        &self,
        task_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Id of the record at `offset` when ordered by id descending.
    async fn nth_latest_execution_id(
        &self,
        task_id: i64,
        offset: i64,
    ) -> Result<Option<i64>, DatabaseError>;

    async fn delete_executions_below_id(
        &self,
        task_id: i64,
        id: i64,
    ) -> Result<u64, DatabaseError>;

    // --- Stats ---

    async fn increment_task_stats(
        &self,
        task_id: i64,
        day: NaiveDate,
        status: ExecutionStatus,
    ) -> Result<(), DatabaseError>;

    /// Oldest day first.
    async fn list_task_stats(&self, task_id: i64) -> Result<Vec<TaskStats>, DatabaseError>;
}
