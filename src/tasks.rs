//! Task definitions as seen by the dispatch core.
//!
//! Tasks are created and edited elsewhere; this crate only reads them,
//! hands agents a snapshot, and touches `last_run`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A schedulable command owned by an agent (or by the local runner when
/// `agent_id` is unset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub command: String,
    /// Cron-style schedule, interpreted by the agent.
    pub schedule: String,
    /// Execution timeout in seconds, enforced by the agent.
    pub timeout: i32,
    pub work_dir: String,
    pub envs: String,
    pub enabled: bool,
    pub agent_id: Option<i64>,
    /// Raw retention policy JSON; empty means "keep everything".
    pub clean_config: String,
    pub last_run: Option<DateTime<Utc>>,
}

impl Task {
    /// Parse the task's retention policy.
    pub fn retention_policy(&self) -> Result<Option<RetentionPolicy>, serde_json::Error> {
        if self.clean_config.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&self.clean_config).map(Some)
    }
}

/// The slice of a task an agent needs to schedule and run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: i64,
    pub name: String,
    pub command: String,
    pub schedule: String,
    pub timeout: i32,
    pub work_dir: String,
    pub envs: String,
    pub enabled: bool,
}

impl From<Task> for AgentTask {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            name: task.name,
            command: task.command,
            schedule: task.schedule,
            timeout: task.timeout,
            work_dir: task.work_dir,
            envs: task.envs,
            enabled: task.enabled,
        }
    }
}

/// How much execution history a task keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(rename = "type")]
    pub kind: RetentionKind,
    pub keep: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionKind {
    /// Keep records younger than `keep` days.
    Day,
    /// Keep the `keep` most recent records.
    Count,
}
