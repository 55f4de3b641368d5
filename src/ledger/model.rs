//! Execution records and the result payload agents report.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    /// Success and failed are terminal; a running record may still change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// One run of one task.
///
/// `id == 0` marks a record that has not been persisted yet. Ids grow with
/// creation order, which count-based retention relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub task_id: i64,
    /// `None` for local executions.
    pub agent_id: Option<i64>,
    pub command: String,
    /// gzip + base64 output; empty when compression failed.
    pub output: String,
    pub error: Option<String>,
    pub status: ExecutionStatus,
    pub duration_ms: i64,
    pub exit_code: Option<i32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_persisted(&self) -> bool {
        self.id > 0
    }

    /// Running records carry neither an end time nor an exit code.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            ExecutionStatus::Running => self.end_time.is_none() && self.exit_code.is_none(),
            _ => true,
        }
    }
}

/// A finished run as reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTaskResult {
    pub task_id: i64,
    /// Overwritten with the authenticated agent's id.
    #[serde(default)]
    pub agent_id: i64,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    pub status: ExecutionStatus,
    /// Milliseconds.
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub exit_code: i32,
    /// Unix seconds; 0 = not reported.
    #[serde(default)]
    pub start_time: i64,
    /// Unix seconds; 0 = not reported.
    #[serde(default)]
    pub end_time: i64,
}

impl AgentTaskResult {
    pub fn start(&self) -> Option<DateTime<Utc>> {
        unix_seconds(self.start_time)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        unix_seconds(self.end_time)
    }
}

fn unix_seconds(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_deserializes_with_defaults() {
        let result: AgentTaskResult =
            serde_json::from_str(r#"{"task_id": 3, "status": "failed", "exit_code": 2}"#).unwrap();
        assert_eq!(result.task_id, 3);
        assert_eq!(result.agent_id, 0);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.start(), None);
        assert_eq!(result.end(), None);
    }

    #[test]
    fn test_result_timestamps() {
        let result = AgentTaskResult {
            task_id: 1,
            agent_id: 0,
            command: "true".into(),
            output: String::new(),
            error: None,
            status: ExecutionStatus::Success,
            duration: 1500,
            exit_code: 0,
            start_time: 1_700_000_000,
            end_time: 1_700_000_002,
        };
        let start = result.start().unwrap();
        let end = result.end().unwrap();
        assert_eq!((end - start).num_seconds(), 2);
    }

    #[test]
    fn test_running_record_consistency() {
        let now = Utc::now();
        let mut record = ExecutionRecord {
            id: 0,
            task_id: 1,
            agent_id: None,
            command: "sleep 1".into(),
            output: String::new(),
            error: None,
            status: ExecutionStatus::Running,
            duration_ms: 0,
            exit_code: None,
            start_time: Some(now),
            end_time: None,
            created_at: now,
        };
        assert!(!record.is_persisted());
        assert!(record.is_consistent());

        record.exit_code = Some(0);
        assert!(!record.is_consistent());

        record.status = ExecutionStatus::Success;
        record.end_time = Some(now);
        assert!(record.is_consistent());
        assert!(record.status.is_terminal());
    }
}
