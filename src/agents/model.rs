//! Agent records and the values that flow into and out of the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connectivity state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered, waiting for an operator (or a registration code).
    Pending,
    Online,
    /// Marked by the liveness sweep after a silent window.
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AgentStatus::Pending),
            "online" => Ok(AgentStatus::Online),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(format!("unknown agent status '{}'", other)),
        }
    }
}

/// A remote worker known to the controller.
///
/// The token is never serialized with the record. It leaves the controller
/// only through the dedicated approval, redemption, rotation and status
/// polling responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing, default)]
    pub token: Option<String>,
    pub status: AgentStatus,
    pub enabled: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub ip: String,
    pub version: String,
    pub build_time: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub force_update: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Whether the record satisfies "token present iff not pending".
    pub fn token_matches_status(&self) -> bool {
        let has_token = self.token.as_deref().is_some_and(|t| !t.is_empty());
        has_token == (self.status != AgentStatus::Pending)
    }
}

/// Fields for a record that does not exist yet; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub name: String,
    pub hostname: String,
    pub version: String,
    pub ip: String,
    pub status: AgentStatus,
    pub token: Option<String>,
    pub now: DateTime<Utc>,
}

/// What an agent sends when it first contacts the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub version: String,
    /// Optional registration code for unattended approval.
    #[serde(default)]
    pub code: Option<String>,
}

/// Metadata carried by a heartbeat. Empty fields leave stored values alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub build_time: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    /// Reported by agents, not acted on by the controller.
    #[serde(default)]
    pub auto_update: bool,
}

/// Operator-editable attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentUpdate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub enabled: bool,
}

/// Answer to a pending agent polling for its approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingStatus {
    pub agent_id: i64,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            AgentStatus::Pending,
            AgentStatus::Online,
            AgentStatus::Offline,
        ] {
            assert_eq!(status.as_str().parse::<AgentStatus>(), Ok(status));
        }
        assert!("stuck".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn test_agent_serialization_hides_token() {
        let now = Utc::now();
        let agent = Agent {
            id: 7,
            name: "worker-1".into(),
            description: String::new(),
            token: Some("a".repeat(64)),
            status: AgentStatus::Online,
            enabled: true,
            last_seen: Some(now),
            ip: "10.0.0.1".into(),
            version: "1.0".into(),
            build_time: String::new(),
            hostname: "host-a".into(),
            os: "linux".into(),
            arch: "amd64".into(),
            force_update: false,
            created_at: now,
            updated_at: now,
        };

        let json = serde_json::to_value(&agent).unwrap();
        assert!(json.get("token").is_none());
        assert_eq!(json["status"], "online");
        assert!(agent.token_matches_status());
    }
}
