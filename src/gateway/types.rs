//! Request and response bodies for the HTTP surface.

use serde::{Deserialize, Serialize};

use crate::agents::Agent;
use crate::artifacts::Platform;
use crate::tasks::AgentTask;

/// Success half of the response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl ApiResponse<()> {
    /// Acknowledgement without a payload.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub agent_id: i64,
    pub name: String,
    pub need_update: bool,
    pub force_update: bool,
    pub latest_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskList {
    pub agent_id: i64,
    pub tasks: Vec<AgentTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub platforms: Vec<Platform>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadQuery {
    pub os: Option<String>,
    pub arch: Option<String>,
}

/// An agent record together with its token, returned only where an
/// operator is meant to see the token.
#[derive(Debug, Clone, Serialize)]
pub struct AgentWithToken {
    #[serde(flatten)]
    pub agent: Agent,
    pub token: Option<String>,
}

impl From<Agent> for AgentWithToken {
    fn from(agent: Agent) -> Self {
        let token = agent.token.clone();
        Self { agent, token }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}
