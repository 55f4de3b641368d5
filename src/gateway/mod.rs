//! Dispatch gateway: the pull protocol agents speak and the operator
//! management surface, served over HTTP.
//!
//! Agent routes live under `/api/agent`, operator routes under
//! `/api/agents` and `/api/regcodes`. `/health` needs no credentials.

mod admin;
mod api;
pub mod auth;
pub mod error;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::agents::{
    AgentRegistry, AgentStatus, HeartbeatInfo, PendingStatus, RegisterRequest,
    RegistrationCodeIssuer,
};
use crate::artifacts::{Artifact, ArtifactStore, Platform};
use crate::db::Database;
use crate::error::{DispatchError, Result};
use crate::ledger::{AgentTaskResult, ExecutionLedger, ExecutionRecord};
use crate::tasks::AgentTask;

pub use auth::{AdminAuth, ClientIp};
pub use error::ApiError;
pub use types::{ApiResponse, HeartbeatResponse, TaskList, VersionInfo};

/// Agent-facing operations. Every token-bearing call resolves the token to
/// an enabled agent first.
pub struct DispatchGateway {
    registry: Arc<AgentRegistry>,
    codes: Arc<RegistrationCodeIssuer>,
    ledger: Arc<ExecutionLedger>,
    store: Arc<dyn Database>,
    artifacts: ArtifactStore,
}

impl DispatchGateway {
    pub fn new(
        registry: Arc<AgentRegistry>,
        codes: Arc<RegistrationCodeIssuer>,
        ledger: Arc<ExecutionLedger>,
        store: Arc<dyn Database>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            registry,
            codes,
            ledger,
            store,
            artifacts,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn codes(&self) -> &RegistrationCodeIssuer {
        &self.codes
    }

    /// Register an agent. With a registration code the agent comes back
    /// online with its token; without one it waits for approval.
    pub async fn register(&self, req: &RegisterRequest, ip: &str) -> Result<PendingStatus> {
        let agent = match req.code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => self.codes.redeem(code, req, ip).await?,
            None => self.registry.register(req, ip).await?,
        };
        Ok(PendingStatus {
            agent_id: agent.id,
            status: agent.status,
            token: match agent.status {
                AgentStatus::Pending => None,
                _ => agent.token,
            },
        })
    }

    pub async fn check_status(&self, name: &str, ip: &str) -> Result<PendingStatus> {
        self.registry.check_pending_status(name, ip).await
    }

    /// Record a heartbeat and tell the agent whether it should update.
    ///
    /// A pending force-update is consumed once the agent is told to update.
    pub async fn heartbeat(
        &self,
        token: &str,
        ip: &str,
        info: &HeartbeatInfo,
    ) -> Result<HeartbeatResponse> {
        let agent = self.registry.heartbeat(token, ip, info).await?;

        let latest_version = self.artifacts.latest_version().await;
        let need_update = !latest_version.is_empty()
            && !info.version.is_empty()
            && info.version != latest_version;

        if agent.force_update && need_update {
            if let Err(e) = self.registry.clear_force_update(agent.id).await {
                tracing::warn!(agent_id = agent.id, "Failed to clear force-update flag: {}", e);
            }
        }

        Ok(HeartbeatResponse {
            agent_id: agent.id,
            name: agent.name,
            need_update,
            force_update: agent.force_update,
            latest_version,
        })
    }

    /// Enabled tasks assigned to the calling agent, by id.
    pub async fn get_tasks(&self, token: &str) -> Result<TaskList> {
        let agent = self.registry.authenticate(token).await?;
        let tasks = self
            .store
            .list_agent_tasks(agent.id)
            .await?
            .into_iter()
            .map(AgentTask::from)
            .collect();
        Ok(TaskList {
            agent_id: agent.id,
            tasks,
        })
    }

    /// Accept a finished run from the calling agent.
    ///
    /// The agent id in the payload is ignored; the token decides.
    pub async fn report_result(
        &self,
        token: &str,
        mut result: AgentTaskResult,
    ) -> Result<ExecutionRecord> {
        let agent = self.registry.authenticate(token).await?;
        result.agent_id = agent.id;

        if result.task_id <= 0 {
            return Err(DispatchError::Validation("task_id is required".into()));
        }
        if !result.status.is_terminal() {
            return Err(DispatchError::Validation(
                "reported status must be success or failed".into(),
            ));
        }

        self.ledger.record_agent_result(&result).await
    }

    pub async fn latest_version(&self) -> String {
        self.artifacts.latest_version().await
    }

    pub async fn available_platforms(&self) -> Vec<Platform> {
        self.artifacts.available_platforms().await
    }

    pub async fn binary(&self, os: &str, arch: &str) -> Result<Artifact> {
        self.artifacts.binary(os, arch).await
    }
}

/// Shared state for the HTTP surface.
#[derive(Clone)]
pub struct GatewayState {
    pub gateway: Arc<DispatchGateway>,
    pub admin: AdminAuth,
}

/// Build the full router.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .nest("/api/agent", api::routes())
        .merge(admin::routes(&state))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: GatewayState,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Dispatch gateway listening on {}", addr);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn health_check() -> &'static str {
    "ok"
}
