//! Agent-facing routes, mounted under `/api/agent`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use bytes::Bytes;

use crate::agents::{AgentStatus, HeartbeatInfo, PendingStatus, RegisterRequest};
use crate::gateway::GatewayState;
use crate::gateway::auth::{AgentToken, ClientIp, require_agent_token};
use crate::gateway::error::ApiError;
use crate::gateway::types::{
    ApiResponse, DownloadQuery, HeartbeatResponse, StatusRequest, TaskList, VersionInfo,
};
use crate::ledger::AgentTaskResult;

pub(super) fn routes() -> Router<GatewayState> {
    Router::new()
        // Token-bearing routes: the layer only applies to routes added above it.
        .route("/heartbeat", post(heartbeat))
        .route("/tasks", get(get_tasks))
        .route("/report", post(report_result))
        .route_layer(middleware::from_fn(require_agent_token))
        .route("/register", post(register))
        .route("/status", post(check_status))
        .route("/download", get(download))
        .route("/version", get(version))
}

async fn register(
    State(state): State<GatewayState>,
    ClientIp(ip): ClientIp,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<PendingStatus>>, ApiError> {
    let Json(req) = payload?;
    let status = state.gateway.register(&req, &ip).await?;
    let message = match status.status {
        AgentStatus::Pending => "registered, waiting for approval",
        _ => "registered",
    };
    Ok(Json(ApiResponse::ok(status).with_message(message)))
}

async fn check_status(
    State(state): State<GatewayState>,
    ClientIp(ip): ClientIp,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<PendingStatus>>, ApiError> {
    let Json(req) = payload?;
    let status = state.gateway.check_status(&req.name, &ip).await?;
    Ok(Json(ApiResponse::ok(status)))
}

async fn heartbeat(
    State(state): State<GatewayState>,
    Extension(AgentToken(token)): Extension<AgentToken>,
    ClientIp(ip): ClientIp,
    payload: Result<Json<HeartbeatInfo>, JsonRejection>,
) -> Result<Json<ApiResponse<HeartbeatResponse>>, ApiError> {
    // Older agents send a bare POST; treat it as a heartbeat without metadata.
    let info = match payload {
        Ok(Json(info)) => info,
        Err(JsonRejection::MissingJsonContentType(_)) => HeartbeatInfo::default(),
        Err(e) => return Err(e.into()),
    };
    let resp = state.gateway.heartbeat(&token, &ip, &info).await?;
    Ok(Json(ApiResponse::ok(resp)))
}

async fn get_tasks(
    State(state): State<GatewayState>,
    Extension(AgentToken(token)): Extension<AgentToken>,
) -> Result<Json<ApiResponse<TaskList>>, ApiError> {
    let tasks = state.gateway.get_tasks(&token).await?;
    Ok(Json(ApiResponse::ok(tasks)))
}

async fn report_result(
    State(state): State<GatewayState>,
    Extension(AgentToken(token)): Extension<AgentToken>,
    payload: Result<Json<AgentTaskResult>, JsonRejection>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let Json(result) = payload?;
    state.gateway.report_result(&token, result).await?;
    Ok(Json(ApiResponse::message("result recorded")))
}

async fn download(
    State(state): State<GatewayState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let os = query.os.as_deref().unwrap_or("linux");
    let arch = query.arch.as_deref().unwrap_or("amd64");
    let artifact = state.gateway.binary(os, arch).await?;

    tracing::info!(os, arch, bytes = artifact.data.len(), "Serving agent binary");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", artifact.filename),
            ),
        ],
        Bytes::from(artifact.data),
    )
        .into_response())
}

async fn version(State(state): State<GatewayState>) -> Json<ApiResponse<VersionInfo>> {
    Json(ApiResponse::ok(VersionInfo {
        version: state.gateway.latest_version().await,
        platforms: state.gateway.available_platforms().await,
    }))
}
