//! Operator routes: agent approval and management, registration codes.
//!
//! Everything here sits behind the operator bearer token.

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router, middleware};

use crate::agents::{Agent, AgentUpdate, CreateCodeRequest, RegistrationCode};
use crate::gateway::GatewayState;
use crate::gateway::auth::admin_auth_middleware;
use crate::gateway::error::ApiError;
use crate::gateway::types::{AgentWithToken, ApiResponse, TokenResponse};

pub(super) fn routes(state: &GatewayState) -> Router<GatewayState> {
    Router::new()
        .route("/api/agents", get(list_agents))
        .route("/api/agents/pending", get(list_pending))
        .route(
            "/api/agents/{id}",
            get(get_agent).put(update_agent).delete(delete_agent),
        )
        .route("/api/agents/{id}/approve", post(approve_agent))
        .route("/api/agents/{id}/reject", post(reject_agent))
        .route("/api/agents/{id}/token", post(regenerate_token))
        .route("/api/agents/{id}/force-update", post(force_update))
        .route("/api/regcodes", get(list_codes).post(create_code))
        .route("/api/regcodes/{id}", axum::routing::delete(delete_code))
        .route_layer(middleware::from_fn_with_state(
            state.admin.clone(),
            admin_auth_middleware,
        ))
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// -- Agents --

async fn list_agents(State(state): State<GatewayState>) -> ApiResult<Vec<Agent>> {
    Ok(Json(ApiResponse::ok(state.gateway.registry().list().await?)))
}

async fn list_pending(State(state): State<GatewayState>) -> ApiResult<Vec<Agent>> {
    Ok(Json(ApiResponse::ok(
        state.gateway.registry().list_pending().await?,
    )))
}

async fn get_agent(
    State(state): State<GatewayState>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<Agent> {
    let Path(id) = id?;
    Ok(Json(ApiResponse::ok(state.gateway.registry().get(id).await?)))
}

async fn approve_agent(
    State(state): State<GatewayState>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<AgentWithToken> {
    let Path(id) = id?;
    let agent = state.gateway.registry().approve(id).await?;
    Ok(Json(
        ApiResponse::ok(AgentWithToken::from(agent)).with_message("agent approved"),
    ))
}

async fn reject_agent(
    State(state): State<GatewayState>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<()> {
    let Path(id) = id?;
    state.gateway.registry().reject(id).await?;
    Ok(Json(ApiResponse::message("agent rejected")))
}

async fn update_agent(
    State(state): State<GatewayState>,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<AgentUpdate>, JsonRejection>,
) -> ApiResult<Agent> {
    let Path(id) = id?;
    let Json(update) = payload?;
    let agent = state.gateway.registry().update(id, &update).await?;
    Ok(Json(ApiResponse::ok(agent)))
}

async fn delete_agent(
    State(state): State<GatewayState>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<()> {
    let Path(id) = id?;
    state.gateway.registry().delete(id).await?;
    Ok(Json(ApiResponse::message("agent deleted")))
}

async fn regenerate_token(
    State(state): State<GatewayState>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<TokenResponse> {
    let Path(id) = id?;
    let token = state.gateway.registry().regenerate_token(id).await?;
    Ok(Json(ApiResponse::ok(TokenResponse { token })))
}

async fn force_update(
    State(state): State<GatewayState>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<()> {
    let Path(id) = id?;
    state.gateway.registry().set_force_update(id).await?;
    Ok(Json(ApiResponse::message(
        "force update set; the agent updates on its next heartbeat",
    )))
}

// -- Registration codes --

async fn list_codes(State(state): State<GatewayState>) -> ApiResult<Vec<RegistrationCode>> {
    Ok(Json(ApiResponse::ok(state.gateway.codes().list_codes().await?)))
}

async fn create_code(
    State(state): State<GatewayState>,
    payload: Result<Json<CreateCodeRequest>, JsonRejection>,
) -> ApiResult<RegistrationCode> {
    let Json(req) = payload?;
    let code = state.gateway.codes().create_code(req).await?;
    Ok(Json(ApiResponse::ok(code)))
}

async fn delete_code(
    State(state): State<GatewayState>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<()> {
    let Path(id) = id?;
    state.gateway.codes().delete_code(id).await?;
    Ok(Json(ApiResponse::message("registration code deleted")))
}
