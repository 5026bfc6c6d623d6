//! HTTP route handlers for the agent service.

use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use serde::Serialize;
use tracing::{info, instrument};

use forgeline::core::types::{AgentRole, MessageEnvelope, Mode, ValidatedResponse};
use forgeline::runtime::breaker::BreakerKey;

use crate::error::ApiError;
use crate::state::{AppState, GeneratorInfo};

/// Build the service router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/invoke/{role}", post(invoke))
        .route("/circuits", get(circuits))
        .route(
            "/circuits/{project_id}/{role}/{mode}",
            delete(reset_circuit),
        )
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    generator: GeneratorInfo,
}

/// GET /health - generator configuration status.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        generator: state.generator,
    })
}

#[derive(Debug, Serialize)]
struct OpenCircuit {
    #[serde(flatten)]
    key: BreakerKey,
    failures: u32,
}

#[derive(Debug, Serialize)]
struct CircuitsResponse {
    threshold: u32,
    open: Vec<OpenCircuit>,
}

/// GET /circuits - circuits currently refusing calls.
async fn circuits(State(state): State<AppState>) -> Json<CircuitsResponse> {
    let open = state
        .breakers
        .open_keys(state.breaker_threshold)
        .into_iter()
        .map(|key| OpenCircuit {
            failures: state.breakers.failures(&key),
            key,
        })
        .collect();
    Json(CircuitsResponse {
        threshold: state.breaker_threshold,
        open,
    })
}

/// DELETE /circuits/{project_id}/{role}/{mode} - close one circuit.
#[instrument(skip_all, fields(project_id = %project_id, role = %role, mode = %mode))]
async fn reset_circuit(
    State(state): State<AppState>,
    Path((project_id, role, mode)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let agent: AgentRole = role
        .parse()
        .map_err(|_| ApiError::UnknownRole(role.clone()))?;
    let mode: Mode = mode
        .parse()
        .map_err(|err| ApiError::BadRequest(format!("{err}")))?;
    let key = BreakerKey::new(project_id, agent, mode);
    state.breakers.reset(&key);
    info!("circuit reset by operator");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /invoke/{role} - run one agent invocation.
///
/// Terminal BLOCKED/FAIL envelopes are normal responses; only failures that
/// produced no envelope become errors.
#[instrument(skip_all, fields(role = %role))]
async fn invoke(
    State(state): State<AppState>,
    Path(role): Path<String>,
    body: Result<Json<MessageEnvelope>, JsonRejection>,
) -> Result<Json<ValidatedResponse>, ApiError> {
    let path_role: AgentRole = role
        .parse()
        .map_err(|_| ApiError::UnknownRole(role.clone()))?;
    let Json(request) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    if request.agent != path_role {
        return Err(ApiError::BadRequest(format!(
            "envelope agent {} does not match route role {path_role}",
            request.agent
        )));
    }

    let invoker = state.invoker.clone();
    let response = tokio::task::spawn_blocking(move || invoker.dispatch(&request))
        .await
        .map_err(|err| {
            ApiError::Internal(anyhow::Error::new(err).context("invocation worker panicked"))
        })??;
    info!(
        status = %response.envelope.status,
        validator_pass = response.validator_pass,
        artifacts = response.envelope.artifacts.len(),
        "invocation finished"
    );
    Ok(Json(response))
}
