//! REST gateway server built on axum.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use super::GatewayConfig;
use super::auth::GatewayAuth;
use crate::auth::Principal;
use crate::controller::RunController;
use crate::error::{ErrorKind, TrainingError};
use crate::snapshot::RunSnapshot;
use crate::types::{AiModel, MetricPoint, NewRun, RunView};

/// State shared by every handler.
pub struct GatewayState {
    controller: Arc<RunController>,
    auth: GatewayAuth,
    started_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(controller: Arc<RunController>, config: &GatewayConfig) -> Self {
        Self {
            controller,
            auth: GatewayAuth::from_config(config),
            started_at: Utc::now(),
        }
    }

    pub fn auth(&self) -> &GatewayAuth {
        &self.auth
    }

    /// Uptime in seconds since the state was created.
    pub fn uptime_secs(&self) -> u64 {
        let elapsed = Utc::now() - self.started_at;
        elapsed.num_seconds().max(0) as u64
    }

    fn principal(&self, headers: &HeaderMap) -> Result<Principal, ApiError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(GatewayAuth::bearer);
        self.auth.authenticate(token).ok_or(ApiError::Unauthorized)
    }
}

pub type SharedState = Arc<GatewayState>;

/// Error response of the gateway.
#[derive(Debug)]
pub enum ApiError {
    /// Missing or unknown bearer token.
    Unauthorized,
    Engine(TrainingError),
}

impl From<TrainingError> for ApiError {
    fn from(e: TrainingError) -> Self {
        ApiError::Engine(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Engine(e) => match e.kind() {
                ErrorKind::Validation => match e {
                    TrainingError::InvalidInput { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    _ => StatusCode::CONFLICT,
                },
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
                ErrorKind::SchedulerFault | ErrorKind::Storage => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Unauthorized => "missing or invalid bearer token".to_string(),
            ApiError::Engine(e) => e.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    recent: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct NewModel {
    name: String,
}

/// Build the gateway router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/runs", get(list_runs).post(create_run))
        .route("/api/runs/{id}", get(get_run).delete(delete_run))
        .route("/api/runs/{id}/metrics", get(get_metrics))
        .route("/api/runs/{id}/snapshot", get(get_snapshot))
        .route("/api/runs/{id}/start", post(start_run))
        .route("/api/runs/{id}/pause", post(pause_run))
        .route("/api/runs/{id}/resume", post(resume_run))
        .route("/api/models", get(list_models).post(create_model))
        .route("/api/models/{id}", get(get_model))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler(State(gw): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_runs": gw.controller.scheduler().active_count(),
        "uptime_secs": gw.uptime_secs(),
    }))
}

async fn list_runs(State(gw): State<SharedState>, headers: HeaderMap) -> ApiResult<Vec<RunView>> {
    let principal = gw.principal(&headers)?;
    Ok(Json(gw.controller.list_runs(&principal)?))
}

async fn create_run(
    State(gw): State<SharedState>,
    headers: HeaderMap,
    Json(params): Json<NewRun>,
) -> Result<(StatusCode, Json<RunView>), ApiError> {
    let principal = gw.principal(&headers)?;
    let run = gw.controller.create_run(&principal, params)?;
    Ok((StatusCode::CREATED, Json(RunView::from(&run))))
}

async fn get_run(
    State(gw): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<RunView> {
    let principal = gw.principal(&headers)?;
    Ok(Json(gw.controller.get_run(&principal, id)?))
}

async fn delete_run(
    State(gw): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let principal = gw.principal(&headers)?;
    gw.controller.delete_run(&principal, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_metrics(
    State(gw): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<MetricPoint>> {
    let principal = gw.principal(&headers)?;
    Ok(Json(gw.controller.get_metrics(&principal, id)?))
}

async fn get_snapshot(
    State(gw): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<SnapshotQuery>,
) -> ApiResult<RunSnapshot> {
    let principal = gw.principal(&headers)?;
    Ok(Json(gw.controller.snapshot(&principal, id, query.recent)?))
}

async fn start_run(
    State(gw): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<RunView> {
    let principal = gw.principal(&headers)?;
    let run = gw.controller.start_run(&principal, id).await?;
    Ok(Json(RunView::from(&run)))
}

async fn pause_run(
    State(gw): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<RunView> {
    let principal = gw.principal(&headers)?;
    let run = gw.controller.pause_run(&principal, id).await?;
    Ok(Json(RunView::from(&run)))
}

async fn resume_run(
    State(gw): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<RunView> {
    let principal = gw.principal(&headers)?;
    let run = gw.controller.resume_run(&principal, id).await?;
    Ok(Json(RunView::from(&run)))
}

async fn list_models(State(gw): State<SharedState>, headers: HeaderMap) -> ApiResult<Vec<AiModel>> {
    let principal = gw.principal(&headers)?;
    Ok(Json(gw.controller.list_models(&principal)?))
}

async fn create_model(
    State(gw): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<NewModel>,
) -> Result<(StatusCode, Json<AiModel>), ApiError> {
    let principal = gw.principal(&headers)?;
    let model = gw.controller.register_model(&principal, &body.name)?;
    Ok((StatusCode::CREATED, Json(model)))
}

async fn get_model(
    State(gw): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<AiModel> {
    let principal = gw.principal(&headers)?;
    Ok(Json(gw.controller.get_model(&principal, id)?))
}

/// Serve the gateway until `shutdown` resolves.
pub async fn run(
    state: SharedState,
    config: &GatewayConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, open_mode = state.auth().is_open_mode(), "Gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, Role};
    use crate::config::EngineConfig;
    use crate::store::Stores;
    use axum::body::Body;
    use tower::ServiceExt;

    fn state() -> SharedState {
        let controller = Arc::new(RunController::new(
            &EngineConfig::default(),
            Stores::in_memory(),
            Arc::new(AllowAll),
        ));
        Arc::new(GatewayState::new(controller, &GatewayConfig::default()))
    }

    #[test]
    fn test_error_status_mapping() {
        let id = Uuid::nil();
        let cases = [
            (
                TrainingError::InvalidTransition {
                    run_id: id,
                    from: crate::types::RunStatus::Completed,
                    to: crate::types::RunStatus::Running,
                },
                StatusCode::CONFLICT,
            ),
            (TrainingError::invalid_input("bad"), StatusCode::UNPROCESSABLE_ENTITY),
            (TrainingError::AlreadyActive { run_id: id }, StatusCode::CONFLICT),
            (TrainingError::RunNotFound { id }, StatusCode::NOT_FOUND),
            (TrainingError::ModelNotFound { id }, StatusCode::NOT_FOUND),
            (
                TrainingError::PermissionDenied {
                    principal: "v".into(),
                    action: "start_run".into(),
                },
                StatusCode::FORBIDDEN,
            ),
            (TrainingError::storage("disk"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(state());
        let req = axum::http::Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["active_runs"], 0);
    }

    #[tokio::test]
    async fn test_token_required_when_configured() {
        let controller = Arc::new(RunController::new(
            &EngineConfig::default(),
            Stores::in_memory(),
            Arc::new(AllowAll),
        ));
        let config = GatewayConfig {
            auth_tokens: vec![crate::gateway::TokenGrant {
                token: "secret".into(),
                principal: "alice".into(),
                role: Role::Admin,
            }],
            ..GatewayConfig::default()
        };
        let gw = Arc::new(GatewayState::new(controller, &config));

        let req = axum::http::Request::builder()
            .uri("/api/runs")
            .body(Body::empty())
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(router(gw.clone()), req)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = axum::http::Request::builder()
            .uri("/api/runs")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(router(gw), req)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
