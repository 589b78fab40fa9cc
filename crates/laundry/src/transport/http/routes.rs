//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::machine::MachineId;
use crate::pool::PoolError;
use crate::service::{ActionResult, HealthStatus, LaundryService, NotificationView};

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub user_name: String,
    pub duration_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub machine_id: Option<u32>,
    #[serde(default)]
    pub user_name: String,
}

#[derive(Debug, Deserialize)]
pub struct UserRequest {
    #[serde(default)]
    pub user_name: String,
}

fn error_status(err: &PoolError) -> StatusCode {
    match err {
        PoolError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PoolError::NotFound(_) => StatusCode::NOT_FOUND,
        PoolError::Forbidden { .. } => StatusCode::FORBIDDEN,
        PoolError::InvalidState { .. } | PoolError::Conflict(_) => StatusCode::CONFLICT,
        // Not an error for the caller: the flag in the body says what happened.
        PoolError::NothingToCancel(_) => StatusCode::OK,
        PoolError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(err: &PoolError) -> (StatusCode, Json<ActionResult>) {
    let status = error_status(err);
    if status.is_server_error() {
        tracing::error!(error = %err, "Request failed");
        return (status, Json(ActionResult::failure("Internal error, please try again.")));
    }
    tracing::debug!(kind = err.as_label(), error = %err, "Request rejected");
    (status, Json(ActionResult::failure(err.to_string())))
}

fn reply(result: Result<ActionResult, PoolError>) -> (StatusCode, Json<ActionResult>) {
    match result {
        Ok(result) => (StatusCode::OK, Json(result)),
        Err(err) => failure(&err),
    }
}

fn bad_body(rejection: JsonRejection) -> (StatusCode, Json<ActionResult>) {
    tracing::debug!(error = %rejection, "Malformed request body");
    (
        StatusCode::BAD_REQUEST,
        Json(ActionResult::failure(format!("Malformed request: {}", rejection.body_text()))),
    )
}

async fn health_check(State(service): State<Arc<LaundryService>>) -> impl IntoResponse {
    let snapshot = service.health().await;
    let status = match snapshot.status {
        HealthStatus::Ready => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(snapshot))
}

async fn status(State(service): State<Arc<LaundryService>>) -> Response {
    match service.status().await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => failure(&PoolError::Store(e)).into_response(),
    }
}

async fn start_use(
    State(service): State<Arc<LaundryService>>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> impl IntoResponse {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return bad_body(rejection),
    };
    // Out-of-range values still go through the service so they get the
    // regular validation message.
    let duration = request
        .duration_minutes
        .map(|d| d.clamp(0, i64::from(u32::MAX)) as u32);
    reply(service.start_use(&request.user_name, duration).await)
}

async fn complete_use(
    State(service): State<Arc<LaundryService>>,
    body: Result<Json<CompleteRequest>, JsonRejection>,
) -> impl IntoResponse {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return bad_body(rejection),
    };
    let Some(machine_id) = request.machine_id else {
        return failure(&PoolError::InvalidInput(
            "Please enter a machine number.".to_string(),
        ));
    };
    reply(
        service
            .complete_use(MachineId::new(machine_id), &request.user_name)
            .await,
    )
}

#[derive(Debug, Deserialize)]
pub struct NotificationsQuery {
    #[serde(default)]
    pub user_name: String,
}

#[derive(Debug, Serialize)]
pub struct NotificationsResponse {
    pub success: bool,
    pub notifications: Vec<NotificationView>,
}

async fn notifications(
    State(service): State<Arc<LaundryService>>,
    Query(query): Query<NotificationsQuery>,
) -> Response {
    match service.notifications(&query.user_name).await {
        Ok(notifications) => (
            StatusCode::OK,
            Json(NotificationsResponse {
                success: true,
                notifications,
            }),
        )
            .into_response(),
        Err(err) => failure(&err).into_response(),
    }
}

async fn clear_notifications(
    State(service): State<Arc<LaundryService>>,
    body: Result<Json<UserRequest>, JsonRejection>,
) -> impl IntoResponse {
    match body {
        Ok(Json(request)) => reply(service.clear_notifications(&request.user_name).await),
        Err(rejection) => bad_body(rejection),
    }
}

async fn cancel_reservation(
    State(service): State<Arc<LaundryService>>,
    body: Result<Json<UserRequest>, JsonRejection>,
) -> impl IntoResponse {
    match body {
        Ok(Json(request)) => reply(service.cancel_reservation(&request.user_name).await),
        Err(rejection) => bad_body(rejection),
    }
}

pub fn routes(service: Arc<LaundryService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/api/status", get(status))
        .route("/api/start", post(start_use))
        .route("/api/complete", post(complete_use))
        .route("/api/notifications", get(notifications))
        .route("/api/notifications/clear", post(clear_notifications))
        .route("/api/reservation/cancel", post(cancel_reservation))
        .with_state(service)
}
