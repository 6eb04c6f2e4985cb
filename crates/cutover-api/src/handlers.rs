//! REST API handlers.
//!
//! Handlers only translate between HTTP and the controller; every state
//! change goes through `Controller`.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::warn;

use cutover_controller::{ControllerError, DeploymentRequest};
use cutover_state::{Deployment, TaskSetId};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn controller_error(e: ControllerError) -> Response {
    let status = match &e {
        ControllerError::Busy { .. } | ControllerError::AlreadyTerminal { .. } => {
            StatusCode::CONFLICT
        }
        ControllerError::NotFound(_) => StatusCode::NOT_FOUND,
        ControllerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ControllerError::State(_) => {
            warn!(error = %e, "store error while serving request");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&e.to_string(), status)
}

/// A deployment plus where its service's traffic is expected to be.
#[derive(Serialize)]
pub struct DeploymentView {
    #[serde(flatten)]
    pub deployment: Deployment,
    pub live_task_set_id: Option<TaskSetId>,
}

impl From<Deployment> for DeploymentView {
    fn from(deployment: Deployment) -> Self {
        Self {
            live_task_set_id: deployment.live_task_set_id().cloned(),
            deployment,
        }
    }
}

// ── Deployments ────────────────────────────────────────────────

/// GET /deployments
pub async fn list_deployments(State(state): State<ApiState>) -> Response {
    match state.controller.list().await {
        Ok(deployments) => {
            let views: Vec<DeploymentView> = deployments.into_iter().map(Into::into).collect();
            ApiResponse::ok(views).into_response()
        }
        Err(e) => controller_error(e),
    }
}

/// GET /deployments/{id}
pub async fn get_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.controller.get(&id).await {
        Ok(deployment) => ApiResponse::ok(DeploymentView::from(deployment)).into_response(),
        Err(e) => controller_error(e),
    }
}

/// POST /deployments
pub async fn create_deployment(
    State(state): State<ApiState>,
    body: Result<Json<DeploymentRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(&rejection.body_text(), StatusCode::BAD_REQUEST),
    };
    match state.controller.submit(request).await {
        Ok(deployment) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(DeploymentView::from(deployment)),
        )
            .into_response(),
        Err(e) => controller_error(e),
    }
}

/// POST /deployments/{id}/cancel
pub async fn cancel_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.controller.cancel(&id).await {
        Ok(deployment) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(DeploymentView::from(deployment)),
        )
            .into_response(),
        Err(e) => controller_error(e),
    }
}

// ── Traffic ────────────────────────────────────────────────────

/// GET /services/{name}/traffic
pub async fn get_traffic(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.controller.traffic(&name).await {
        Some(assignment) => ApiResponse::ok(assignment.as_ref()).into_response(),
        None => error_response(
            &format!("no traffic assignment for service {name}"),
            StatusCode::NOT_FOUND,
        ),
    }
}

/// GET /healthz
pub async fn healthz() -> Response {
    ApiResponse::ok("ok").into_response()
}
