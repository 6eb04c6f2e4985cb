//! cutover-api: HTTP control surface for the deployment controller.
//!
//! Every response uses the `{success, data, error}` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/deployments` | Request a deployment (202, 409 if the service is busy) |
//! | GET | `/deployments` | List all deployments |
//! | GET | `/deployments/{id}` | Deployment state, task sets, failure reason |
//! | POST | `/deployments/{id}/cancel` | Request cancellation (202) |
//! | GET | `/services/{name}/traffic` | Current traffic assignment |
//! | GET | `/healthz` | Liveness of the controller itself |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use cutover_controller::Controller;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<Controller>,
}

/// Build the complete API router.
pub fn build_router(controller: Arc<Controller>) -> Router {
    let state = ApiState { controller };

    Router::new()
        .route(
            "/deployments",
            get(handlers::list_deployments).post(handlers::create_deployment),
        )
        .route("/deployments/{id}", get(handlers::get_deployment))
        .route("/deployments/{id}/cancel", post(handlers::cancel_deployment))
        .route("/services/{name}/traffic", get(handlers::get_traffic))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
