//! HTTP control plane.
//!
//! Two routes: create a projection from a plain-text script body, and
//! delete it by name.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tracing::warn;

use alembic_dsl::DslError;

use crate::service::{ProjectionService, RuntimeFactory, ServiceError};

/// Error wrapper mapping service failures onto HTTP statuses.
#[derive(Debug)]
pub struct ApiError(ServiceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::AlreadyExists(_) => StatusCode::CONFLICT,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Compile(_) => StatusCode::BAD_REQUEST,
            ServiceError::Processor(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Terminated => StatusCode::SERVICE_UNAVAILABLE,
        };
        warn!(status = %status, error = %self.0, "request failed");
        (status, self.0.to_string()).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

pub fn router<F: RuntimeFactory + 'static>(svc: Arc<ProjectionService<F>>) -> Router {
    Router::new()
        .route(
            "/projections/{name}",
            post(create_projection::<F>).delete(delete_projection::<F>),
        )
        .with_state(svc)
}

/// `POST /projections/{name}` with the script as the plain-text body.
async fn create_projection<F: RuntimeFactory>(
    State(svc): State<Arc<ProjectionService<F>>>,
    Path(name): Path<String>,
    body: String,
) -> Result<StatusCode, ApiError> {
    if body.trim().is_empty() {
        return Err(ApiError(ServiceError::Compile(DslError::Compile(
            "empty request body".into(),
        ))));
    }
    svc.create(&name, &body).await?;
    Ok(StatusCode::OK)
}

/// `DELETE /projections/{name}`.
async fn delete_projection<F: RuntimeFactory>(
    State(svc): State<Arc<ProjectionService<F>>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    svc.delete(&name).await?;
    Ok(StatusCode::OK)
}
