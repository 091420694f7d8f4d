//! HTTP and WebSocket surface over the job engine.

pub mod routes;
pub mod throttle;
pub mod ws;

use std::sync::Arc;

use axum::{Json, Router, http::HeaderValue, http::StatusCode, middleware};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::error::{Error, JobError, SheetError};
use crate::events::BroadcastPublisher;
use crate::jobs::JobManager;
use crate::sheet::InMemorySheetStore;
use throttle::RequestThrottle;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub sheets: Arc<InMemorySheetStore>,
    /// Event fan-out the WebSocket clients subscribe to.
    pub events: Arc<BroadcastPublisher>,
    /// Per-client request throttle. `None` serves every request.
    pub throttle: Option<Arc<RequestThrottle>>,
}

/// Build the full router: REST, WebSocket, request throttle, CORS.
///
/// An empty origin list allows any origin. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so the throttle can
/// tell clients apart.
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    let request_throttle = state.throttle.clone();
    let app = Router::new()
        .merge(routes::rest_routes())
        .merge(ws::ws_routes())
        .with_state(state);

    let app = match request_throttle {
        Some(t) => app.layer(middleware::from_fn_with_state(t, throttle::limit_requests)),
        None => app,
    };
    app.layer(ServiceBuilder::new().layer(cors_layer(allowed_origins)))
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// HTTP status for an engine error.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Sheet(SheetError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Sheet(_) => StatusCode::BAD_REQUEST,
        Error::Job(JobError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Job(JobError::MaxJobsExceeded { .. }) => StatusCode::TOO_MANY_REQUESTS,
        Error::Job(_) => StatusCode::CONFLICT,
        Error::Send(_) => StatusCode::BAD_GATEWAY,
        Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
    }
}

/// `{ "error", "code" }` body for an engine error.
pub fn error_response(err: &Error) -> (StatusCode, Json<Value>) {
    let status = status_for(err);
    let message = match err {
        // Never leak configuration internals.
        Error::Config(_) => "Internal configuration error".to_string(),
        other => other.to_string(),
    };
    (status, Json(json!({ "error": message, "code": err.code() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, ValidationError};
    use uuid::Uuid;

    #[test]
    fn error_status_mapping() {
        let (status, body) = error_response(&ValidationError::EmptyTemplate.into());
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.0["code"], "VALIDATION_ERROR");

        let (status, body) = error_response(&JobError::NotFound { id: Uuid::nil() }.into());
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.0["code"], "JOB_NOT_FOUND");

        let (status, _) = error_response(&JobError::MaxJobsExceeded { max: 5 }.into());
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        let (status, body) = error_response(&Error::RateLimited { limit: 5, window_secs: 60 });
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body.0["code"], "RATE_LIMIT_EXCEEDED");

        let (status, body) = error_response(
            &ConfigError::InvalidValue {
                key: "X".into(),
                message: "secret".into(),
            }
            .into(),
        );
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.0["error"].as_str().unwrap().contains("secret"));
    }
}
