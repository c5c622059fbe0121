//! HTTP metrics middleware.
//!
//! Records every response, including those produced before a handler runs:
//! 401/403/500 from the authorization gate, and framework-level 404/405.

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::observability::metrics::record_http_request;

/// Record method, normalized path, status and duration for each request.
///
/// Applied as the outermost layer.
pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    record_http_request(&method, &path, response.status().as_u16(), start.elapsed());

    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    async fn handler_200() -> &'static str {
        "OK"
    }

    async fn handler_403() -> (StatusCode, &'static str) {
        (StatusCode::FORBIDDEN, "Forbidden")
    }

    fn test_app() -> Router {
        Router::new()
            .route("/api/public", get(handler_200))
            .route("/api/protected", get(handler_403))
            .layer(middleware::from_fn(http_metrics_middleware))
    }

    async fn send(uri: &str, method: &str) -> StatusCode {
        let request = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request builder should succeed");

        test_app()
            .oneshot(request)
            .await
            .expect("request should succeed")
            .status()
    }

    #[tokio::test]
    async fn test_middleware_passes_success_through() {
        assert_eq!(send("/api/public", "GET").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_middleware_passes_handler_error_through() {
        assert_eq!(send("/api/protected", "GET").await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_middleware_sees_framework_errors() {
        assert_eq!(send("/nonexistent", "GET").await, StatusCode::NOT_FOUND);
        assert_eq!(
            send("/api/public", "DELETE").await,
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
