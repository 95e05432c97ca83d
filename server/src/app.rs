use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{Method, header};
use axum::routing::{get, post};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};

use crate::config::MAX_BODY_BYTES;
use crate::routes;
use crate::state::AppState;

pub(crate) fn build_app(state: AppState) -> Router {
    let app = Router::new()
        .route(
            "/api/cells",
            get(routes::cells::get_all).post(routes::cells::claim_cell),
        )
        .route("/api/cells/chunk", get(routes::cells::get_chunk))
        .route("/api/cells/batch", post(routes::cells::claim_batch))
        .route("/api/ranking", get(routes::api::ranking))
        .route("/api/events", get(routes::sse::cell_events))
        .route("/api/health", get(routes::api::health));

    // SSE responses are exempt from the default compression predicate.
    app.layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(viewer_cors())
        .with_state(state)
}

fn viewer_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::SocketAddr;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use gridclaim_shared::GridGeometry;
    use tower::ServiceExt;

    use super::build_app;
    use crate::state::AppState;

    pub(crate) async fn spawn_test_server(
        state: AppState,
    ) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener address");
        let app = build_app(state);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve test app");
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let app = build_app(AppState::with_limits(GridGeometry::default(), 4, 4));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/nope")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cors_preflight_allows_claim_posts() {
        let app = build_app(AppState::with_limits(GridGeometry::default(), 4, 4));
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/cells")
                    .header("origin", "http://localhost:8080")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert!(response.status().is_success());
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }
}
