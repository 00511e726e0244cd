use anyhow::Result;
use axum::middleware;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::auth::require_api_key;
use super::job_routes::{health, job_routes};
use super::state::{ServerConfig, ServerState};
use crate::admission::JobService;

/// Build the HTTP application. The job routes sit behind the API-key
/// middleware; the health probes stay open.
pub fn make_app(config: ServerConfig, jobs: Arc<JobService>) -> Router {
    let state = ServerState {
        config,
        start_time: Instant::now(),
        jobs,
    };

    let api = job_routes().layer(middleware::from_fn_with_state(
        state.clone(),
        require_api_key,
    ));

    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(health))
        .nest("/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the shutdown token fires.
pub async fn run_server(
    config: ServerConfig,
    jobs: Arc<JobService>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = make_app(config, jobs);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Listening on port {port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKey;
    use crate::job_store::SqliteJobStore;
    use crate::queue::SqliteJobQueue;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_app() -> Router {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let queue = Arc::new(SqliteJobQueue::in_memory().unwrap());
        let jobs = Arc::new(JobService::new(store, queue));
        let config = ServerConfig {
            api_keys: vec![ApiKey {
                key: "test-key".to_string(),
                name: "tests".to_string(),
            }],
        };
        make_app(config, jobs)
    }

    #[tokio::test]
    async fn responds_unauthorized_on_protected_routes() {
        let app = test_app();

        let protected_routes = vec![
            "/v1/jobs",
            "/v1/jobs/123",
        ];

        for route in protected_routes {
            let request = Request::builder().uri(route).body(Body::empty()).unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{route}");
        }

        let request = Request::builder()
            .method("POST")
            .uri("/v1/jobs/123/retry")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn responds_ok_on_health_without_auth() {
        let app = test_app();

        for route in ["/healthz", "/readyz"] {
            let request = Request::builder().uri(route).body(Body::empty()).unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{route}");
        }
    }

    #[tokio::test]
    async fn accepts_api_key_via_query_parameter() {
        let app = test_app();

        let request = Request::builder()
            .uri("/v1/jobs?api_key=test-key")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder()
            .uri("/v1/jobs?api_key=wrong")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
