//! Test server lifecycle management.

use std::sync::Arc;

use embed_server::admission::JobService;
use embed_server::config::ApiKey;
use embed_server::job_store::SqliteJobStore;
use embed_server::queue::SqliteJobQueue;
use embed_server::server::{make_app, ServerConfig};
use tokio_util::sync::CancellationToken;

use super::TEST_API_KEY;

/// Admission server bound to a random port, with no worker pool attached:
/// admitted jobs stay queued, which is exactly what the API tests need.
pub struct TestServer {
    pub base_url: String,
    pub port: u16,

    /// Direct store access for staging job states in tests.
    pub store: Arc<SqliteJobStore>,
    /// Direct queue access for asserting enqueue behavior.
    pub queue: Arc<SqliteJobQueue>,

    shutdown: CancellationToken,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let store = Arc::new(SqliteJobStore::in_memory().expect("Failed to open job store"));
        let queue = Arc::new(SqliteJobQueue::in_memory().expect("Failed to open queue"));
        let jobs = Arc::new(JobService::new(store.clone(), queue.clone()));

        let config = ServerConfig {
            api_keys: vec![ApiKey {
                key: TEST_API_KEY.to_string(),
                name: "e2e-tests".to_string(),
            }],
        };
        let app = make_app(config, jobs);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener.local_addr().expect("Failed to get local address").port();
        let base_url = format!("http://127.0.0.1:{port}");

        let shutdown = CancellationToken::new();
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
                    .expect("Server failed");
            });
        }

        Self {
            base_url,
            port,
            store,
            queue,
            shutdown,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
