//! Subsonic-compatible client for the downstream media indexer.
//!
//! The pipeline only needs the scan-trigger/scan-wait contract: start a
//! scan after a file lands in the library and poll until the indexer
//! reports it is done.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::IndexerSettings;

const CLIENT_NAME: &str = "embed-server";

/// Scan state reported by the indexer.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ScanStatus {
    #[serde(default)]
    pub scanning: bool,
    #[serde(default)]
    pub count: i64,
}

/// Seam between the pipeline and the indexer client.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Connectivity check. Non-fatal at worker startup.
    async fn ping(&self) -> Result<()>;

    /// Trigger a library scan.
    async fn start_scan(&self) -> Result<()>;

    /// Fetch the current scan state.
    async fn get_scan_status(&self) -> Result<ScanStatus>;

    /// Poll every 3 seconds until scanning flips to false or the timeout
    /// elapses.
    async fn wait_for_scan(&self, timeout: Duration) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "subsonic-response")]
    subsonic_response: EnvelopeInner,
}

#[derive(Debug, Deserialize)]
struct EnvelopeInner {
    status: String,
    #[serde(default)]
    version: String,
    #[serde(rename = "scanStatus", default)]
    scan_status: Option<ScanStatus>,
}

pub(crate) fn md5_hex(input: &str) -> String {
    use md5::Digest;
    hex::encode(md5::Md5::digest(input.as_bytes()))
}

/// Subsonic-style HTTP client. Auth token and salt are fixed per client
/// instance: `t = md5(password + salt)`, with a nanosecond timestamp as
/// the salt.
pub struct SubsonicClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    api_version: String,
    token: String,
    salt: String,
}

impl SubsonicClient {
    pub fn new(settings: &IndexerSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(format!("{CLIENT_NAME}/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to create HTTP client");

        let salt = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_string();
        let token = md5_hex(&format!("{}{}", settings.password, salt));

        Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            api_version: settings.api_version.clone(),
            token,
            salt,
        }
    }

    fn auth_params(&self) -> [(&'static str, &str); 6] {
        [
            ("u", self.username.as_str()),
            ("t", self.token.as_str()),
            ("s", self.salt.as_str()),
            ("v", self.api_version.as_str()),
            ("c", CLIENT_NAME),
            ("f", "json"),
        ]
    }

    async fn get_rest(&self, endpoint: &str) -> Result<EnvelopeInner> {
        let response = self
            .client
            .get(format!("{}/rest/{endpoint}", self.base_url))
            .query(&self.auth_params())
            .send()
            .await
            .context("request failed")?;

        if response.status() != reqwest::StatusCode::OK {
            bail!("unexpected status code: {}", response.status().as_u16());
        }

        let envelope: Envelope = response
            .json()
            .await
            .with_context(|| format!("failed to parse {endpoint} response"))?;
        Ok(envelope.subsonic_response)
    }
}

#[async_trait]
impl Indexer for SubsonicClient {
    async fn ping(&self) -> Result<()> {
        debug!("pinging indexer");
        let inner = self.get_rest("ping").await?;
        if inner.status != "ok" {
            bail!("ping failed: status={}", inner.status);
        }
        info!(version = %inner.version, "indexer ping successful");
        Ok(())
    }

    async fn start_scan(&self) -> Result<()> {
        info!("starting indexer scan");
        let inner = self.get_rest("startScan").await?;
        if inner.status != "ok" {
            bail!("scan start failed: status={}", inner.status);
        }
        Ok(())
    }

    async fn get_scan_status(&self) -> Result<ScanStatus> {
        let inner = self.get_rest("getScanStatus").await?;
        if inner.status != "ok" {
            bail!("get scan status failed: status={}", inner.status);
        }
        Ok(inner.scan_status.unwrap_or_default())
    }

    async fn wait_for_scan(&self, timeout: Duration) -> Result<()> {
        info!(timeout_secs = timeout.as_secs(), "waiting for scan to complete");

        let poll = async {
            let mut ticker = tokio::time::interval(Duration::from_secs(3));
            // Skip the immediate first tick; the first status check
            // happens one interval after the scan was started.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.get_scan_status().await {
                    Ok(status) if !status.scanning => {
                        info!(count = status.count, "scan completed");
                        return;
                    }
                    Ok(status) => debug!(count = status.count, "scan in progress"),
                    Err(e) => warn!("failed to get scan status: {e:#}"),
                }
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| anyhow::anyhow!("scan timeout after {}s", timeout.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn settings(base_url: &str) -> IndexerSettings {
        IndexerSettings {
            base_url: base_url.to_string(),
            username: "admin".to_string(),
            password: "secret123".to_string(),
            api_version: "1.16.1".to_string(),
        }
    }

    async fn spawn_indexer(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn ok_envelope(extra: Value) -> Value {
        let mut inner = json!({"status": "ok", "version": "1.16.1"});
        if let (Some(inner_map), Some(extra_map)) = (inner.as_object_mut(), extra.as_object()) {
            for (key, value) in extra_map {
                inner_map.insert(key.clone(), value.clone());
            }
        }
        json!({"subsonic-response": inner})
    }

    #[test]
    fn test_token_math() {
        // t = md5(password + salt)
        assert_eq!(
            md5_hex("secret123randomsalt"),
            md5_hex(&format!("{}{}", "secret123", "randomsalt"))
        );
        assert_eq!(md5_hex("password"), "5f4dcc3b5aa765d61d8327deb882cf99");
    }

    #[test]
    fn test_auth_params() {
        let client = SubsonicClient::new(&settings("http://navi:4533/"));
        let params = client.auth_params();
        let map: HashMap<_, _> = params.iter().cloned().collect();

        assert_eq!(map["u"], "admin");
        assert_eq!(map["v"], "1.16.1");
        assert_eq!(map["c"], CLIENT_NAME);
        assert_eq!(map["f"], "json");
        // Token is md5(password + salt)
        assert_eq!(map["t"], md5_hex(&format!("secret123{}", map["s"])));
        assert_eq!(client.base_url, "http://navi:4533");
    }

    #[tokio::test]
    async fn test_ping_ok() {
        let app = Router::new().route(
            "/rest/ping",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(params.get("f").map(String::as_str), Some("json"));
                assert!(params.contains_key("t"));
                assert!(params.contains_key("s"));
                Json(ok_envelope(json!({})))
            }),
        );
        let base = spawn_indexer(app).await;
        let client = SubsonicClient::new(&settings(&base));
        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_scan_failed_status() {
        let app = Router::new().route(
            "/rest/startScan",
            get(|| async { Json(json!({"subsonic-response": {"status": "failed"}})) }),
        );
        let base = spawn_indexer(app).await;
        let client = SubsonicClient::new(&settings(&base));
        let err = client.start_scan().await.unwrap_err();
        assert!(err.to_string().contains("status=failed"), "{err}");
    }

    #[tokio::test]
    async fn test_get_scan_status() {
        let app = Router::new().route(
            "/rest/getScanStatus",
            get(|| async {
                Json(ok_envelope(json!({"scanStatus": {"scanning": true, "count": 42}})))
            }),
        );
        let base = spawn_indexer(app).await;
        let client = SubsonicClient::new(&settings(&base));
        let status = client.get_scan_status().await.unwrap();
        assert!(status.scanning);
        assert_eq!(status.count, 42);
    }

    #[tokio::test]
    async fn test_wait_for_scan_completes() {
        // First poll reports scanning, second reports done.
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route(
            "/rest/getScanStatus",
            get({
                let calls = calls.clone();
                move || {
                    let calls = calls.clone();
                    async move {
                        let scanning = calls.fetch_add(1, Ordering::SeqCst) == 0;
                        Json(ok_envelope(
                            json!({"scanStatus": {"scanning": scanning, "count": 7}}),
                        ))
                    }
                }
            }),
        );
        let base = spawn_indexer(app).await;
        let client = SubsonicClient::new(&settings(&base));
        client.wait_for_scan(Duration::from_secs(30)).await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_wait_for_scan_timeout() {
        let app = Router::new().route(
            "/rest/getScanStatus",
            get(|| async {
                Json(ok_envelope(json!({"scanStatus": {"scanning": true, "count": 0}})))
            }),
        );
        let base = spawn_indexer(app).await;
        let client = SubsonicClient::new(&settings(&base));
        let err = client
            .wait_for_scan(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("scan timeout"), "{err}");
    }
}
