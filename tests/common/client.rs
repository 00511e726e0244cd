//! HTTP client helpers for the e2e tests.

use serde_json::Value;

use super::TEST_API_KEY;

/// Thin wrapper over reqwest with the test API key pre-applied.
pub struct TestClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl TestClient {
    /// Client without credentials, for auth tests.
    pub fn unauthenticated(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key: None,
        }
    }

    /// Client sending the configured test API key on every request.
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key: Some(TEST_API_KEY.to_string()),
        }
    }

    /// Client sending an arbitrary API key.
    pub fn with_api_key(base_url: String, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key: Some(api_key.to_string()),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.get(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }
        request
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }
        request
    }

    pub async fn create_job(&self, body: &Value) -> reqwest::Response {
        self.post("/v1/jobs").json(body).send().await.unwrap()
    }

    pub async fn get_job(&self, id: &str) -> reqwest::Response {
        self.get(&format!("/v1/jobs/{id}")).send().await.unwrap()
    }

    pub async fn list_jobs(&self, status: Option<&str>) -> reqwest::Response {
        let path = match status {
            Some(status) => format!("/v1/jobs?status={status}"),
            None => "/v1/jobs".to_string(),
        };
        self.get(&path).send().await.unwrap()
    }

    pub async fn retry_job(&self, id: &str) -> reqwest::Response {
        self.post(&format!("/v1/jobs/{id}/retry")).send().await.unwrap()
    }

    pub async fn cancel_job(&self, id: &str) -> reqwest::Response {
        self.post(&format!("/v1/jobs/{id}/cancel")).send().await.unwrap()
    }

    pub async fn healthz(&self) -> reqwest::Response {
        self.client
            .get(format!("{}/healthz", self.base_url))
            .send()
            .await
            .unwrap()
    }

    pub async fn readyz(&self) -> reqwest::Response {
        self.client
            .get(format!("{}/readyz", self.base_url))
            .send()
            .await
            .unwrap()
    }
}
