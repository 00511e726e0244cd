use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Instant;

use crate::admission::JobService;
use crate::config::ApiKey;

/// Server-side configuration, shared with handlers through the state.
#[derive(Clone, Default)]
pub struct ServerConfig {
    pub api_keys: Vec<ApiKey>,
}

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub jobs: Arc<JobService>,
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for Arc<JobService> {
    fn from_ref(input: &ServerState) -> Self {
        input.jobs.clone()
    }
}
