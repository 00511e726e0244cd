//! Common test infrastructure
//!
//! Spawns an isolated admission server per test, with direct handles on
//! the underlying store and queue so tests can stage job states that the
//! API alone cannot reach (e.g. failed jobs to retry).

mod client;
mod server;

pub use client::TestClient;
pub use server::TestServer;

/// API key configured on every test server.
pub const TEST_API_KEY: &str = "test-key";
