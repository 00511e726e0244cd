//! HTTP admission surface.

mod auth;
mod job_routes;
#[allow(clippy::module_inception)]
pub mod server;
pub mod state;

pub use auth::ApiKeyIdentity;
pub use server::{make_app, run_server};
pub use state::{ServerConfig, ServerState};
