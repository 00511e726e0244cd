//! API-key authentication for the admission surface.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::state::ServerConfig;

/// Name of the API key that authenticated a request, stored in request
/// extensions so handlers can attribute actions for audit logging.
#[derive(Debug, Clone)]
pub struct ApiKeyIdentity(pub String);

fn auth_error(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}

/// Require a configured API key via the `X-API-Key` header or the
/// `api_key` query parameter.
pub async fn require_api_key(
    State(config): State<ServerConfig>,
    mut request: Request,
    next: Next,
) -> Response {
    let header_key = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|key| !key.is_empty());

    let query_key = request.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "api_key")
            .map(|(_, value)| value.into_owned())
            .filter(|key| !key.is_empty())
    });

    let Some(api_key) = header_key.or(query_key) else {
        return auth_error("missing api key");
    };

    match config.api_keys.iter().find(|entry| entry.key == api_key) {
        Some(matched) => {
            request
                .extensions_mut()
                .insert(ApiKeyIdentity(matched.name.clone()));
            next.run(request).await
        }
        None => auth_error("invalid api key"),
    }
}
