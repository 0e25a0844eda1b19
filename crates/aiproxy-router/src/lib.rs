pub mod api_call;
pub mod auth_files;
pub mod error;
pub mod oauth_routes;
pub mod state;
pub mod usage;

use axum::Router;
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};

use state::ManagementState;

/// Management surface mounted under `/v0/management`. Everything requires
/// the management key except the browser-facing OAuth callback bounce and
/// the health probe.
pub fn management_router(state: ManagementState) -> Router {
    let authed = Router::new()
        .route(
            "/auth-files",
            get(auth_files::list)
                .post(auth_files::upload)
                .delete(auth_files::remove),
        )
        .route("/auth-files/status", patch(auth_files::patch_status))
        .route("/auth-files/fields", patch(auth_files::patch_fields))
        .route("/oauth/{provider}", post(oauth_routes::start))
        .route("/oauth/callback", post(oauth_routes::callback))
        .route("/oauth/status", get(oauth_routes::status))
        .route("/api-call", post(api_call::execute))
        .route("/vertex/import", post(auth_files::vertex_import))
        .route("/usage/statistics", get(usage::statistics))
        .route("/usage/export", get(usage::export))
        .route("/usage/import", post(usage::import))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            management_auth,
        ));

    Router::new()
        .nest(
            "/v0/management",
            Router::new()
                .route(
                    "/oauth/callback/{provider}",
                    get(oauth_routes::browser_callback),
                )
                .merge(authed),
        )
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "ok": true }))
}

async fn management_auth(
    axum::extract::State(state): axum::extract::State<ManagementState>,
    headers: HeaderMap,
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let key = extract_management_key(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    if key != state.management_key {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}

fn extract_management_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-management-key")
        && let Ok(raw) = value.to_str()
    {
        let raw = raw.trim();
        if !raw.is_empty() {
            return Some(raw.to_string());
        }
    }
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
    {
        let raw = raw.trim();
        let prefix = "Bearer ";
        if raw.len() > prefix.len() && raw[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = raw[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn management_key_comes_from_either_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-management-key", HeaderValue::from_static("k1"));
        assert_eq!(extract_management_key(&headers).as_deref(), Some("k1"));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer k2"));
        assert_eq!(extract_management_key(&headers).as_deref(), Some("k2"));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xx"));
        assert!(extract_management_key(&headers).is_none());
        assert!(extract_management_key(&HeaderMap::new()).is_none());
    }
}
