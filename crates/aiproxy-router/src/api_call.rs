use std::collections::BTreeMap;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use aiproxy_common::ProxyError;
use aiproxy_oauth::http::client_for_proxy;

use crate::error::{ApiError, ApiResult};
use crate::state::ManagementState;

const CALL_TIMEOUT: Duration = Duration::from_secs(60);
const TOKEN_PLACEHOLDER: &str = "$TOKEN$";

#[derive(Debug, Deserialize)]
pub struct ApiCallRequest {
    pub auth_index: Option<u64>,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

/// `POST /api-call`: generic outbound HTTP on behalf of a management
/// caller. Header values containing `$TOKEN$` get the selected credential's
/// live access token; the upstream's status, headers and body come back
/// verbatim.
pub async fn execute(
    State(state): State<ManagementState>,
    Json(request): Json<ApiCallRequest>,
) -> ApiResult<Json<Value>> {
    let method = request.method.to_ascii_uppercase();
    if !matches!(
        method.as_str(),
        "GET" | "POST" | "PUT" | "PATCH" | "DELETE" | "HEAD"
    ) {
        return Err(ApiError(ProxyError::invalid(format!(
            "unsupported method: {}",
            request.method
        ))));
    }
    if !request.url.starts_with("http://") && !request.url.starts_with("https://") {
        return Err(ApiError(ProxyError::invalid(
            "url must be absolute (scheme and host required)",
        )));
    }

    let needs_token = request
        .headers
        .values()
        .any(|value| value.contains(TOKEN_PLACEHOLDER));
    let credential = match request.auth_index {
        Some(index) => state
            .manager
            .list()
            .await
            .into_iter()
            .find(|credential| credential.index == index),
        None => None,
    };

    let token = if needs_token {
        let credential = credential
            .as_ref()
            .ok_or_else(|| ApiError(ProxyError::invalid("auth_index required for $TOKEN$")))?;
        // Refresh-on-demand; a failure here is the documented 400.
        Some(state.manager.resolve_token(&credential.id).await?)
    } else {
        None
    };

    // Transport priority: per-credential proxy, then global, then direct.
    let proxy = credential
        .as_ref()
        .and_then(|credential| credential.proxy_url.clone())
        .or_else(|| state.global_proxy.clone());
    let client =
        client_for_proxy(proxy.as_deref()).map_err(ApiError)?;

    let mut outbound = match method.as_str() {
        "GET" => client.get(&request.url),
        "POST" => client.post(&request.url),
        "PUT" => client.put(&request.url),
        "PATCH" => client.patch(&request.url),
        "DELETE" => client.delete(&request.url),
        _ => client.head(&request.url),
    }
    .timeout(CALL_TIMEOUT);

    for (name, value) in &request.headers {
        let value = match &token {
            Some(token) => value.replace(TOKEN_PLACEHOLDER, token),
            None => value.clone(),
        };
        outbound = outbound.header(name, value);
    }
    if let Some(body) = request.body {
        outbound = outbound.body(body);
    }

    debug!(method = %method, url = %request.url, "api-call dispatch");
    let response = outbound
        .send()
        .await
        .map_err(|err| ApiError(ProxyError::upstream(err.to_string())))?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|err| ApiError(ProxyError::upstream(err.to_string())))?;

    Ok(Json(json!({
        "status": status,
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    })))
}
