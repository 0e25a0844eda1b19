use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use aiproxy_common::ProxyError;
use aiproxy_credential::{JsonMap, RefreshError, TokenRefresher};

use crate::http::client_for_proxy;
use crate::pkce::PkceCodes;

use super::{AuthBundle, expiry_rfc3339, read_json_response, unix_now};

const CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";
const DEVICE_CODE_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/device/code";
const TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
const OAUTH_SCOPE: &str = "openid profile email model.completion";
const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Poll no faster than every five seconds, never slower than every ten.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const FLOW_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub interval: Duration,
    pub expires_in: i64,
}

pub async fn start_device_flow(
    codes: &PkceCodes,
    proxy: Option<&str>,
) -> Result<DeviceAuthorization, ProxyError> {
    let client = client_for_proxy(proxy)?;
    let form = [
        ("client_id", CLIENT_ID),
        ("scope", OAUTH_SCOPE),
        ("code_challenge", codes.challenge.as_str()),
        ("code_challenge_method", "S256"),
    ];
    let response = client
        .post(DEVICE_CODE_URL)
        .form(&form)
        .send()
        .await
        .map_err(|err| ProxyError::upstream(err.to_string()))?;
    let payload = read_json_response(response, "qwen device authorization").await?;
    parse_device_authorization(&payload)
        .ok_or_else(|| ProxyError::upstream("qwen device authorization incomplete"))
}

fn parse_device_authorization(payload: &Value) -> Option<DeviceAuthorization> {
    Some(DeviceAuthorization {
        device_code: payload.get("device_code")?.as_str()?.to_string(),
        user_code: payload.get("user_code")?.as_str()?.to_string(),
        verification_uri: payload.get("verification_uri")?.as_str()?.to_string(),
        verification_uri_complete: payload
            .get("verification_uri_complete")
            .and_then(Value::as_str)
            .map(str::to_string),
        interval: Duration::from_secs(
            payload
                .get("interval")
                .and_then(Value::as_u64)
                .unwrap_or(5)
                .max(MIN_POLL_INTERVAL.as_secs()),
        ),
        expires_in: payload
            .get("expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(300),
    })
}

/// `slow_down` multiplies the interval by 1.5, capped at ten seconds.
pub fn next_interval(current: Duration, slow_down: bool) -> Duration {
    if !slow_down {
        return current.max(MIN_POLL_INTERVAL);
    }
    let scaled = current.mul_f64(1.5);
    scaled.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

/// Poll the token endpoint until the user approves, the device code
/// expires, or the five-minute budget runs out.
pub async fn poll_for_tokens(
    authorization: &DeviceAuthorization,
    codes: &PkceCodes,
    proxy: Option<&str>,
) -> Result<AuthBundle, ProxyError> {
    let client = client_for_proxy(proxy)?;
    let budget = FLOW_TIMEOUT.min(Duration::from_secs(authorization.expires_in.max(0) as u64));
    let deadline = tokio::time::Instant::now() + budget;
    let mut interval = authorization.interval.max(MIN_POLL_INTERVAL);

    loop {
        tokio::time::sleep(interval).await;
        if tokio::time::Instant::now() >= deadline {
            return Err(ProxyError::upstream("qwen device flow timed out"));
        }
        let form = [
            ("grant_type", DEVICE_GRANT),
            ("client_id", CLIENT_ID),
            ("device_code", authorization.device_code.as_str()),
            ("code_verifier", codes.verifier.as_str()),
        ];
        let response = client
            .post(TOKEN_URL)
            .form(&form)
            .send()
            .await
            .map_err(|err| ProxyError::upstream(err.to_string()))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|err| ProxyError::upstream(err.to_string()))?;

        if status.is_success() && payload.get("access_token").is_some() {
            return Ok(bundle_from_tokens(&payload));
        }
        match payload.get("error").and_then(Value::as_str) {
            Some("authorization_pending") => {}
            Some("slow_down") => {
                interval = next_interval(interval, true);
                debug!(?interval, "qwen asked to slow down");
            }
            Some("expired_token") => {
                return Err(ProxyError::upstream("qwen device code expired"));
            }
            Some("access_denied") => {
                return Err(ProxyError::upstream("qwen authorization denied"));
            }
            other => {
                return Err(ProxyError::upstream(format!(
                    "qwen token poll failed: {status} {other:?}"
                )));
            }
        }
    }
}

fn bundle_from_tokens(tokens: &Value) -> AuthBundle {
    let mut metadata = JsonMap::new();
    metadata.insert("type".to_string(), json!("qwen"));
    if let Some(token) = tokens.get("access_token").and_then(Value::as_str) {
        metadata.insert("access_token".to_string(), json!(token));
    }
    if let Some(token) = tokens.get("refresh_token").and_then(Value::as_str) {
        metadata.insert("refresh_token".to_string(), json!(token));
    }
    if let Some(endpoint) = tokens.get("resource_url").and_then(Value::as_str) {
        metadata.insert("resource_url".to_string(), json!(endpoint));
    }
    if let Some(expires_in) = tokens.get("expires_in").and_then(Value::as_i64) {
        metadata.insert("expired".to_string(), json!(expiry_rfc3339(expires_in)));
    }
    let stamp = unix_now();
    AuthBundle {
        provider: "qwen",
        file_name: format!("qwen-{stamp}.json"),
        label: format!("qwen-{stamp}"),
        email: None,
        metadata,
    }
}

pub struct QwenRefresher;

#[async_trait]
impl TokenRefresher for QwenRefresher {
    fn provider(&self) -> &'static str {
        "qwen"
    }

    async fn refresh(
        &self,
        metadata: &JsonMap,
        proxy: Option<&str>,
    ) -> Result<JsonMap, RefreshError> {
        let refresh_token = metadata
            .get("refresh_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or(RefreshError::MissingMaterial("refresh_token"))?;
        let client =
            client_for_proxy(proxy).map_err(|err| RefreshError::Transport(err.to_string()))?;
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", CLIENT_ID),
            ("refresh_token", refresh_token),
        ];
        let response = client
            .post(TOKEN_URL)
            .form(&form)
            .send()
            .await
            .map_err(|err| RefreshError::Transport(err.to_string()))?;
        let tokens = read_json_response(response, "qwen token refresh")
            .await
            .map_err(|err| RefreshError::Rejected(err.to_string()))?;

        let mut updated = metadata.clone();
        if let Some(token) = tokens.get("access_token").and_then(Value::as_str) {
            updated.insert("access_token".to_string(), json!(token));
        }
        if let Some(token) = tokens.get("refresh_token").and_then(Value::as_str) {
            updated.insert("refresh_token".to_string(), json!(token));
        }
        if let Some(expires_in) = tokens.get("expires_in").and_then(Value::as_i64) {
            updated.insert("expired".to_string(), json!(expiry_rfc3339(expires_in)));
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_floor_is_five_seconds() {
        let payload = json!({
            "device_code": "d",
            "user_code": "u",
            "verification_uri": "https://chat.qwen.ai/activate",
            "interval": 2,
            "expires_in": 600
        });
        let authorization = parse_device_authorization(&payload).unwrap();
        assert_eq!(authorization.interval, Duration::from_secs(5));
    }

    #[test]
    fn slow_down_scales_and_caps() {
        let after_one = next_interval(Duration::from_secs(5), true);
        assert_eq!(after_one, Duration::from_millis(7500));
        let after_two = next_interval(after_one, true);
        assert_eq!(after_two, Duration::from_millis(11_250).min(MAX_POLL_INTERVAL));
        assert_eq!(after_two, MAX_POLL_INTERVAL);
        // Without slow_down the interval holds.
        assert_eq!(
            next_interval(Duration::from_secs(6), false),
            Duration::from_secs(6)
        );
    }

    #[test]
    fn bundles_are_timestamp_named() {
        let bundle = bundle_from_tokens(&json!({
            "access_token": "at",
            "refresh_token": "rt",
            "expires_in": 3600
        }));
        assert!(bundle.file_name.starts_with("qwen-"));
        assert!(bundle.file_name.ends_with(".json"));
        assert_eq!(bundle.metadata.get("type"), Some(&json!("qwen")));
    }
}
