use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use serde_json::{Value, json};

use aiproxy_common::ProxyError;
use aiproxy_credential::{JsonMap, RefreshError, TokenRefresher};

use crate::http::client_for_proxy;

use super::{AuthBundle, expiry_rfc3339, read_json_response};

const CLIENT_ID: &str = "kimi-cli";
const DEVICE_CODE_URL: &str = "https://auth.moonshot.cn/oauth2/device/code";
const TOKEN_URL: &str = "https://auth.moonshot.cn/oauth2/token";
const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const PLATFORM: &str = "kimi-cli";
const VERSION: &str = "1.0.0";

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);
const FLOW_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Kimi wants a refresh well before expiry.
pub const REFRESH_SKEW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub interval: Duration,
    pub expires_in: i64,
    pub device_id: String,
}

/// Random device identity sent on every Msh request; minted once per flow.
pub fn generate_device_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn msh_headers(request: wreq::RequestBuilder, device_id: &str) -> wreq::RequestBuilder {
    request
        .header("X-Msh-Platform", PLATFORM)
        .header("X-Msh-Version", VERSION)
        .header("X-Msh-Device-Id", device_id)
        .header("X-Msh-Device-Name", "aiproxy")
}

pub async fn start_device_flow(proxy: Option<&str>) -> Result<DeviceAuthorization, ProxyError> {
    let client = client_for_proxy(proxy)?;
    let device_id = generate_device_id();
    let form = [("client_id", CLIENT_ID)];
    let response = msh_headers(client.post(DEVICE_CODE_URL), &device_id)
        .form(&form)
        .send()
        .await
        .map_err(|err| ProxyError::upstream(err.to_string()))?;
    let payload = read_json_response(response, "kimi device authorization").await?;
    Ok(DeviceAuthorization {
        device_code: payload
            .get("device_code")
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::upstream("kimi device authorization incomplete"))?
            .to_string(),
        user_code: payload
            .get("user_code")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        verification_uri: payload
            .get("verification_uri")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
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
        device_id,
    })
}

pub async fn poll_for_tokens(
    authorization: &DeviceAuthorization,
    proxy: Option<&str>,
) -> Result<AuthBundle, ProxyError> {
    let client = client_for_proxy(proxy)?;
    let budget = FLOW_TIMEOUT.min(Duration::from_secs(authorization.expires_in.max(0) as u64));
    let deadline = tokio::time::Instant::now() + budget;
    let mut interval = authorization.interval.max(MIN_POLL_INTERVAL);

    loop {
        tokio::time::sleep(interval).await;
        if tokio::time::Instant::now() >= deadline {
            return Err(ProxyError::upstream("kimi device flow timed out"));
        }
        let form = [
            ("grant_type", DEVICE_GRANT),
            ("client_id", CLIENT_ID),
            ("device_code", authorization.device_code.as_str()),
        ];
        let response = msh_headers(client.post(TOKEN_URL), &authorization.device_id)
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
            return Ok(bundle_from_tokens(&payload, &authorization.device_id));
        }
        match payload.get("error").and_then(Value::as_str) {
            Some("authorization_pending") => {}
            Some("slow_down") => {
                interval = (interval.mul_f64(1.5)).min(Duration::from_secs(10));
            }
            Some("expired_token") => {
                return Err(ProxyError::upstream("kimi device code expired"));
            }
            Some("access_denied") => {
                return Err(ProxyError::upstream("kimi authorization denied"));
            }
            other => {
                return Err(ProxyError::upstream(format!(
                    "kimi token poll failed: {status} {other:?}"
                )));
            }
        }
    }
}

fn bundle_from_tokens(tokens: &Value, device_id: &str) -> AuthBundle {
    let mut metadata = JsonMap::new();
    metadata.insert("type".to_string(), json!("kimi"));
    if let Some(token) = tokens.get("access_token").and_then(Value::as_str) {
        metadata.insert("access_token".to_string(), json!(token));
    }
    if let Some(token) = tokens.get("refresh_token").and_then(Value::as_str) {
        metadata.insert("refresh_token".to_string(), json!(token));
    }
    if let Some(expires_in) = tokens.get("expires_in").and_then(Value::as_i64) {
        metadata.insert("expired".to_string(), json!(expiry_rfc3339(expires_in)));
    }
    metadata.insert("device_id".to_string(), json!(device_id));
    let stamp = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    AuthBundle {
        provider: "kimi",
        file_name: format!("kimi-{stamp}.json"),
        label: format!("kimi-{stamp}"),
        email: None,
        metadata,
    }
}

pub struct KimiRefresher;

#[async_trait]
impl TokenRefresher for KimiRefresher {
    fn provider(&self) -> &'static str {
        "kimi"
    }

    fn refresh_skew(&self) -> Duration {
        REFRESH_SKEW
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
        let device_id = metadata
            .get("device_id")
            .and_then(Value::as_str)
            .unwrap_or("aiproxy");
        let client =
            client_for_proxy(proxy).map_err(|err| RefreshError::Transport(err.to_string()))?;
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", CLIENT_ID),
            ("refresh_token", refresh_token),
        ];
        let response = msh_headers(client.post(TOKEN_URL), device_id)
            .form(&form)
            .send()
            .await
            .map_err(|err| RefreshError::Transport(err.to_string()))?;
        let tokens = read_json_response(response, "kimi token refresh")
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
