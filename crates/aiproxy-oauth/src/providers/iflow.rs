use async_trait::async_trait;
use serde_json::{Value, json};

use aiproxy_common::ProxyError;
use aiproxy_credential::{JsonMap, RefreshError, TokenRefresher};

use crate::http::client_for_proxy;

use super::{AuthBundle, expiry_rfc3339, read_json_response, sanitize_file_component, unix_now};

const CLIENT_ID: &str = "10009311001";
const CLIENT_SECRET: &str = "4Z3YjXycVsQvyGF2etnNHnxgkVOvyyo3";
const AUTHORIZE_URL: &str = "https://iflow.cn/oauth";
const TOKEN_URL: &str = "https://iflow.cn/oauth/token";
const USER_INFO_URL: &str = "https://platform.iflow.cn/api/v1/user/info";
const OAUTH_SCOPE: &str = "openid profile api";

pub fn build_auth_url(state: &str, redirect_uri: &str) -> String {
    format!(
        "{AUTHORIZE_URL}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(OAUTH_SCOPE),
        urlencoding::encode(state),
    )
}

pub async fn exchange_code(
    code: &str,
    redirect_uri: &str,
    proxy: Option<&str>,
) -> Result<AuthBundle, ProxyError> {
    let client = client_for_proxy(proxy)?;
    let form = [
        ("grant_type", "authorization_code"),
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
        ("code", code),
        ("redirect_uri", redirect_uri),
    ];
    let response = client
        .post(TOKEN_URL)
        .form(&form)
        .send()
        .await
        .map_err(|err| ProxyError::upstream(err.to_string()))?;
    let tokens = read_json_response(response, "iflow token exchange").await?;
    let access_token = tokens
        .get("access_token")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::upstream("iflow token exchange returned no access_token"))?;

    // The chat token is only half the story: the platform API key comes from
    // the user-info endpoint.
    let info = fetch_user_info(&client, access_token).await?;
    Ok(bundle_from_parts(&tokens, &info, None))
}

async fn fetch_user_info(client: &wreq::Client, access_token: &str) -> Result<Value, ProxyError> {
    let response = client
        .get(USER_INFO_URL)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|err| ProxyError::upstream(err.to_string()))?;
    let payload = read_json_response(response, "iflow user info").await?;
    Ok(payload.get("data").cloned().unwrap_or(payload))
}

/// Cookie import: extract the `BXAuth` session cookie and mint an API key
/// through the platform endpoint, no browser round trip needed.
pub async fn import_from_cookie(
    cookie: &str,
    proxy: Option<&str>,
) -> Result<AuthBundle, ProxyError> {
    let bx_auth = extract_bx_auth(cookie)
        .ok_or_else(|| ProxyError::invalid("cookie does not contain BXAuth"))?;
    let client = client_for_proxy(proxy)?;
    let response = client
        .get(USER_INFO_URL)
        .header("Cookie", format!("BXAuth={bx_auth}"))
        .send()
        .await
        .map_err(|err| ProxyError::upstream(err.to_string()))?;
    let payload = read_json_response(response, "iflow cookie import").await?;
    let info = payload.get("data").cloned().unwrap_or(payload);
    Ok(bundle_from_parts(&Value::Null, &info, Some(&bx_auth)))
}

/// `BXAuth=<value>` somewhere in a Cookie header line.
pub fn extract_bx_auth(cookie: &str) -> Option<String> {
    cookie.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name.trim() == "BXAuth" && !value.trim().is_empty()).then(|| value.trim().to_string())
    })
}

/// Duplicate-import detection key: two credentials with the same BXAuth are
/// the same account.
pub fn cookie_auth_key(metadata: &JsonMap) -> Option<String> {
    metadata
        .get("cookie")
        .and_then(Value::as_str)
        .and_then(extract_bx_auth)
}

fn bundle_from_parts(tokens: &Value, info: &Value, bx_auth: Option<&str>) -> AuthBundle {
    let api_key = info.get("apiKey").and_then(Value::as_str);
    let email = info
        .get("email")
        .and_then(Value::as_str)
        .filter(|email| !email.is_empty())
        .map(str::to_string);
    let label = email
        .clone()
        .or_else(|| {
            info.get("phone")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| "iflow".to_string());

    let mut metadata = JsonMap::new();
    metadata.insert("type".to_string(), json!("iflow"));
    if let Some(token) = tokens.get("access_token").and_then(Value::as_str) {
        metadata.insert("access_token".to_string(), json!(token));
    }
    if let Some(token) = tokens.get("refresh_token").and_then(Value::as_str) {
        metadata.insert("refresh_token".to_string(), json!(token));
    }
    if let Some(expires_in) = tokens.get("expires_in").and_then(Value::as_i64) {
        metadata.insert("expired".to_string(), json!(expiry_rfc3339(expires_in)));
    }
    if let Some(api_key) = api_key {
        metadata.insert("api_key".to_string(), json!(api_key));
    }
    if let Some(bx_auth) = bx_auth {
        metadata.insert("cookie".to_string(), json!(format!("BXAuth={bx_auth}")));
    }
    if let Some(email) = &email {
        metadata.insert("email".to_string(), json!(email));
    }

    AuthBundle {
        provider: "iflow",
        file_name: format!(
            "iflow-{}-{}.json",
            sanitize_file_component(&label),
            unix_now()
        ),
        label,
        email,
        metadata,
    }
}

pub struct IflowRefresher;

#[async_trait]
impl TokenRefresher for IflowRefresher {
    fn provider(&self) -> &'static str {
        "iflow"
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
            ("client_secret", CLIENT_SECRET),
            ("refresh_token", refresh_token),
        ];
        let response = client
            .post(TOKEN_URL)
            .form(&form)
            .send()
            .await
            .map_err(|err| RefreshError::Transport(err.to_string()))?;
        let tokens = read_json_response(response, "iflow token refresh")
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
    fn bx_auth_extraction_handles_cookie_lines() {
        assert_eq!(
            extract_bx_auth("BXAuth=tok123").as_deref(),
            Some("tok123")
        );
        assert_eq!(
            extract_bx_auth("session=a; BXAuth=tok123; theme=dark").as_deref(),
            Some("tok123")
        );
        assert!(extract_bx_auth("session=a; theme=dark").is_none());
        assert!(extract_bx_auth("BXAuth=").is_none());
    }

    #[test]
    fn duplicate_detection_reads_the_stored_cookie() {
        let mut metadata = JsonMap::new();
        metadata.insert("cookie".to_string(), json!("BXAuth=tok123"));
        assert_eq!(cookie_auth_key(&metadata).as_deref(), Some("tok123"));
        assert!(cookie_auth_key(&JsonMap::new()).is_none());
    }

    #[test]
    fn bundles_sanitize_labels_into_file_names() {
        let bundle = bundle_from_parts(
            &json!({"access_token": "at", "expires_in": 3600}),
            &json!({"apiKey": "sk-x", "phone": "+86 139"}),
            Some("tok123"),
        );
        assert!(bundle.file_name.starts_with("iflow-86-139-"));
        assert_eq!(bundle.metadata.get("api_key"), Some(&json!("sk-x")));
        assert_eq!(bundle.metadata.get("cookie"), Some(&json!("BXAuth=tok123")));
    }
}
