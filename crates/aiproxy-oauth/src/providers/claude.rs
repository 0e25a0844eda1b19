use async_trait::async_trait;
use serde_json::{Value, json};

use aiproxy_common::ProxyError;
use aiproxy_credential::{JsonMap, RefreshError, TokenRefresher};

use crate::http::client_for_proxy;
use crate::pkce::PkceCodes;

use super::{AuthBundle, expiry_rfc3339, read_json_response, unix_now};

const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";
const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const OAUTH_SCOPE: &str = "org:create_api_key user:profile user:inference";

pub fn build_auth_url(state: &str, codes: &PkceCodes, redirect_uri: &str) -> String {
    format!(
        "{AUTHORIZE_URL}?code=true&client_id={}&response_type=code&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(OAUTH_SCOPE),
        urlencoding::encode(&codes.challenge),
        urlencoding::encode(state),
    )
}

/// Claude sometimes appends the state after `#` in the code it hands back;
/// only the part before the fragment is the real authorization code.
pub fn clean_code(code: &str) -> &str {
    let code = code.split('#').next().unwrap_or(code);
    code.split('&').next().unwrap_or(code)
}

pub async fn exchange_code(
    code: &str,
    state: &str,
    codes: &PkceCodes,
    redirect_uri: &str,
    proxy: Option<&str>,
) -> Result<AuthBundle, ProxyError> {
    let client = client_for_proxy(proxy)?;
    let body = json!({
        "grant_type": "authorization_code",
        "client_id": CLIENT_ID,
        "code": clean_code(code),
        "state": state,
        "redirect_uri": redirect_uri,
        "code_verifier": codes.verifier,
    });
    let response = client
        .post(TOKEN_URL)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|err| ProxyError::upstream(err.to_string()))?;
    let tokens = read_json_response(response, "claude token exchange").await?;
    bundle_from_tokens(&tokens)
}

fn bundle_from_tokens(tokens: &Value) -> Result<AuthBundle, ProxyError> {
    let access_token = tokens
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ProxyError::upstream("claude token exchange returned no access_token"))?;
    let refresh_token = tokens
        .get("refresh_token")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::upstream("claude token exchange returned no refresh_token"))?;
    let expires_in = tokens
        .get("expires_in")
        .and_then(Value::as_i64)
        .unwrap_or(3600);
    let email = tokens
        .get("account")
        .and_then(|account| account.get("email_address"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut metadata = JsonMap::new();
    metadata.insert("type".to_string(), json!("claude"));
    metadata.insert("access_token".to_string(), json!(access_token));
    metadata.insert("refresh_token".to_string(), json!(refresh_token));
    metadata.insert("expired".to_string(), json!(expiry_rfc3339(expires_in)));
    if let Some(email) = &email {
        metadata.insert("email".to_string(), json!(email));
    }

    let file_name = match &email {
        Some(email) => format!("claude-{email}.json"),
        None => format!("claude-{}.json", unix_now()),
    };
    Ok(AuthBundle {
        provider: "claude",
        label: email.clone().unwrap_or_else(|| "claude".to_string()),
        email,
        file_name,
        metadata,
    })
}

pub struct ClaudeRefresher;

#[async_trait]
impl TokenRefresher for ClaudeRefresher {
    fn provider(&self) -> &'static str {
        "claude"
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
        let body = json!({
            "grant_type": "refresh_token",
            "client_id": CLIENT_ID,
            "refresh_token": refresh_token,
        });
        let response = client
            .post(TOKEN_URL)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|err| RefreshError::Transport(err.to_string()))?;
        let tokens = read_json_response(response, "claude token refresh")
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
