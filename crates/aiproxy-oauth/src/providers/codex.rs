use async_trait::async_trait;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use aiproxy_common::ProxyError;
use aiproxy_credential::{JsonMap, RefreshError, TokenRefresher};

use crate::http::client_for_proxy;
use crate::pkce::PkceCodes;

use super::{AuthBundle, expiry_rfc3339, parse_jwt_claims, read_json_response};

const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const AUTHORIZE_URL: &str = "https://auth.openai.com/oauth/authorize";
const TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const OAUTH_SCOPE: &str = "openid profile email offline_access";

/// Claims pulled out of the ID token after the code exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodexAuthInfo {
    pub email: Option<String>,
    pub chatgpt_plan_type: Option<String>,
    pub chatgpt_account_id: Option<String>,
}

pub fn build_auth_url(state: &str, codes: &PkceCodes, redirect_uri: &str) -> String {
    format!(
        "{AUTHORIZE_URL}?response_type=code&client_id={}&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&id_token_add_organizations=true&state={}",
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(OAUTH_SCOPE),
        urlencoding::encode(&codes.challenge),
        urlencoding::encode(state),
    )
}

pub async fn exchange_code(
    code: &str,
    codes: &PkceCodes,
    redirect_uri: &str,
    proxy: Option<&str>,
) -> Result<AuthBundle, ProxyError> {
    let client = client_for_proxy(proxy)?;
    let form = [
        ("grant_type", "authorization_code"),
        ("client_id", CLIENT_ID),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("code_verifier", codes.verifier.as_str()),
    ];
    let response = client
        .post(TOKEN_URL)
        .form(&form)
        .send()
        .await
        .map_err(|err| ProxyError::upstream(err.to_string()))?;
    let tokens = read_json_response(response, "codex token exchange").await?;
    bundle_from_tokens(&tokens)
}

/// `chatgpt_plan_type` / `chatgpt_account_id` live under the
/// `https://api.openai.com/auth` claim namespace; email is a plain claim.
pub fn parse_auth_info(id_token: &str) -> CodexAuthInfo {
    let Some(claims) = parse_jwt_claims(id_token) else {
        return CodexAuthInfo::default();
    };
    let auth = claims.get("https://api.openai.com/auth");
    let field = |name: &str| -> Option<String> {
        auth.and_then(|scope| scope.get(name))
            .or_else(|| claims.get(name))
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    CodexAuthInfo {
        email: claims
            .get("email")
            .and_then(Value::as_str)
            .map(str::to_string),
        chatgpt_plan_type: field("chatgpt_plan_type"),
        chatgpt_account_id: field("chatgpt_account_id"),
    }
}

/// Token-file name: team plans embed a short account hash so several teams
/// under one email stay distinct.
pub fn storage_file_name(info: &CodexAuthInfo) -> String {
    let email = info.email.as_deref().unwrap_or("unknown");
    match (info.chatgpt_plan_type.as_deref(), info.chatgpt_account_id.as_deref()) {
        (Some("team"), Some(account_id)) => {
            let digest = Sha256::digest(account_id.as_bytes());
            let hash: String = digest
                .iter()
                .take(4)
                .map(|byte| format!("{byte:02x}"))
                .collect();
            format!("codex-{hash}-{email}-team.json")
        }
        (Some(plan), _) if !plan.is_empty() => format!("codex-{email}-{plan}.json"),
        _ => format!("codex-{email}.json"),
    }
}

fn bundle_from_tokens(tokens: &Value) -> Result<AuthBundle, ProxyError> {
    let access_token = tokens
        .get("access_token")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::upstream("codex token exchange returned no access_token"))?;
    let id_token = tokens.get("id_token").and_then(Value::as_str).unwrap_or("");
    let info = parse_auth_info(id_token);

    let mut metadata = JsonMap::new();
    metadata.insert("type".to_string(), json!("codex"));
    metadata.insert("access_token".to_string(), json!(access_token));
    if let Some(token) = tokens.get("refresh_token").and_then(Value::as_str) {
        metadata.insert("refresh_token".to_string(), json!(token));
    }
    if !id_token.is_empty() {
        metadata.insert("id_token".to_string(), json!(id_token));
    }
    if let Some(expires_in) = tokens.get("expires_in").and_then(Value::as_i64) {
        metadata.insert("expired".to_string(), json!(expiry_rfc3339(expires_in)));
    }
    if let Some(email) = &info.email {
        metadata.insert("email".to_string(), json!(email));
    }
    if let Some(account_id) = &info.chatgpt_account_id {
        metadata.insert("account_id".to_string(), json!(account_id));
    }
    if let Some(plan) = &info.chatgpt_plan_type {
        metadata.insert("plan".to_string(), json!(plan));
    }

    Ok(AuthBundle {
        provider: "codex",
        file_name: storage_file_name(&info),
        label: info.email.clone().unwrap_or_else(|| "codex".to_string()),
        email: info.email,
        metadata,
    })
}

pub struct CodexRefresher;

#[async_trait]
impl TokenRefresher for CodexRefresher {
    fn provider(&self) -> &'static str {
        "codex"
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
        let tokens = read_json_response(response, "codex token refresh")
            .await
            .map_err(|err| RefreshError::Rejected(err.to_string()))?;

        let mut updated = metadata.clone();
        if let Some(token) = tokens.get("access_token").and_then(Value::as_str) {
            updated.insert("access_token".to_string(), json!(token));
        }
        if let Some(token) = tokens.get("refresh_token").and_then(Value::as_str) {
            updated.insert("refresh_token".to_string(), json!(token));
        }
        if let Some(token) = tokens.get("id_token").and_then(Value::as_str) {
            updated.insert("id_token".to_string(), json!(token));
        }
        if let Some(expires_in) = tokens.get("expires_in").and_then(Value::as_i64) {
            updated.insert("expired".to_string(), json!(expiry_rfc3339(expires_in)));
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    use super::*;

    fn fake_id_token(claims: Value) -> String {
        format!("hdr.{}.sig", URL_SAFE_NO_PAD.encode(claims.to_string()))
    }

    #[test]
    fn claims_come_from_the_auth_namespace() {
        let token = fake_id_token(json!({
            "email": "dev@example.com",
            "https://api.openai.com/auth": {
                "chatgpt_plan_type": "team",
                "chatgpt_account_id": "acct-123"
            }
        }));
        let info = parse_auth_info(&token);
        assert_eq!(info.email.as_deref(), Some("dev@example.com"));
        assert_eq!(info.chatgpt_plan_type.as_deref(), Some("team"));
        assert_eq!(info.chatgpt_account_id.as_deref(), Some("acct-123"));

        assert_eq!(parse_auth_info("garbage"), CodexAuthInfo::default());
    }

    #[test]
    fn team_plans_get_an_account_hash_in_the_file_name() {
        let info = CodexAuthInfo {
            email: Some("dev@example.com".to_string()),
            chatgpt_plan_type: Some("team".to_string()),
            chatgpt_account_id: Some("acct-123".to_string()),
        };
        let name = storage_file_name(&info);
        assert!(name.starts_with("codex-"));
        assert!(name.ends_with("-dev@example.com-team.json"));
        // Hash segment is 8 hex characters.
        let hash = name
            .strip_prefix("codex-")
            .unwrap()
            .split('-')
            .next()
            .unwrap();
        assert_eq!(hash.len(), 8);
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn plain_plans_and_missing_plans_name_simply() {
        let plus = CodexAuthInfo {
            email: Some("dev@example.com".to_string()),
            chatgpt_plan_type: Some("plus".to_string()),
            chatgpt_account_id: None,
        };
        assert_eq!(storage_file_name(&plus), "codex-dev@example.com-plus.json");

        let bare = CodexAuthInfo {
            email: Some("dev@example.com".to_string()),
            chatgpt_plan_type: None,
            chatgpt_account_id: None,
        };
        assert_eq!(storage_file_name(&bare), "codex-dev@example.com.json");
    }

    #[test]
    fn auth_url_includes_pkce() {
        let codes = crate::pkce::generate_pkce();
        let url = build_auth_url("s", &codes, "http://localhost:1455/auth/callback");
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("client_id=app_EMoamEEZ73f0CkXaXp7hrann"));
    }
}
