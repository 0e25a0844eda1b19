use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use aiproxy_common::ProxyError;
use aiproxy_credential::{JsonMap, RefreshError, TokenRefresher, metadata_expiry};

use crate::http::client_for_proxy;

use super::gemini::refresh_google_token;
use super::{AuthBundle, expiry_rfc3339, read_json_response};

const CLIENT_ID: &str =
    "1071006060591-tmhssin9h8kfdrgfpeqw34d8107bmplb.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "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";
const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CLOUDCODE_BASE: &str = "https://cloudcode-pa.googleapis.com/v1internal";
const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform https://www.googleapis.com/auth/userinfo.email https://www.googleapis.com/auth/userinfo.profile https://www.googleapis.com/auth/cclog https://www.googleapis.com/auth/experimentsandconfigs";

const ONBOARD_POLLS: u32 = 5;
const ONBOARD_POLL_DELAY: Duration = Duration::from_secs(2);
const ONBOARD_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A token is due for refresh when its expiry sits within this window of
/// now, or when the stored timestamp cannot be parsed at all.
pub const REFRESH_SKEW: Duration = Duration::from_secs(30);

pub fn build_auth_url(state: &str, redirect_uri: &str) -> String {
    format!(
        "{AUTHORIZE_URL}?response_type=code&client_id={}&redirect_uri={}&scope={}&access_type=offline&prompt=consent&state={}",
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
) -> Result<(String, Option<String>, Option<String>, i64), ProxyError> {
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
    let tokens = read_json_response(response, "antigravity token exchange").await?;
    let access_token = tokens
        .get("access_token")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::upstream("antigravity exchange returned no access_token"))?
        .to_string();
    Ok((
        access_token,
        tokens
            .get("refresh_token")
            .and_then(Value::as_str)
            .map(str::to_string),
        tokens
            .get("id_token")
            .and_then(Value::as_str)
            .map(str::to_string),
        tokens
            .get("expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(3600),
    ))
}

/// loadCodeAssist then onboardUser, polling the long-running operation up to
/// five times with two seconds between attempts.
pub async fn resolve_project(access_token: &str, proxy: Option<&str>) -> Result<String, ProxyError> {
    let client = client_for_proxy(proxy)?;
    let metadata = json!({
        "metadata": {
            "ideType": "ANTIGRAVITY",
            "platform": "PLATFORM_UNSPECIFIED",
            "pluginType": "GEMINI"
        }
    });

    let load = client
        .post(format!("{CLOUDCODE_BASE}:loadCodeAssist"))
        .bearer_auth(access_token)
        .timeout(ONBOARD_REQUEST_TIMEOUT)
        .json(&metadata)
        .send()
        .await
        .map_err(|err| ProxyError::upstream(err.to_string()))?;
    let load = read_json_response(load, "loadCodeAssist").await?;
    if let Some(project) = load
        .get("cloudaicompanionProject")
        .and_then(Value::as_str)
        .filter(|project| !project.is_empty())
    {
        return Ok(project.to_string());
    }

    let tier = load
        .get("allowedTiers")
        .and_then(Value::as_array)
        .and_then(|tiers| {
            tiers
                .iter()
                .find(|tier| tier.get("isDefault").and_then(Value::as_bool) == Some(true))
        })
        .and_then(|tier| tier.get("id"))
        .and_then(Value::as_str)
        .unwrap_or("LEGACY");

    let body = json!({
        "tierId": tier,
        "metadata": metadata["metadata"],
    });
    for _ in 0..ONBOARD_POLLS {
        let response = client
            .post(format!("{CLOUDCODE_BASE}:onboardUser"))
            .bearer_auth(access_token)
            .timeout(ONBOARD_REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProxyError::upstream(err.to_string()))?;
        let payload = read_json_response(response, "onboardUser").await?;
        if let Some(project) = super::gemini::onboarded_project(&payload) {
            return Ok(project);
        }
        tokio::time::sleep(ONBOARD_POLL_DELAY).await;
    }
    Err(ProxyError::upstream(
        "antigravity onboarding did not produce a project",
    ))
}

pub fn build_bundle(
    email: &str,
    access_token: &str,
    refresh_token: Option<&str>,
    id_token: Option<&str>,
    expires_in: i64,
    project_id: &str,
) -> AuthBundle {
    let mut metadata = JsonMap::new();
    metadata.insert("type".to_string(), json!("antigravity"));
    metadata.insert("access_token".to_string(), json!(access_token));
    if let Some(refresh_token) = refresh_token {
        metadata.insert("refresh_token".to_string(), json!(refresh_token));
    }
    if let Some(id_token) = id_token {
        metadata.insert("id_token".to_string(), json!(id_token));
    }
    metadata.insert("expired".to_string(), json!(expiry_rfc3339(expires_in)));
    metadata.insert("email".to_string(), json!(email));
    metadata.insert("project_id".to_string(), json!(project_id));
    AuthBundle {
        provider: "antigravity",
        file_name: format!("antigravity-{email}.json"),
        label: email.to_string(),
        email: Some(email.to_string()),
        metadata,
    }
}

/// Refresh-due test used by the scheduler: inside the 30-second window, or
/// unparseable.
pub fn refresh_due(metadata: &JsonMap) -> bool {
    match metadata_expiry(metadata) {
        Some(expiry) => time::OffsetDateTime::now_utc() + REFRESH_SKEW >= expiry,
        None => metadata.contains_key("expired"),
    }
}

pub struct AntigravityRefresher;

#[async_trait]
impl TokenRefresher for AntigravityRefresher {
    fn provider(&self) -> &'static str {
        "antigravity"
    }

    fn refresh_skew(&self) -> Duration {
        REFRESH_SKEW
    }

    async fn refresh(
        &self,
        metadata: &JsonMap,
        proxy: Option<&str>,
    ) -> Result<JsonMap, RefreshError> {
        refresh_google_token(metadata, CLIENT_ID, CLIENT_SECRET, proxy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_url_carries_extended_scopes() {
        let url = build_auth_url("st", "http://localhost:51121/oauth2callback");
        assert!(url.contains(urlencoding::encode("cclog").as_ref()));
        assert!(url.contains(urlencoding::encode("experimentsandconfigs").as_ref()));
    }

    #[test]
    fn refresh_due_honors_the_thirty_second_window() {
        let mut metadata = JsonMap::new();
        // Expired an hour ago.
        metadata.insert("expired".to_string(), json!("2020-01-01T00:00:00Z"));
        assert!(refresh_due(&metadata));

        // Far in the future.
        metadata.insert("expired".to_string(), json!("2099-01-01T00:00:00Z"));
        assert!(!refresh_due(&metadata));

        // Unparseable counts as due.
        metadata.insert("expired".to_string(), json!("???"));
        assert!(refresh_due(&metadata));

        // No expiry at all: nothing to refresh against.
        assert!(!refresh_due(&JsonMap::new()));
    }

    #[test]
    fn bundle_is_named_by_email() {
        let bundle = build_bundle("x@example.com", "at", Some("rt"), None, 3600, "p-9");
        assert_eq!(bundle.file_name, "antigravity-x@example.com.json");
        assert_eq!(bundle.metadata.get("project_id"), Some(&json!("p-9")));
        assert_eq!(bundle.metadata.get("type"), Some(&json!("antigravity")));
    }
}
