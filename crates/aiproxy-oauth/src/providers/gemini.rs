use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use aiproxy_common::ProxyError;
use aiproxy_credential::{JsonMap, RefreshError, TokenRefresher};

use crate::http::client_for_proxy;

use super::{AuthBundle, expiry_rfc3339, read_json_response};

const CLIENT_ID: &str = "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "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";
const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v1/userinfo?alt=json";
const CLOUDCODE_BASE: &str = "https://cloudcode-pa.googleapis.com/v1internal";
const RESOURCE_MANAGER_URL: &str = "https://cloudresourcemanager.googleapis.com/v1/projects";
const SERVICE_USAGE_BASE: &str = "https://serviceusage.googleapis.com/v1";
const COMPANION_SERVICE: &str = "cloudaicompanion.googleapis.com";
const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform https://www.googleapis.com/auth/userinfo.email https://www.googleapis.com/auth/userinfo.profile";
const USER_AGENT: &str = "GeminiCLI/0.1.5 (Windows; AMD64)";

/// Project selection modes accepted on flow start.
pub const PROJECT_ALL: &str = "ALL";
pub const PROJECT_GOOGLE_ONE: &str = "GOOGLE_ONE";

const GOOGLE_ONE_POLLS: u32 = 15;
const ONBOARD_POLL_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_in: i64,
}

pub fn build_auth_url(state: &str, redirect_uri: &str) -> String {
    format!(
        "{AUTHORIZE_URL}?response_type=code&client_id={}&redirect_uri={}&scope={}&access_type=offline&prompt=consent&include_granted_scopes=true&state={}",
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
) -> Result<TokenData, ProxyError> {
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
    let tokens = read_json_response(response, "gemini token exchange").await?;
    token_data(&tokens).ok_or_else(|| ProxyError::upstream("gemini token exchange incomplete"))
}

fn token_data(tokens: &Value) -> Option<TokenData> {
    Some(TokenData {
        access_token: tokens.get("access_token")?.as_str()?.to_string(),
        refresh_token: tokens
            .get("refresh_token")
            .and_then(Value::as_str)
            .map(str::to_string),
        id_token: tokens
            .get("id_token")
            .and_then(Value::as_str)
            .map(str::to_string),
        expires_in: tokens
            .get("expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(3600),
    })
}

pub async fn fetch_email(access_token: &str, proxy: Option<&str>) -> Result<String, ProxyError> {
    let client = client_for_proxy(proxy)?;
    let response = client
        .get(USERINFO_URL)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|err| ProxyError::upstream(err.to_string()))?;
    let info = read_json_response(response, "gemini userinfo").await?;
    info.get("email")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProxyError::upstream("userinfo returned no email"))
}

/// Outcome of the loadCodeAssist/onboardUser handshake.
#[derive(Debug, Clone)]
pub struct Onboarding {
    pub project_ids: Vec<String>,
    pub tier: String,
}

/// Resolve the final project set for a credential.
pub async fn setup_projects(
    access_token: &str,
    requested: &str,
    proxy: Option<&str>,
) -> Result<Onboarding, ProxyError> {
    match requested {
        PROJECT_ALL => onboard_all_projects(access_token, proxy).await,
        PROJECT_GOOGLE_ONE => onboard_google_one(access_token, proxy).await,
        explicit => onboard_explicit(access_token, explicit, proxy).await,
    }
}

async fn onboard_all_projects(
    access_token: &str,
    proxy: Option<&str>,
) -> Result<Onboarding, ProxyError> {
    let client = client_for_proxy(proxy)?;
    let response = client
        .get(RESOURCE_MANAGER_URL)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|err| ProxyError::upstream(err.to_string()))?;
    let listing = read_json_response(response, "project enumeration").await?;
    let project_ids: Vec<String> = listing
        .get("projects")
        .and_then(Value::as_array)
        .map(|projects| {
            projects
                .iter()
                .filter_map(|project| project.get("projectId").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if project_ids.is_empty() {
        return Err(ProxyError::upstream("account has no cloud projects"));
    }

    let mut tier = String::new();
    for project_id in &project_ids {
        match onboard_explicit(access_token, project_id, proxy).await {
            Ok(outcome) => tier = outcome.tier,
            Err(err) => warn!(project = %project_id, %err, "project onboarding failed"),
        }
    }
    Ok(Onboarding { project_ids, tier })
}

async fn onboard_google_one(
    access_token: &str,
    proxy: Option<&str>,
) -> Result<Onboarding, ProxyError> {
    let tier = default_tier(access_token, proxy).await;
    // No cloudaicompanionProject: the backend auto-discovers one; poll for
    // up to 30 seconds.
    for _ in 0..GOOGLE_ONE_POLLS {
        let payload = onboard_once(access_token, &tier, None, proxy).await?;
        if let Some(project_id) = onboarded_project(&payload) {
            return Ok(Onboarding {
                project_ids: vec![project_id],
                tier,
            });
        }
        tokio::time::sleep(ONBOARD_POLL_DELAY).await;
    }
    Err(ProxyError::upstream(
        "google one onboarding did not produce a project",
    ))
}

async fn onboard_explicit(
    access_token: &str,
    requested: &str,
    proxy: Option<&str>,
) -> Result<Onboarding, ProxyError> {
    let tier = default_tier(access_token, proxy).await;
    let payload = onboard_once(access_token, &tier, Some(requested), proxy).await?;
    let backend = onboarded_project(&payload);
    let resolved = resolve_project_id(requested, backend.as_deref(), &tier);
    ensure_service_enabled(access_token, &resolved, proxy).await;
    Ok(Onboarding {
        project_ids: vec![resolved],
        tier,
    })
}

/// The backend may answer with a different project than requested. Keep the
/// caller's choice unless the account sits on a legacy/free tier or the
/// request was an auto-generated `gen-lang-client-` project; those silently
/// follow the backend.
pub fn resolve_project_id(requested: &str, backend: Option<&str>, tier: &str) -> String {
    let Some(backend) = backend.filter(|backend| !backend.is_empty()) else {
        return requested.to_string();
    };
    if backend == requested {
        return requested.to_string();
    }
    let tier_is_free = matches!(tier.to_ascii_lowercase().as_str(), "legacy" | "free" | "legacy-tier" | "free-tier");
    if tier_is_free || requested.starts_with("gen-lang-client-") {
        backend.to_string()
    } else {
        requested.to_string()
    }
}

async fn default_tier(access_token: &str, proxy: Option<&str>) -> String {
    match load_code_assist(access_token, proxy).await {
        Ok(payload) => payload
            .get("allowedTiers")
            .and_then(Value::as_array)
            .and_then(|tiers| {
                tiers.iter().find(|tier| {
                    tier.get("isDefault").and_then(Value::as_bool) == Some(true)
                })
            })
            .and_then(|tier| tier.get("id"))
            .and_then(Value::as_str)
            .unwrap_or("LEGACY")
            .to_string(),
        Err(err) => {
            debug!(%err, "loadCodeAssist failed; assuming legacy tier");
            "LEGACY".to_string()
        }
    }
}

async fn load_code_assist(access_token: &str, proxy: Option<&str>) -> Result<Value, ProxyError> {
    let client = client_for_proxy(proxy)?;
    let response = client
        .post(format!("{CLOUDCODE_BASE}:loadCodeAssist"))
        .bearer_auth(access_token)
        .header("User-Agent", USER_AGENT)
        .json(&client_metadata())
        .send()
        .await
        .map_err(|err| ProxyError::upstream(err.to_string()))?;
    read_json_response(response, "loadCodeAssist").await
}

async fn onboard_once(
    access_token: &str,
    tier: &str,
    project_id: Option<&str>,
    proxy: Option<&str>,
) -> Result<Value, ProxyError> {
    let client = client_for_proxy(proxy)?;
    let mut body = json!({
        "tierId": tier,
        "metadata": client_metadata()["metadata"],
    });
    if let Some(project_id) = project_id {
        body["cloudaicompanionProject"] = json!(project_id);
    }
    let response = client
        .post(format!("{CLOUDCODE_BASE}:onboardUser"))
        .bearer_auth(access_token)
        .header("User-Agent", USER_AGENT)
        .json(&body)
        .send()
        .await
        .map_err(|err| ProxyError::upstream(err.to_string()))?;
    read_json_response(response, "onboardUser").await
}

fn client_metadata() -> Value {
    json!({
        "metadata": {
            "ideType": "IDE_UNSPECIFIED",
            "platform": "PLATFORM_UNSPECIFIED",
            "pluginType": "GEMINI"
        }
    })
}

/// `onboardUser` responses nest the project either as an object with an id
/// or as a bare string.
pub fn onboarded_project(payload: &Value) -> Option<String> {
    if payload.get("done").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    let project = payload.get("response")?.get("cloudaicompanionProject")?;
    project
        .get("id")
        .and_then(Value::as_str)
        .or_else(|| project.as_str())
        .map(str::to_string)
}

/// The companion API must be enabled on the resolved project; enable it when
/// the Service Usage API reports anything but ENABLED. Failures are logged,
/// not fatal: requests will surface the real error.
async fn ensure_service_enabled(access_token: &str, project_id: &str, proxy: Option<&str>) {
    let Ok(client) = client_for_proxy(proxy) else {
        return;
    };
    let status_url =
        format!("{SERVICE_USAGE_BASE}/projects/{project_id}/services/{COMPANION_SERVICE}");
    let state = match client
        .get(&status_url)
        .bearer_auth(access_token)
        .send()
        .await
    {
        Ok(response) => read_json_response(response, "service state")
            .await
            .ok()
            .and_then(|payload| {
                payload
                    .get("state")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }),
        Err(err) => {
            debug!(%err, "service state lookup failed");
            None
        }
    };
    if state.as_deref() == Some("ENABLED") {
        return;
    }
    debug!(project = %project_id, "enabling cloudaicompanion service");
    if let Err(err) = client
        .post(format!("{status_url}:enable"))
        .bearer_auth(access_token)
        .json(&json!({}))
        .send()
        .await
    {
        warn!(project = %project_id, %err, "service enable request failed");
    }
}

/// Assemble the persisted credential for a completed Gemini flow.
pub fn build_bundle(email: &str, tokens: &TokenData, onboarding: &Onboarding) -> AuthBundle {
    let multi_project = onboarding.project_ids.len() > 1;
    let mut metadata = JsonMap::new();
    metadata.insert("type".to_string(), json!("gemini"));
    metadata.insert("access_token".to_string(), json!(tokens.access_token));
    if let Some(refresh_token) = &tokens.refresh_token {
        metadata.insert("refresh_token".to_string(), json!(refresh_token));
    }
    if let Some(id_token) = &tokens.id_token {
        metadata.insert("id_token".to_string(), json!(id_token));
    }
    metadata.insert(
        "expired".to_string(),
        json!(expiry_rfc3339(tokens.expires_in)),
    );
    metadata.insert("email".to_string(), json!(email));
    metadata.insert(
        "project_id".to_string(),
        json!(onboarding.project_ids.join(",")),
    );
    if !onboarding.tier.is_empty() {
        metadata.insert("tier".to_string(), json!(onboarding.tier));
    }

    let file_name = if multi_project {
        format!("gemini-{email}-all.json")
    } else {
        let project = onboarding
            .project_ids
            .first()
            .map(String::as_str)
            .unwrap_or("unknown");
        format!("{email}-{project}.json")
    };
    AuthBundle {
        provider: "gemini",
        file_name,
        label: email.to_string(),
        email: Some(email.to_string()),
        metadata,
    }
}

pub struct GeminiRefresher;

#[async_trait]
impl TokenRefresher for GeminiRefresher {
    fn provider(&self) -> &'static str {
        "gemini"
    }

    async fn refresh(
        &self,
        metadata: &JsonMap,
        proxy: Option<&str>,
    ) -> Result<JsonMap, RefreshError> {
        refresh_google_token(metadata, CLIENT_ID, CLIENT_SECRET, proxy).await
    }
}

/// Shared Google refresh-token grant; Antigravity reuses it with its own
/// client pair.
pub(super) async fn refresh_google_token(
    metadata: &JsonMap,
    client_id: &str,
    client_secret: &str,
    proxy: Option<&str>,
) -> Result<JsonMap, RefreshError> {
    let refresh_token = metadata
        .get("refresh_token")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .ok_or(RefreshError::MissingMaterial("refresh_token"))?;
    let client = client_for_proxy(proxy).map_err(|err| RefreshError::Transport(err.to_string()))?;
    let form = refresh_form(refresh_token, client_id, client_secret);
    let response = client
        .post(TOKEN_URL)
        .form(&form)
        .send()
        .await
        .map_err(|err| RefreshError::Transport(err.to_string()))?;
    let tokens = read_json_response(response, "google token refresh")
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

/// Refresh-token grant body shared by the Google-family providers.
pub(super) fn refresh_form<'a>(
    refresh_token: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
) -> [(&'static str, &'a str); 4] {
    [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
        ("client_secret", client_secret),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_grant_carries_the_client_pair() {
        let form = refresh_form("rt", "cid", "cs");
        assert_eq!(form[0], ("grant_type", "refresh_token"));
        assert_eq!(form[1], ("refresh_token", "rt"));
        assert_eq!(form[2], ("client_id", "cid"));
        assert_eq!(form[3], ("client_secret", "cs"));
    }

    #[test]
    fn auth_url_requests_offline_access() {
        let url = build_auth_url("st", "http://localhost:8085/oauth2callback");
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("state=st"));
    }

    #[test]
    fn backend_project_replaces_requested_only_when_allowed() {
        // Paid tier keeps the caller's explicit choice.
        assert_eq!(
            resolve_project_id("my-project", Some("backend-p"), "STANDARD"),
            "my-project"
        );
        // Legacy/free tiers silently follow the backend.
        assert_eq!(
            resolve_project_id("my-project", Some("backend-p"), "LEGACY"),
            "backend-p"
        );
        assert_eq!(
            resolve_project_id("my-project", Some("backend-p"), "free"),
            "backend-p"
        );
        // Auto-generated client projects always follow the backend.
        assert_eq!(
            resolve_project_id("gen-lang-client-0012", Some("backend-p"), "STANDARD"),
            "backend-p"
        );
        // No backend answer keeps the request.
        assert_eq!(
            resolve_project_id("my-project", None, "LEGACY"),
            "my-project"
        );
        assert_eq!(
            resolve_project_id("my-project", Some(""), "LEGACY"),
            "my-project"
        );
    }

    #[test]
    fn onboard_payload_supports_both_project_shapes() {
        let object_form = json!({
            "done": true,
            "response": {"cloudaicompanionProject": {"id": "p-1"}}
        });
        assert_eq!(onboarded_project(&object_form).as_deref(), Some("p-1"));

        let string_form = json!({
            "done": true,
            "response": {"cloudaicompanionProject": "p-2"}
        });
        assert_eq!(onboarded_project(&string_form).as_deref(), Some("p-2"));

        let pending = json!({"done": false});
        assert!(onboarded_project(&pending).is_none());
    }

    #[test]
    fn single_and_multi_project_files_are_named_differently() {
        let tokens = TokenData {
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            id_token: None,
            expires_in: 3600,
        };
        let single = build_bundle(
            "a@example.com",
            &tokens,
            &Onboarding {
                project_ids: vec!["p-1".to_string()],
                tier: "STANDARD".to_string(),
            },
        );
        assert_eq!(single.file_name, "a@example.com-p-1.json");
        assert_eq!(single.metadata.get("project_id"), Some(&json!("p-1")));

        let multi = build_bundle(
            "a@example.com",
            &tokens,
            &Onboarding {
                project_ids: vec!["p-1".to_string(), "p-2".to_string()],
                tier: String::new(),
            },
        );
        assert_eq!(multi.file_name, "gemini-a@example.com-all.json");
        assert_eq!(multi.metadata.get("project_id"), Some(&json!("p-1,p-2")));
    }
}
