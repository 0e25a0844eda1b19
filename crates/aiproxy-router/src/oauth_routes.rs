use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, RawQuery, State};
use axum::response::Html;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use aiproxy_common::{ProxyError, normalize_provider, validate_state};
use aiproxy_credential::{Credential, CredentialRuntime, SharedCredential};
use aiproxy_oauth::forwarder::callback_port;
use aiproxy_oauth::pkce::{PkceCodes, generate_pkce, generate_state};
use aiproxy_oauth::providers::{AuthBundle, antigravity, claude, codex, gemini, iflow, qwen};
use aiproxy_oauth::relay::{self, CallbackPayload};

use crate::error::{ApiError, ApiResult};
use crate::state::ManagementState;

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    pub is_webui: Option<String>,
    pub project_id: Option<String>,
}

fn truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(str::trim),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

fn redirect_uri(provider: &str) -> Option<String> {
    let path = match provider {
        "anthropic" => "callback",
        "codex" => "auth/callback",
        "gemini" | "antigravity" | "iflow" => "oauth2callback",
        _ => return None,
    };
    callback_port(provider).map(|port| format!("http://localhost:{port}/{path}"))
}

/// `POST /oauth/{provider}`: build the authorize URL, register the pending
/// session, start the port forwarder in web-UI mode, and leave a background
/// task waiting on the callback file. The browser opening is the caller's
/// job.
pub async fn start(
    State(state): State<ManagementState>,
    Path(provider): Path<String>,
    Query(query): Query<StartQuery>,
) -> ApiResult<Json<Value>> {
    let provider = normalize_provider(&provider).map_err(ApiError)?;
    let state_token = generate_state();
    state
        .sessions
        .register(&state_token, provider)
        .map_err(ApiError)?;

    if provider == "qwen" {
        return start_device_flow(state, state_token).await;
    }

    let codes = generate_pkce();
    let redirect = redirect_uri(provider)
        .ok_or_else(|| ApiError(ProxyError::invalid("provider has no callback port")))?;
    let url = match provider {
        "anthropic" => claude::build_auth_url(&state_token, &codes, &redirect),
        "codex" => codex::build_auth_url(&state_token, &codes, &redirect),
        "gemini" => gemini::build_auth_url(&state_token, &redirect),
        "antigravity" => antigravity::build_auth_url(&state_token, &redirect),
        "iflow" => iflow::build_auth_url(&state_token, &redirect),
        other => return Err(ApiError(ProxyError::invalid(format!("unsupported provider: {other}")))),
    };

    let forwarder_handle = if truthy(query.is_webui.as_deref()) {
        let port = callback_port(provider)
            .ok_or_else(|| ApiError(ProxyError::invalid("provider has no callback port")))?;
        match state
            .forwarders
            .start(port, provider, &state.callback_target())
            .await
        {
            Ok(handle) => Some((port, handle)),
            Err(err) => {
                state.sessions.set_error(&state_token, &err.to_string());
                return Err(ApiError(err));
            }
        }
    } else {
        None
    };

    let task_state = state.clone();
    let task_token = state_token.clone();
    let project_id = query.project_id.clone();
    tokio::spawn(async move {
        let outcome = complete_code_flow(
            &task_state,
            provider,
            &task_token,
            &codes,
            &redirect,
            project_id.as_deref(),
        )
        .await;
        match outcome {
            Ok(()) => {
                info!(provider, "oauth flow completed");
                task_state.sessions.complete(&task_token);
            }
            Err(err) => {
                warn!(provider, %err, "oauth flow failed");
                task_state.sessions.set_error(&task_token, &err.to_string());
            }
        }
        if let Some((port, handle)) = forwarder_handle {
            task_state.forwarders.stop(port, handle).await;
        }
    });

    Ok(Json(json!({ "status": "ok", "url": url, "state": state_token })))
}

async fn start_device_flow(
    state: ManagementState,
    state_token: String,
) -> ApiResult<Json<Value>> {
    let codes = generate_pkce();
    let authorization = match qwen::start_device_flow(&codes, state.global_proxy.as_deref()).await
    {
        Ok(authorization) => authorization,
        Err(err) => {
            state.sessions.set_error(&state_token, &err.to_string());
            return Err(ApiError(err));
        }
    };
    let url = authorization
        .verification_uri_complete
        .clone()
        .unwrap_or_else(|| authorization.verification_uri.clone());

    let task_state = state.clone();
    let task_token = state_token.clone();
    tokio::spawn(async move {
        match qwen::poll_for_tokens(&authorization, &codes, task_state.global_proxy.as_deref())
            .await
        {
            Ok(bundle) => {
                if let Err(err) = register_bundle(&task_state, bundle).await {
                    task_state.sessions.set_error(&task_token, &err.to_string());
                    return;
                }
                task_state.sessions.complete(&task_token);
            }
            Err(err) => {
                task_state.sessions.set_error(&task_token, &err.to_string());
            }
        }
    });

    Ok(Json(json!({ "status": "ok", "url": url, "state": state_token })))
}

/// Wait for the relay file, then run the provider-specific exchange and hand
/// the resulting credential to the manager.
async fn complete_code_flow(
    state: &ManagementState,
    provider: &'static str,
    state_token: &str,
    codes: &PkceCodes,
    redirect: &str,
    project_id: Option<&str>,
) -> Result<(), ProxyError> {
    let payload =
        relay::await_callback(&state.auth_dir, &state.sessions, provider, state_token).await?;
    if !payload.error.is_empty() {
        return Err(ProxyError::invalid(payload.error));
    }
    if payload.code.is_empty() {
        return Err(ProxyError::invalid("callback carried no code"));
    }
    let proxy = state.global_proxy.as_deref();

    match provider {
        "anthropic" => {
            let bundle =
                claude::exchange_code(&payload.code, state_token, codes, redirect, proxy).await?;
            register_bundle(state, bundle).await
        }
        "codex" => {
            let bundle = codex::exchange_code(&payload.code, codes, redirect, proxy).await?;
            register_bundle(state, bundle).await
        }
        "gemini" => {
            let tokens = gemini::exchange_code(&payload.code, redirect, proxy).await?;
            let email = gemini::fetch_email(&tokens.access_token, proxy).await?;
            let requested = project_id.unwrap_or(gemini::PROJECT_GOOGLE_ONE);
            let onboarding =
                gemini::setup_projects(&tokens.access_token, requested, proxy).await?;
            let bundle = gemini::build_bundle(&email, &tokens, &onboarding);
            register_gemini_bundle(state, bundle, &email, &onboarding.project_ids).await
        }
        "antigravity" => {
            let (access_token, refresh_token, id_token, expires_in) =
                antigravity::exchange_code(&payload.code, redirect, proxy).await?;
            let email = id_token
                .as_deref()
                .and_then(aiproxy_oauth::providers::claims_email)
                .unwrap_or_else(|| "unknown".to_string());
            let project = antigravity::resolve_project(&access_token, proxy).await?;
            let bundle = antigravity::build_bundle(
                &email,
                &access_token,
                refresh_token.as_deref(),
                id_token.as_deref(),
                expires_in,
                &project,
            );
            register_bundle(state, bundle).await
        }
        "iflow" => {
            let bundle = iflow::exchange_code(&payload.code, redirect, proxy).await?;
            // Re-importing the same session cookie is a no-op, not a clone.
            if let Some(key) = iflow::cookie_auth_key(&bundle.metadata) {
                for existing in state.manager.list().await {
                    if iflow::cookie_auth_key(&existing.metadata).as_deref() == Some(&key) {
                        return Err(ProxyError::invalid("account already imported"));
                    }
                }
            }
            register_bundle(state, bundle).await
        }
        other => Err(ProxyError::invalid(format!("unsupported provider: {other}"))),
    }
}

async fn register_bundle(state: &ManagementState, bundle: AuthBundle) -> Result<(), ProxyError> {
    let credential = credential_from_bundle(state, &bundle);
    state
        .manager
        .register(credential)
        .await
        .map_err(|err| ProxyError::internal(err.to_string()))?;
    Ok(())
}

/// Multi-project Gemini accounts become one shared credential plus a
/// runtime-only virtual credential per project; token state lives only in
/// the shared parent.
async fn register_gemini_bundle(
    state: &ManagementState,
    bundle: AuthBundle,
    email: &str,
    project_ids: &[String],
) -> Result<(), ProxyError> {
    if project_ids.len() <= 1 {
        return register_bundle(state, bundle).await;
    }

    let shared = Arc::new(SharedCredential::new(
        bundle.file_name.clone(),
        email,
        bundle.metadata.clone(),
    ));
    for project_id in project_ids {
        shared.add_project(project_id.clone());
    }

    let mut primary = credential_from_bundle(state, &bundle);
    primary.runtime = Some(CredentialRuntime::Shared(shared.clone()));
    state
        .manager
        .register(primary)
        .await
        .map_err(|err| ProxyError::internal(err.to_string()))?;

    for project_id in project_ids {
        let mut virtual_credential =
            Credential::new(format!("{email}-{project_id}.json"), "gemini");
        virtual_credential.label = format!("{email} ({project_id})");
        virtual_credential
            .attributes
            .insert("runtime_only".to_string(), "true".to_string());
        virtual_credential
            .attributes
            .insert("source".to_string(), "runtime".to_string());
        virtual_credential.runtime = Some(CredentialRuntime::Virtual {
            project_id: project_id.clone(),
            parent: shared.clone(),
        });
        state
            .manager
            .register(virtual_credential)
            .await
            .map_err(|err| ProxyError::internal(err.to_string()))?;
    }
    Ok(())
}

fn credential_from_bundle(state: &ManagementState, bundle: &AuthBundle) -> Credential {
    let mut credential = Credential::new(bundle.file_name.clone(), bundle.provider);
    credential.label = bundle.label.clone();
    credential.metadata = bundle.metadata.clone();
    credential.attributes.insert(
        "path".to_string(),
        state
            .auth_dir
            .join(&bundle.file_name)
            .to_string_lossy()
            .to_string(),
    );
    credential
        .attributes
        .insert("source".to_string(), "file".to_string());
    credential
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    pub provider: String,
    #[serde(default)]
    pub code: String,
    pub state: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub redirect_url: Option<String>,
}

/// `POST /oauth/callback`: the management surface (or a user pasting a
/// redirect URL) hands over the authorization code; correlation is by state.
pub async fn callback(
    State(state): State<ManagementState>,
    Json(mut body): Json<CallbackBody>,
) -> ApiResult<Json<Value>> {
    let provider = normalize_provider(&body.provider).map_err(ApiError)?;
    // A pasted redirect URL can stand in for explicit code/state fields.
    if body.code.is_empty()
        && let Some(redirect_url) = body.redirect_url.as_deref()
    {
        let (code, redirect_state) = extract_code_state(redirect_url);
        if let Some(code) = code {
            body.code = code;
        }
        if body.state.is_empty()
            && let Some(redirect_state) = redirect_state
        {
            body.state = redirect_state;
        }
    }
    validate_state(&body.state).map_err(ApiError)?;

    match state.sessions.get(&body.state) {
        None => return Err(ApiError(ProxyError::UnknownState)),
        Some((_, status)) if !status.is_empty() => {
            return Err(ApiError(ProxyError::NotPending));
        }
        Some(_) => {}
    }

    let payload = CallbackPayload {
        code: body.code.clone(),
        state: body.state.clone(),
        error: body.error.clone(),
    };
    relay::write_callback_file(&state.auth_dir, &state.sessions, provider, &body.state, &payload)
        .await
        .map_err(ApiError)?;
    Ok(Json(json!({ "status": "ok" })))
}

/// `GET /oauth/callback/{provider}`: where the port forwarder sends the
/// browser. Unauthenticated by necessity; the state token is the
/// correlation proof.
pub async fn browser_callback(
    State(state): State<ManagementState>,
    Path(provider): Path<String>,
    RawQuery(query): RawQuery,
) -> Html<String> {
    let provider = match normalize_provider(&provider) {
        Ok(provider) => provider,
        Err(err) => return Html(format!("<p>{err}</p>")),
    };
    let query = query.unwrap_or_default();
    let code = query_value(&query, "code").unwrap_or_default();
    let state_token = query_value(&query, "state").unwrap_or_default();
    let error = query_value(&query, "error").unwrap_or_default();
    if validate_state(&state_token).is_err() {
        return Html("<p>Invalid or missing state.</p>".to_string());
    }
    let payload = CallbackPayload {
        code,
        state: state_token.clone(),
        error,
    };
    match relay::write_callback_file(
        &state.auth_dir,
        &state.sessions,
        provider,
        &state_token,
        &payload,
    )
    .await
    {
        Ok(()) => Html(
            "<p>Authentication received. You can close this window.</p>".to_string(),
        ),
        Err(err) => Html(format!("<p>Callback rejected: {err}</p>")),
    }
}

fn query_value(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name != key || value.is_empty() {
            return None;
        }
        urlencoding::decode(value)
            .ok()
            .map(|decoded| decoded.trim().to_string())
    })
}

/// Pull code and state out of a full redirect URL.
fn extract_code_state(redirect_url: &str) -> (Option<String>, Option<String>) {
    let raw = redirect_url.trim();
    if raw.is_empty() {
        return (None, None);
    }
    let query = match raw.find('?') {
        Some(index) => &raw[index + 1..],
        None => raw,
    };
    let query = query.split('#').next().unwrap_or(query);
    (query_value(query, "code"), query_value(query, "state"))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub state: String,
}

/// `GET /oauth/status?state=`: complete (gone), pending, or failed.
pub async fn status(
    State(state): State<ManagementState>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<Value>> {
    validate_state(&query.state).map_err(ApiError)?;
    Ok(Json(match state.sessions.get(&query.state) {
        None => json!({ "status": "ok" }),
        Some((_, status)) if status.is_empty() => json!({ "status": "wait" }),
        Some((_, status)) => json!({ "status": "error", "error": status }),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_uris_use_the_fixed_ports() {
        assert_eq!(
            redirect_uri("anthropic").as_deref(),
            Some("http://localhost:54545/callback")
        );
        assert_eq!(
            redirect_uri("codex").as_deref(),
            Some("http://localhost:1455/auth/callback")
        );
        assert_eq!(
            redirect_uri("gemini").as_deref(),
            Some("http://localhost:8085/oauth2callback")
        );
        assert_eq!(
            redirect_uri("antigravity").as_deref(),
            Some("http://localhost:51121/oauth2callback")
        );
        assert_eq!(
            redirect_uri("iflow").as_deref(),
            Some("http://localhost:11451/oauth2callback")
        );
        assert!(redirect_uri("qwen").is_none());
    }

    #[test]
    fn redirect_urls_yield_code_and_state() {
        let (code, state) =
            extract_code_state("http://localhost:54545/callback?code=abc%2B1&state=s1");
        assert_eq!(code.as_deref(), Some("abc+1"));
        assert_eq!(state.as_deref(), Some("s1"));

        let (code, state) = extract_code_state("code=xyz&state=s2#fragment");
        assert_eq!(code.as_deref(), Some("xyz"));
        assert_eq!(state.as_deref(), Some("s2"));

        assert_eq!(extract_code_state(""), (None, None));
    }

    #[test]
    fn truthy_accepts_common_spellings() {
        assert!(truthy(Some("true")));
        assert!(truthy(Some("1")));
        assert!(truthy(Some("yes")));
        assert!(!truthy(Some("false")));
        assert!(!truthy(None));
    }
}
