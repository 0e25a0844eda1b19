use axum::Json;
use axum::extract::{FromRequest, Multipart, Query, State};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use aiproxy_common::ProxyError;
use aiproxy_credential::{Credential, CredentialStatus, JsonMap};
use aiproxy_oauth::providers::vertex;

use crate::error::{ApiError, ApiResult};
use crate::state::ManagementState;

/// Upload names are plain file names, nothing that walks the tree.
fn validate_file_name(name: &str) -> Result<(), ProxyError> {
    if !name.ends_with(".json") {
        return Err(ProxyError::invalid("name must end with .json"));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") || name.starts_with('.') {
        return Err(ProxyError::invalid("name must not contain path separators"));
    }
    Ok(())
}

pub async fn list(State(state): State<ManagementState>) -> ApiResult<Json<Value>> {
    let mut files = Vec::new();
    for credential in state.manager.list().await {
        let source = credential
            .attributes
            .get("source")
            .cloned()
            .unwrap_or_else(|| "file".to_string());
        let path = credential.path().map(str::to_string);
        // File-backed entries whose file vanished are hidden, not listed as
        // ghosts.
        if source == "file" {
            let on_disk = match &path {
                Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
                None => tokio::fs::try_exists(state.auth_dir.join(&credential.id))
                    .await
                    .unwrap_or(false),
            };
            if !on_disk {
                continue;
            }
        }

        let size = match &path {
            Some(path) => tokio::fs::metadata(path)
                .await
                .map(|meta| meta.len())
                .unwrap_or(0),
            None => 0,
        };
        let mut entry = json!({
            "id": credential.id,
            "auth_index": credential.index,
            "name": credential.id,
            "type": credential.provider,
            "provider": credential.provider,
            "label": credential.label,
            "status": status_label(credential.status),
            "status_message": credential.status_message,
            "disabled": credential.disabled,
            "unavailable": credential.status == CredentialStatus::Unavailable,
            "runtime_only": credential.is_runtime_only(),
            "source": source,
            "size": size,
            "created_at": rfc3339(credential.created_at),
            "updated_at": rfc3339(credential.updated_at),
            "last_refresh": rfc3339(credential.last_refreshed),
        });
        if let Some(map) = entry.as_object_mut() {
            if let Some(email) = credential.metadata.get("email") {
                map.insert("email".to_string(), email.clone());
            }
            if let Some(plan) = credential.metadata.get("plan") {
                map.insert("account_type".to_string(), plan.clone());
            }
            if let Some(account) = credential.metadata.get("account_id") {
                map.insert("account".to_string(), account.clone());
            }
            if let Some(path) = path {
                map.insert("path".to_string(), json!(path));
            }
            if let Some(id_token) = credential.metadata.get("id_token") {
                map.insert("id_token".to_string(), id_token.clone());
            }
        }
        files.push(entry);
    }
    Ok(Json(json!({ "files": files })))
}

fn status_label(status: CredentialStatus) -> &'static str {
    match status {
        CredentialStatus::Active => "active",
        CredentialStatus::Disabled => "disabled",
        CredentialStatus::Unavailable => "unavailable",
    }
}

fn rfc3339(unix: i64) -> Option<String> {
    if unix <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(unix)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub name: Option<String>,
}

/// Accepts either a multipart `file` part or a raw JSON body with `?name=`.
pub async fn upload(
    State(state): State<ManagementState>,
    Query(query): Query<UploadQuery>,
    request: axum::extract::Request,
) -> ApiResult<Json<Value>> {
    let content_type = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let (name, blob): (String, Bytes) = if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|err| ApiError(ProxyError::invalid(err.to_string())))?;
        read_multipart_file(&mut multipart, query.name).await?
    } else {
        let name = query
            .name
            .ok_or_else(|| ApiError(ProxyError::invalid("missing ?name= for raw upload")))?;
        let bytes = axum::body::to_bytes(request.into_body(), 4 * 1024 * 1024)
            .await
            .map_err(|err| ApiError(ProxyError::invalid(err.to_string())))?;
        (name, bytes)
    };

    validate_file_name(&name).map_err(ApiError)?;
    let metadata = parse_token_blob(&blob).map_err(ApiError)?;
    let credential = credential_from_upload(&state, name, metadata);
    state.manager.register(credential).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn read_multipart_file(
    multipart: &mut Multipart,
    fallback_name: Option<String>,
) -> Result<(String, Bytes), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError(ProxyError::invalid(err.to_string())))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .or_else(|| fallback_name.clone())
            .ok_or_else(|| ApiError(ProxyError::invalid("multipart file has no name")))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError(ProxyError::invalid(err.to_string())))?;
        return Ok((file_name, bytes));
    }
    Err(ApiError(ProxyError::invalid("missing multipart field 'file'")))
}

fn parse_token_blob(blob: &[u8]) -> Result<JsonMap, ProxyError> {
    match serde_json::from_slice::<Value>(blob) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ProxyError::invalid("token file must be a JSON object")),
        Err(err) => Err(ProxyError::invalid(format!("token file is not JSON: {err}"))),
    }
}

fn credential_from_upload(state: &ManagementState, name: String, metadata: JsonMap) -> Credential {
    let provider = metadata
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let mut credential = Credential::new(name.clone(), provider);
    credential.metadata = metadata;
    credential.attributes.insert(
        "path".to_string(),
        state.auth_dir.join(&name).to_string_lossy().to_string(),
    );
    credential
        .attributes
        .insert("source".to_string(), "file".to_string());
    credential
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    pub name: Option<String>,
    #[serde(default)]
    pub all: Option<String>,
}

pub async fn remove(
    State(state): State<ManagementState>,
    Query(query): Query<RemoveQuery>,
) -> ApiResult<Json<Value>> {
    let remove_all = query
        .all
        .as_deref()
        .is_some_and(|value| matches!(value, "true" | "1" | "yes"));
    if remove_all {
        let mut deleted = 0usize;
        for credential in state.manager.list().await {
            let already_removed = credential
                .status_message
                .as_deref()
                .is_some_and(|message| message == "removed via management API");
            if already_removed || credential.is_runtime_only() {
                continue;
            }
            if state.manager.delete(&credential.id).await.is_ok() {
                deleted += 1;
            }
        }
        return Ok(Json(json!({ "status": "ok", "deleted": deleted })));
    }
    let name = query
        .name
        .ok_or_else(|| ApiError(ProxyError::invalid("missing ?name= or ?all=true")))?;
    validate_file_name(&name).map_err(ApiError)?;
    state.manager.delete(&name).await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
pub struct StatusPatch {
    pub name: String,
    pub disabled: bool,
}

pub async fn patch_status(
    State(state): State<ManagementState>,
    Json(patch): Json<StatusPatch>,
) -> ApiResult<Json<Value>> {
    let mut credential = state
        .manager
        .get_by_id(&patch.name)
        .await
        .ok_or_else(|| ApiError(ProxyError::invalid(format!("unknown file: {}", patch.name))))?;
    credential.disabled = patch.disabled;
    credential.status = if patch.disabled {
        CredentialStatus::Disabled
    } else {
        CredentialStatus::Active
    };
    state.manager.update(credential).await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
pub struct FieldsPatch {
    pub name: String,
    pub prefix: Option<String>,
    pub proxy_url: Option<String>,
    pub priority: Option<i64>,
}

pub async fn patch_fields(
    State(state): State<ManagementState>,
    Json(patch): Json<FieldsPatch>,
) -> ApiResult<Json<Value>> {
    let mut credential = state
        .manager
        .get_by_id(&patch.name)
        .await
        .ok_or_else(|| ApiError(ProxyError::invalid(format!("unknown file: {}", patch.name))))?;
    if let Some(prefix) = patch.prefix {
        if prefix.is_empty() {
            credential.attributes.remove("prefix");
        } else {
            credential.attributes.insert("prefix".to_string(), prefix);
        }
    }
    if let Some(proxy_url) = patch.proxy_url {
        credential.proxy_url = (!proxy_url.is_empty()).then_some(proxy_url);
    }
    if let Some(priority) = patch.priority {
        credential.priority = priority;
        // Zero clears the persisted key instead of pinning an explicit 0.
        if priority == 0 {
            credential.metadata.remove("priority");
        } else {
            credential
                .metadata
                .insert("priority".to_string(), json!(priority));
        }
    }
    state.manager.update(credential).await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Service-account import for Vertex; multipart with a `file` part.
pub async fn vertex_import(
    State(state): State<ManagementState>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let (_, blob) = read_multipart_file(&mut multipart, Some("service-account.json".to_string()))
        .await?;
    let bundle = vertex::import_service_account(&blob).map_err(ApiError)?;

    let mut credential = Credential::new(bundle.file_name.clone(), "vertex");
    credential.label = bundle.label.clone();
    credential.metadata = bundle.metadata;
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
    state.manager.register(credential).await?;
    Ok(Json(json!({ "status": "ok", "name": bundle.file_name })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_validated() {
        assert!(validate_file_name("claude-a@example.com.json").is_ok());
        assert!(validate_file_name("../evil.json").is_err());
        assert!(validate_file_name("dir/evil.json").is_err());
        assert!(validate_file_name("dir\\evil.json").is_err());
        assert!(validate_file_name(".hidden.json").is_err());
        assert!(validate_file_name("token.txt").is_err());
    }

    #[test]
    fn token_blobs_must_be_objects() {
        assert!(parse_token_blob(b"{\"access_token\": \"x\"}").is_ok());
        assert!(parse_token_blob(b"[1]").is_err());
        assert!(parse_token_blob(b"not json").is_err());
    }
}
