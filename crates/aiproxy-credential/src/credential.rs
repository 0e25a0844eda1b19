use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub type JsonMap = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Disabled,
    Unavailable,
}

/// One OAuth identity shared by several per-project virtual credentials.
/// Token refresh and metadata reads always resolve through this parent so
/// the token payload is never stored twice.
#[derive(Debug)]
pub struct SharedCredential {
    pub primary_id: String,
    pub email: String,
    metadata: RwLock<JsonMap>,
    project_ids: RwLock<Vec<String>>,
}

impl SharedCredential {
    pub fn new(primary_id: impl Into<String>, email: impl Into<String>, metadata: JsonMap) -> Self {
        Self {
            primary_id: primary_id.into(),
            email: email.into(),
            metadata: RwLock::new(metadata),
            project_ids: RwLock::new(Vec::new()),
        }
    }

    pub fn metadata_snapshot(&self) -> JsonMap {
        self.metadata.read().map(|map| map.clone()).unwrap_or_default()
    }

    pub fn replace_metadata(&self, metadata: JsonMap) {
        if let Ok(mut guard) = self.metadata.write() {
            *guard = metadata;
        }
    }

    pub fn project_ids(&self) -> Vec<String> {
        self.project_ids
            .read()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    pub fn add_project(&self, project_id: impl Into<String>) {
        if let Ok(mut guard) = self.project_ids.write() {
            let project_id = project_id.into();
            if !guard.contains(&project_id) {
                guard.push(project_id);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum CredentialRuntime {
    Shared(Arc<SharedCredential>),
    Virtual {
        project_id: String,
        parent: Arc<SharedCredential>,
    },
}

impl CredentialRuntime {
    pub fn parent(&self) -> &Arc<SharedCredential> {
        match self {
            CredentialRuntime::Shared(parent) => parent,
            CredentialRuntime::Virtual { parent, .. } => parent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Stable identifier; for file-backed credentials this is the file name.
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub label: String,
    /// Ordering for round-robin dispatch.
    #[serde(default)]
    pub index: u64,
    /// Provider-specific token payload, treated as an opaque blob.
    #[serde(default)]
    pub metadata: JsonMap,
    /// Small string attributes: path, source, runtime_only, custom headers.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub disabled: bool,
    pub status: CredentialStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub last_refreshed: i64,
    #[serde(default)]
    pub next_refresh_after: i64,
    #[serde(skip)]
    pub runtime: Option<CredentialRuntime>,
}

impl Credential {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        Self {
            id: id.into(),
            provider: provider.into(),
            label: String::new(),
            index: 0,
            metadata: JsonMap::new(),
            attributes: BTreeMap::new(),
            proxy_url: None,
            priority: 0,
            disabled: false,
            status: CredentialStatus::Active,
            status_message: None,
            created_at: now,
            updated_at: now,
            last_refreshed: 0,
            next_refresh_after: 0,
            runtime: None,
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.attributes.get("path").map(String::as_str)
    }

    pub fn is_runtime_only(&self) -> bool {
        self.attributes
            .get("runtime_only")
            .is_some_and(|value| value == "true")
    }

    /// Metadata used for token operations: virtual and shared credentials
    /// always read through the shared parent.
    pub fn effective_metadata(&self) -> JsonMap {
        match &self.runtime {
            Some(runtime) => runtime.parent().metadata_snapshot(),
            None => self.metadata.clone(),
        }
    }
}

/// Extract the outbound access token from a credential, walking the
/// documented key precedence.
pub fn access_token(credential: &Credential) -> Option<String> {
    let metadata = &credential.metadata;
    if let Some(token) = string_key(metadata, "access_token") {
        return Some(token);
    }
    if let Some(token) = string_key(metadata, "accessToken") {
        return Some(token);
    }
    match metadata.get("token") {
        Some(Value::Object(token)) => {
            if let Some(token) = string_key(token, "access_token") {
                return Some(token);
            }
        }
        Some(Value::String(token)) if !token.is_empty() => {
            return Some(token.clone());
        }
        _ => {}
    }
    if let Some(key) = credential
        .attributes
        .get("api_key")
        .filter(|key| !key.is_empty())
    {
        return Some(key.clone());
    }
    if let Some(runtime) = &credential.runtime {
        let shared = runtime.parent().metadata_snapshot();
        if let Some(token) = string_key(&shared, "access_token") {
            return Some(token);
        }
    }
    if let Some(token) = string_key(metadata, "id_token") {
        return Some(token);
    }
    string_key(metadata, "cookie")
}

fn string_key(map: &JsonMap, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Expiry of the token payload. Providers persist either an RFC3339 string
/// (`expired`) or unix seconds (`expires_at` / `expire`); an unparseable
/// value reads as already expired.
pub fn metadata_expiry(metadata: &JsonMap) -> Option<OffsetDateTime> {
    for key in ["expired", "expires_at", "expire"] {
        match metadata.get(key) {
            Some(Value::String(raw)) => {
                return Some(
                    OffsetDateTime::parse(raw, &Rfc3339)
                        .unwrap_or(OffsetDateTime::UNIX_EPOCH),
                );
            }
            Some(Value::Number(number)) => {
                let seconds = number.as_i64()?;
                return OffsetDateTime::from_unix_timestamp(seconds).ok();
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn metadata(value: Value) -> JsonMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn token_extraction_follows_precedence() {
        let mut credential = Credential::new("a.json", "gemini");
        credential.metadata = metadata(json!({
            "accessToken": "camel",
            "access_token": "snake",
            "id_token": "idt"
        }));
        assert_eq!(access_token(&credential).as_deref(), Some("snake"));

        credential.metadata = metadata(json!({"accessToken": "camel"}));
        assert_eq!(access_token(&credential).as_deref(), Some("camel"));

        credential.metadata = metadata(json!({"token": {"access_token": "nested"}}));
        assert_eq!(access_token(&credential).as_deref(), Some("nested"));

        credential.metadata = metadata(json!({"token": "flat"}));
        assert_eq!(access_token(&credential).as_deref(), Some("flat"));

        credential.metadata = JsonMap::new();
        credential
            .attributes
            .insert("api_key".to_string(), "key-1".to_string());
        assert_eq!(access_token(&credential).as_deref(), Some("key-1"));

        credential.attributes.clear();
        credential.metadata = metadata(json!({"id_token": "idt"}));
        assert_eq!(access_token(&credential).as_deref(), Some("idt"));

        credential.metadata = metadata(json!({"cookie": "BXAuth=zzz"}));
        assert_eq!(access_token(&credential).as_deref(), Some("BXAuth=zzz"));

        credential.metadata = JsonMap::new();
        assert!(access_token(&credential).is_none());
    }

    #[test]
    fn shared_runtime_supplies_tokens_for_virtual_credentials() {
        let parent = Arc::new(SharedCredential::new(
            "gemini-a@example.com-all.json",
            "a@example.com",
            metadata(json!({"access_token": "shared-token"})),
        ));
        let mut virtual_credential = Credential::new("a@example.com-p1.json", "gemini");
        virtual_credential.runtime = Some(CredentialRuntime::Virtual {
            project_id: "p1".to_string(),
            parent: parent.clone(),
        });
        assert_eq!(
            access_token(&virtual_credential).as_deref(),
            Some("shared-token")
        );

        parent.replace_metadata(metadata(json!({"access_token": "rotated"})));
        assert_eq!(
            access_token(&virtual_credential).as_deref(),
            Some("rotated")
        );
        assert_eq!(
            virtual_credential.effective_metadata().get("access_token"),
            Some(&json!("rotated"))
        );
    }

    #[test]
    fn expiry_parses_rfc3339_and_unix() {
        let rfc = metadata(json!({"expired": "2026-01-02T03:04:05Z"}));
        let parsed = metadata_expiry(&rfc).unwrap();
        assert_eq!(parsed.year(), 2026);

        let unix = metadata(json!({"expires_at": 1767322800}));
        assert!(metadata_expiry(&unix).is_some());

        let garbage = metadata(json!({"expired": "not a date"}));
        assert_eq!(metadata_expiry(&garbage), Some(OffsetDateTime::UNIX_EPOCH));

        assert!(metadata_expiry(&JsonMap::new()).is_none());
    }

    #[test]
    fn shared_projects_are_deduplicated() {
        let shared = SharedCredential::new("id", "a@b.c", JsonMap::new());
        shared.add_project("p1");
        shared.add_project("p2");
        shared.add_project("p1");
        assert_eq!(shared.project_ids(), vec!["p1", "p2"]);
    }
}
