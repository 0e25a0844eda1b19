use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::credential::{Credential, JsonMap};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid credential file {name}: {reason}")]
    InvalidFile { name: String, reason: String },
}

/// Persistence sink for credentials. Calls are serialized through the
/// manager so there is at most one writer per credential id.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn save(&self, credential: &Credential) -> Result<(), StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn load_all(&self) -> Result<Vec<Credential>, StoreError>;
}

/// One JSON token file per credential under the auth directory, named by the
/// provider-specific rule. The blob is the credential's metadata map,
/// round-tripped untouched.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        if credential.is_runtime_only() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.file_path(&credential.id);
        let blob = serde_json::to_vec_pretty(&Value::Object(credential.metadata.clone()))
            .map_err(|err| StoreError::InvalidFile {
                name: credential.id.clone(),
                reason: err.to_string(),
            })?;
        tokio::fs::write(&path, blob).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.file_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_all(&self) -> Result<Vec<Credential>, StoreError> {
        let mut credentials = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(credentials),
            Err(err) => return Err(err.into()),
        };

        let mut index = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") || name.starts_with('.') {
                continue;
            }
            let raw = match tokio::fs::read(entry.path()).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(file = %name, %err, "skipping unreadable token file");
                    continue;
                }
            };
            let metadata: JsonMap = match serde_json::from_slice::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    warn!(file = %name, "skipping token file that is not a JSON object");
                    continue;
                }
            };

            let provider = infer_provider(&name, &metadata);
            let mut credential = Credential::new(name.clone(), provider);
            credential.index = index;
            index += 1;
            credential.metadata = metadata;
            credential
                .attributes
                .insert("path".to_string(), entry.path().to_string_lossy().to_string());
            credential
                .attributes
                .insert("source".to_string(), "file".to_string());
            debug!(file = %name, provider = %credential.provider, "discovered credential");
            credentials.push(credential);
        }
        Ok(credentials)
    }
}

/// Provider tag for a discovered file: an explicit `type` field in the blob
/// wins, otherwise the file-name prefix decides.
fn infer_provider(name: &str, metadata: &JsonMap) -> String {
    if let Some(tag) = metadata.get("type").and_then(Value::as_str)
        && !tag.is_empty()
    {
        return tag.to_string();
    }
    for prefix in [
        "gemini",
        "codex",
        "claude",
        "qwen",
        "iflow",
        "kimi",
        "antigravity",
        "vertex",
    ] {
        if name.starts_with(prefix) {
            return prefix.to_string();
        }
    }
    // Single-project Gemini files are named `<email>-<project>.json`.
    if name.contains('@') {
        return "gemini".to_string();
    }
    "unknown".to_string()
}
