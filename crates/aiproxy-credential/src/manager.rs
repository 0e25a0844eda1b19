use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::credential::{
    Credential, CredentialRuntime, CredentialStatus, JsonMap, access_token, metadata_expiry,
};
use crate::store::{CredentialStore, StoreError};

const REFRESH_RETRY_BUDGET: u32 = 3;
const REFRESH_TICK: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("missing refresh material: {0}")]
    MissingMaterial(&'static str),
    #[error("token endpoint rejected refresh: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("credential not found: {0}")]
    NotFound(String),
    #[error("credential has no usable token")]
    NoToken,
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-provider token refresh. The skew decides how early before expiry a
/// refresh is scheduled; Google-family providers need at least 30 seconds.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    fn provider(&self) -> &'static str;

    fn refresh_skew(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Returns the replacement metadata map. Must be a full map, not a
    /// patch; the manager swaps it in atomically.
    async fn refresh(
        &self,
        metadata: &JsonMap,
        proxy: Option<&str>,
    ) -> Result<JsonMap, RefreshError>;
}

/// Unified in-memory registry of credentials. `list` hands out clones;
/// mutations snapshot-and-replace under the write lock; refreshes are
/// serialized per credential id.
pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    credentials: RwLock<HashMap<String, Credential>>,
    refreshers: HashMap<&'static str, Arc<dyn TokenRefresher>>,
    in_flight: Mutex<HashSet<String>>,
    retry_counts: Mutex<HashMap<String, u32>>,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            credentials: RwLock::new(HashMap::new()),
            refreshers: HashMap::new(),
            in_flight: Mutex::new(HashSet::new()),
            retry_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refreshers.insert(refresher.provider(), refresher);
        self
    }

    /// Discovery: load every credential the store knows about.
    pub async fn load(&self) -> Result<usize, ManagerError> {
        let discovered = self.store.load_all().await?;
        let mut credentials = self.credentials.write().await;
        let count = discovered.len();
        for credential in discovered {
            credentials.insert(credential.id.clone(), credential);
        }
        info!(count, "loaded credentials");
        Ok(count)
    }

    /// Consistent snapshot of clones, ordered by round-robin index.
    pub async fn list(&self) -> Vec<Credential> {
        let credentials = self.credentials.read().await;
        let mut list: Vec<Credential> = credentials.values().cloned().collect();
        list.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Credential> {
        self.credentials.read().await.get(id).cloned()
    }

    pub async fn register(&self, mut credential: Credential) -> Result<String, ManagerError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        credential.created_at = now;
        credential.updated_at = now;
        self.store.save(&credential).await?;
        let id = credential.id.clone();
        self.credentials
            .write()
            .await
            .insert(id.clone(), credential);
        Ok(id)
    }

    pub async fn update(&self, mut credential: Credential) -> Result<String, ManagerError> {
        credential.updated_at = OffsetDateTime::now_utc().unix_timestamp();
        self.store.save(&credential).await?;
        let id = credential.id.clone();
        self.credentials
            .write()
            .await
            .insert(id.clone(), credential);
        Ok(id)
    }

    /// Remove the persisted credential; the in-memory entry stays behind,
    /// disabled, so in-flight requests see a coherent state.
    pub async fn delete(&self, id: &str) -> Result<(), ManagerError> {
        self.store.delete(id).await?;
        let mut credentials = self.credentials.write().await;
        let Some(credential) = credentials.get_mut(id) else {
            return Err(ManagerError::NotFound(id.to_string()));
        };
        credential.disabled = true;
        credential.status = CredentialStatus::Disabled;
        credential.status_message = Some("removed via management API".to_string());
        Ok(())
    }

    /// Access token for outbound use, refreshing first when the payload is
    /// at or past its refresh window.
    pub async fn resolve_token(&self, id: &str) -> Result<String, ManagerError> {
        let credential = self
            .get_by_id(id)
            .await
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        if self.needs_refresh(&credential) {
            self.refresh_credential(id).await?;
        }
        let credential = self
            .get_by_id(id)
            .await
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        access_token(&credential).ok_or(ManagerError::NoToken)
    }

    fn needs_refresh(&self, credential: &Credential) -> bool {
        let Some(refresher) = self.refreshers.get(credential.provider.as_str()) else {
            return false;
        };
        let Some(expiry) = metadata_expiry(&credential.effective_metadata()) else {
            return false;
        };
        let skew = refresher.refresh_skew();
        OffsetDateTime::now_utc() + skew >= expiry
    }

    /// One in-flight refresh per credential; concurrent callers yield to the
    /// winner and re-read its result.
    pub async fn refresh_credential(&self, id: &str) -> Result<(), ManagerError> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(id.to_string()) {
                return Ok(());
            }
        }
        let result = self.refresh_inner(id).await;
        self.in_flight.lock().await.remove(id);
        result
    }

    async fn refresh_inner(&self, id: &str) -> Result<(), ManagerError> {
        let credential = self
            .get_by_id(id)
            .await
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        let Some(refresher) = self.refreshers.get(credential.provider.as_str()) else {
            return Ok(());
        };

        let metadata = credential.effective_metadata();
        let outcome = refresher
            .refresh(&metadata, credential.proxy_url.as_deref())
            .await;

        match outcome {
            Ok(updated_metadata) => {
                self.retry_counts.lock().await.remove(id);
                self.apply_refreshed_metadata(id, updated_metadata).await?;
                debug!(credential = id, "token refreshed");
                Ok(())
            }
            Err(err) => {
                let exhausted = {
                    let mut retries = self.retry_counts.lock().await;
                    let count = retries.entry(id.to_string()).or_insert(0);
                    *count += 1;
                    *count >= REFRESH_RETRY_BUDGET
                };
                let mut credentials = self.credentials.write().await;
                if let Some(entry) = credentials.get_mut(id) {
                    entry.status_message = Some(err.to_string());
                    if exhausted {
                        entry.status = CredentialStatus::Unavailable;
                    }
                }
                warn!(credential = id, %err, exhausted, "token refresh failed");
                Err(err.into())
            }
        }
    }

    async fn apply_refreshed_metadata(
        &self,
        id: &str,
        metadata: JsonMap,
    ) -> Result<(), ManagerError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let snapshot = {
            let mut credentials = self.credentials.write().await;
            let Some(entry) = credentials.get_mut(id) else {
                return Err(ManagerError::NotFound(id.to_string()));
            };
            match &entry.runtime {
                Some(runtime) => runtime.parent().replace_metadata(metadata),
                None => entry.metadata = metadata,
            }
            entry.last_refreshed = now;
            entry.updated_at = now;
            entry.status = CredentialStatus::Active;
            entry.status_message = None;
            entry.clone()
        };
        // Virtual credentials persist through their shared parent's file.
        let to_save = match &snapshot.runtime {
            Some(CredentialRuntime::Virtual { parent, .. }) => {
                let mut parent_credential = snapshot.clone();
                parent_credential.id = parent.primary_id.clone();
                parent_credential.metadata = parent.metadata_snapshot();
                parent_credential
            }
            Some(CredentialRuntime::Shared(parent)) => {
                let mut shared = snapshot.clone();
                shared.metadata = parent.metadata_snapshot();
                shared
            }
            None => snapshot,
        };
        self.store.save(&to_save).await?;
        Ok(())
    }

    /// Background loop: proactively refresh credentials whose expiry falls
    /// inside the provider's skew window.
    pub fn spawn_refresh_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REFRESH_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                for credential in manager.list().await {
                    if credential.disabled || credential.status != CredentialStatus::Active {
                        continue;
                    }
                    if !manager.needs_refresh(&credential) {
                        continue;
                    }
                    if let Err(err) = manager.refresh_credential(&credential.id).await {
                        debug!(credential = %credential.id, %err, "scheduled refresh failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;

    struct MemoryStore {
        saved: std::sync::Mutex<HashMap<String, JsonMap>>,
    }

    impl MemoryStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                saved: std::sync::Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl CredentialStore for MemoryStore {
        async fn save(&self, credential: &Credential) -> Result<(), StoreError> {
            self.saved
                .lock()
                .unwrap()
                .insert(credential.id.clone(), credential.metadata.clone());
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<(), StoreError> {
            self.saved.lock().unwrap().remove(id);
            Ok(())
        }

        async fn load_all(&self) -> Result<Vec<Credential>, StoreError> {
            Ok(Vec::new())
        }
    }

    struct FakeRefresher {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        fn provider(&self) -> &'static str {
            "antigravity"
        }

        async fn refresh(
            &self,
            metadata: &JsonMap,
            _proxy: Option<&str>,
        ) -> Result<JsonMap, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RefreshError::Rejected("invalid_grant".to_string()));
            }
            let mut updated = metadata.clone();
            updated.insert("access_token".to_string(), json!("new"));
            updated.insert("refresh_token".to_string(), json!("rt2"));
            updated.insert("expired".to_string(), json!("2099-01-01T00:00:00Z"));
            Ok(updated)
        }
    }

    fn expired_credential() -> Credential {
        let mut credential = Credential::new("antigravity-a@example.com.json", "antigravity");
        credential.metadata = json!({
            "type": "antigravity",
            "access_token": "old",
            "refresh_token": "rt",
            "expired": "2020-01-01T00:00:00Z"
        })
        .as_object()
        .cloned()
        .unwrap();
        credential
    }

    #[tokio::test]
    async fn resolve_token_refreshes_expired_credentials() {
        let store = MemoryStore::new();
        let refresher = Arc::new(FakeRefresher {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let manager = CredentialManager::new(store.clone()).with_refresher(refresher.clone());
        manager.register(expired_credential()).await.unwrap();

        let token = manager
            .resolve_token("antigravity-a@example.com.json")
            .await
            .unwrap();
        assert_eq!(token, "new");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        // Persisted record matches the refreshed metadata.
        let saved = store.saved.lock().unwrap();
        let blob = saved.get("antigravity-a@example.com.json").unwrap();
        assert_eq!(blob.get("access_token"), Some(&json!("new")));
        assert_eq!(blob.get("refresh_token"), Some(&json!("rt2")));
    }

    #[tokio::test]
    async fn fresh_tokens_are_not_refreshed() {
        let store = MemoryStore::new();
        let refresher = Arc::new(FakeRefresher {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let manager = CredentialManager::new(store).with_refresher(refresher.clone());
        let mut credential = expired_credential();
        credential
            .metadata
            .insert("expired".to_string(), json!("2099-01-01T00:00:00Z"));
        manager.register(credential).await.unwrap();

        let token = manager
            .resolve_token("antigravity-a@example.com.json")
            .await
            .unwrap();
        assert_eq!(token, "old");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_marks_unavailable() {
        let store = MemoryStore::new();
        let refresher = Arc::new(FakeRefresher {
            calls: AtomicU32::new(0),
            fail: true,
        });
        let manager = CredentialManager::new(store).with_refresher(refresher);
        manager.register(expired_credential()).await.unwrap();

        for attempt in 0..REFRESH_RETRY_BUDGET {
            let result = manager
                .refresh_credential("antigravity-a@example.com.json")
                .await;
            assert!(result.is_err(), "attempt {attempt}");
        }
        let credential = manager
            .get_by_id("antigravity-a@example.com.json")
            .await
            .unwrap();
        assert_eq!(credential.status, CredentialStatus::Unavailable);
        assert!(credential.status_message.is_some());
    }

    #[tokio::test]
    async fn delete_marks_in_memory_entry_disabled() {
        let store = MemoryStore::new();
        let manager = CredentialManager::new(store.clone());
        manager.register(expired_credential()).await.unwrap();

        manager
            .delete("antigravity-a@example.com.json")
            .await
            .unwrap();
        assert!(
            !store
                .saved
                .lock()
                .unwrap()
                .contains_key("antigravity-a@example.com.json")
        );
        let credential = manager
            .get_by_id("antigravity-a@example.com.json")
            .await
            .unwrap();
        assert!(credential.disabled);
        assert_eq!(credential.status, CredentialStatus::Disabled);
        assert_eq!(
            credential.status_message.as_deref(),
            Some("removed via management API")
        );
    }

    #[tokio::test]
    async fn list_returns_clones_in_index_order() {
        let store = MemoryStore::new();
        let manager = CredentialManager::new(store);
        let mut first = Credential::new("b.json", "claude");
        first.index = 1;
        let mut second = Credential::new("a.json", "claude");
        second.index = 0;
        manager.register(first).await.unwrap();
        manager.register(second).await.unwrap();

        let mut listed = manager.list().await;
        assert_eq!(listed[0].id, "a.json");
        assert_eq!(listed[1].id, "b.json");

        // Mutating the clone must not leak into the registry.
        listed[0].label = "mutated".to_string();
        assert!(manager.get_by_id("a.json").await.unwrap().label.is_empty());
    }
}
