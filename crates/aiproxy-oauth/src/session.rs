use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

use aiproxy_common::{ProxyError, normalize_provider, validate_state};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
struct Session {
    provider: &'static str,
    /// Empty while pending; a non-empty string marks failure. Success is
    /// modeled as removal from the store.
    status: String,
    expires_at: OffsetDateTime,
}

/// Correlates in-flight authorization-code flows by state string. One
/// instance per process; operations are linearizable behind a single mutex
/// and every operation sweeps expired sessions first.
pub struct SessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, state: &str, provider: &str) -> Result<(), ProxyError> {
        validate_state(state)?;
        let provider = normalize_provider(provider)?;
        let mut sessions = self.lock()?;
        Self::sweep(&mut sessions);
        sessions.insert(
            state.to_string(),
            Session {
                provider,
                status: String::new(),
                expires_at: OffsetDateTime::now_utc() + self.ttl,
            },
        );
        Ok(())
    }

    /// Mark a pending session failed. Unknown states are ignored; an empty
    /// message normalizes to a generic one. The expiry refreshes so the
    /// client has time to poll the error off.
    pub fn set_error(&self, state: &str, message: &str) {
        let Ok(mut sessions) = self.lock() else {
            return;
        };
        Self::sweep(&mut sessions);
        if let Some(session) = sessions.get_mut(state) {
            session.status = if message.trim().is_empty() {
                "Authentication failed".to_string()
            } else {
                message.to_string()
            };
            session.expires_at = OffsetDateTime::now_utc() + self.ttl;
        }
    }

    /// Successful completion removes the session entirely.
    pub fn complete(&self, state: &str) {
        if let Ok(mut sessions) = self.lock() {
            Self::sweep(&mut sessions);
            sessions.remove(state);
        }
    }

    /// Remove every session for a provider, matching case-insensitively.
    pub fn complete_provider(&self, provider: &str) {
        if let Ok(mut sessions) = self.lock() {
            Self::sweep(&mut sessions);
            sessions.retain(|_, session| !session.provider.eq_ignore_ascii_case(provider));
        }
    }

    pub fn get(&self, state: &str) -> Option<(String, String)> {
        let mut sessions = self.lock().ok()?;
        Self::sweep(&mut sessions);
        sessions
            .get(state)
            .map(|session| (session.provider.to_string(), session.status.clone()))
    }

    /// A session is pending while it exists with an empty status. With a
    /// non-empty `provider` the provider must also match.
    pub fn is_pending(&self, state: &str, provider: &str) -> bool {
        let Ok(mut sessions) = self.lock() else {
            return false;
        };
        Self::sweep(&mut sessions);
        let Some(session) = sessions.get(state) else {
            return false;
        };
        if !session.status.is_empty() {
            return false;
        }
        provider.is_empty() || session.provider.eq_ignore_ascii_case(provider)
    }

    fn sweep(sessions: &mut HashMap<String, Session>) {
        let now = OffsetDateTime::now_utc();
        sessions.retain(|_, session| session.expires_at > now);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Session>>, ProxyError> {
        self.sessions
            .lock()
            .map_err(|_| ProxyError::internal("session store lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_pending_lifecycle() {
        let store = SessionStore::default();
        store.register("s1", "claude").unwrap();
        assert!(store.is_pending("s1", ""));
        assert!(store.is_pending("s1", "anthropic"));
        assert!(store.is_pending("s1", "ANTHROPIC"));
        assert!(!store.is_pending("s1", "gemini"));

        let (provider, status) = store.get("s1").unwrap();
        assert_eq!(provider, "anthropic");
        assert!(status.is_empty());

        store.complete("s1");
        assert!(store.get("s1").is_none());
        assert!(!store.is_pending("s1", ""));
    }

    #[test]
    fn errors_end_pending_but_stay_readable() {
        let store = SessionStore::default();
        store.register("s2", "gemini").unwrap();
        store.set_error("s2", "");
        assert!(!store.is_pending("s2", ""));
        let (_, status) = store.get("s2").unwrap();
        assert_eq!(status, "Authentication failed");

        store.set_error("s2", "denied by user");
        assert_eq!(store.get("s2").unwrap().1, "denied by user");
        // Unknown states are ignored.
        store.set_error("missing", "whatever");
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn invalid_states_and_providers_never_enter_the_store() {
        let store = SessionStore::default();
        assert!(store.register("has/slash", "claude").is_err());
        assert!(store.register("..", "claude").is_err());
        assert!(store.register(&"x".repeat(129), "claude").is_err());
        assert!(store.register("ok", "not-a-provider").is_err());
        assert!(store.get("has/slash").is_none());
    }

    #[test]
    fn complete_provider_is_case_insensitive() {
        let store = SessionStore::default();
        store.register("a", "qwen").unwrap();
        store.register("b", "QWEN").unwrap();
        store.register("c", "gemini").unwrap();
        store.complete_provider("Qwen");
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_none());
        assert!(store.get("c").is_some());
    }

    #[test]
    fn expired_sessions_are_swept() {
        let store = SessionStore::new(Duration::from_secs(0));
        store.register("gone", "claude").unwrap();
        assert!(store.get("gone").is_none());
        assert!(!store.is_pending("gone", ""));
    }
}
