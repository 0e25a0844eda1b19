use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use aiproxy_common::{ProxyError, validate_state};

use crate::session::SessionStore;

pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// What the management callback handler hands to the waiting flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub error: String,
}

impl CallbackPayload {
    fn trimmed(mut self) -> Self {
        self.code = self.code.trim().to_string();
        self.state = self.state.trim().to_string();
        self.error = self.error.trim().to_string();
        self
    }
}

pub fn callback_file_path(auth_dir: &Path, provider: &str, state: &str) -> PathBuf {
    auth_dir.join(format!(".oauth-{provider}-{state}.oauth"))
}

/// Write the authoritative callback file for a pending flow. Refused when
/// the session is not pending, so a stale browser redirect cannot resurrect
/// a finished flow.
pub async fn write_callback_file(
    auth_dir: &Path,
    sessions: &SessionStore,
    provider: &str,
    state: &str,
    payload: &CallbackPayload,
) -> Result<(), ProxyError> {
    validate_state(state)?;
    if !sessions.is_pending(state, provider) {
        return Err(ProxyError::NotPending);
    }
    tokio::fs::create_dir_all(auth_dir)
        .await
        .map_err(|err| ProxyError::internal(err.to_string()))?;
    let path = callback_file_path(auth_dir, provider, state);
    let body =
        serde_json::to_vec(payload).map_err(|err| ProxyError::internal(err.to_string()))?;
    tokio::fs::write(&path, body)
        .await
        .map_err(|err| ProxyError::internal(err.to_string()))?;
    restrict_mode(&path).await;
    debug!(file = %path.display(), "callback file written");
    Ok(())
}

#[cfg(unix)]
async fn restrict_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await;
}

#[cfg(not(unix))]
async fn restrict_mode(_path: &Path) {}

/// Poll for the callback file every 500ms for up to five minutes. Exits
/// promptly when the session leaves pending (completed or failed
/// elsewhere); the file is consumed on success.
pub async fn await_callback(
    auth_dir: &Path,
    sessions: &SessionStore,
    provider: &str,
    state: &str,
) -> Result<CallbackPayload, ProxyError> {
    let path = callback_file_path(auth_dir, provider, state);
    let deadline = tokio::time::Instant::now() + CALLBACK_TIMEOUT;

    loop {
        if let Ok(raw) = tokio::fs::read(&path).await {
            let payload = serde_json::from_slice::<CallbackPayload>(&raw)
                .map_err(|err| ProxyError::internal(format!("corrupt callback file: {err}")))?
                .trimmed();
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(payload);
        }

        if !sessions.is_pending(state, provider) {
            let message = sessions
                .get(state)
                .map(|(_, status)| status)
                .filter(|status| !status.is_empty())
                .unwrap_or_else(|| "oauth session is no longer pending".to_string());
            return Err(ProxyError::InvalidInput(message));
        }
        if tokio::time::Instant::now() >= deadline {
            sessions.set_error(state, "Authentication timed out");
            return Err(ProxyError::invalid("oauth callback timed out"));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("aiproxy-relay-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn write_is_gated_by_pending_session() {
        let dir = temp_dir("gate");
        let sessions = SessionStore::default();
        let payload = CallbackPayload {
            code: "CODE".to_string(),
            state: "S1".to_string(),
            error: String::new(),
        };

        let refused = write_callback_file(&dir, &sessions, "anthropic", "S1", &payload).await;
        assert!(matches!(refused, Err(ProxyError::NotPending)));

        sessions.register("S1", "claude").unwrap();
        write_callback_file(&dir, &sessions, "anthropic", "S1", &payload)
            .await
            .unwrap();
        let path = callback_file_path(&dir, "anthropic", "S1");
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn waiting_flow_wakes_on_file_and_consumes_it() {
        let dir = temp_dir("wake");
        let sessions = std::sync::Arc::new(SessionStore::default());
        sessions.register("S2", "anthropic").unwrap();

        let writer_dir = dir.clone();
        let writer_sessions = sessions.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            write_callback_file(
                &writer_dir,
                &writer_sessions,
                "anthropic",
                "S2",
                &CallbackPayload {
                    code: "CODE".to_string(),
                    state: "S2".to_string(),
                    error: String::new(),
                },
            )
            .await
            .unwrap();
        });

        let payload = await_callback(&dir, &sessions, "anthropic", "S2")
            .await
            .expect("callback arrives");
        writer.await.unwrap();
        assert_eq!(payload.code, "CODE");
        assert!(!callback_file_path(&dir, "anthropic", "S2").exists());
    }

    #[tokio::test]
    async fn waiting_flow_aborts_when_session_fails_elsewhere() {
        let dir = temp_dir("abort");
        let sessions = std::sync::Arc::new(SessionStore::default());
        sessions.register("S3", "anthropic").unwrap();

        let abort_sessions = sessions.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            abort_sessions.set_error("S3", "user closed the window");
        });

        let err = await_callback(&dir, &sessions, "anthropic", "S3")
            .await
            .expect_err("wait aborts");
        assert!(err.to_string().contains("user closed the window"));
    }

    #[test]
    fn payload_whitespace_is_trimmed() {
        let payload = CallbackPayload {
            code: " c ".to_string(),
            state: "s\n".to_string(),
            error: String::new(),
        }
        .trimmed();
        assert_eq!(payload.code, "c");
        assert_eq!(payload.state, "s");
    }
}
