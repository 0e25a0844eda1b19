use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::RawQuery;
use axum::response::Redirect;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use aiproxy_common::ProxyError;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Fixed localhost callback ports the upstreams insist on.
pub fn callback_port(provider: &str) -> Option<u16> {
    match provider {
        "anthropic" => Some(54545),
        "codex" => Some(1455),
        "gemini" => Some(8085),
        "antigravity" => Some(51121),
        "iflow" => Some(11451),
        _ => None,
    }
}

struct ForwarderEntry {
    handle: u64,
    shutdown: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

/// Short-lived localhost listeners that catch the browser redirect on a
/// provider's fixed port and bounce it to the management surface. One
/// registry per process; starting on an occupied port replaces the prior
/// occupant (last writer wins, after a 2s graceful shutdown).
pub struct ForwarderRegistry {
    entries: Mutex<HashMap<u16, ForwarderEntry>>,
    next_handle: AtomicU64,
}

impl Default for ForwarderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwarderRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Bind `port` and forward every request to
    /// `<target_base>/<provider>?<original query>`. Returns a handle that
    /// scopes a later `stop` to this occupancy.
    pub async fn start(
        &self,
        port: u16,
        provider: &str,
        target_base: &str,
    ) -> Result<u64, ProxyError> {
        self.shut_down_port(port).await;

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|err| {
                ProxyError::internal(format!("callback forwarder bind on {port} failed: {err}"))
            })?;

        let target = format!("{}/{}", target_base.trim_end_matches('/'), provider);
        let router = axum::Router::new().fallback(move |RawQuery(query): RawQuery| {
            let target = target.clone();
            async move {
                let url = match query.filter(|query| !query.is_empty()) {
                    Some(query) => format!("{target}?{query}"),
                    None => target,
                };
                Redirect::temporary(&url)
            }
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                warn!(%err, "callback forwarder exited with error");
            }
        });

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().await.insert(
            port,
            ForwarderEntry {
                handle,
                shutdown: shutdown_tx,
                join,
            },
        );
        debug!(port, "callback forwarder started");
        Ok(handle)
    }

    /// Idempotent stop: only tears the listener down when `handle` still
    /// owns the port, so a flow finishing late cannot kill its successor.
    pub async fn stop(&self, port: u16, handle: u64) -> bool {
        let entry = {
            let mut entries = self.entries.lock().await;
            match entries.get(&port) {
                Some(entry) if entry.handle == handle => entries.remove(&port),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };
        Self::shut_down_entry(entry).await;
        true
    }

    async fn shut_down_port(&self, port: u16) {
        let entry = self.entries.lock().await.remove(&port);
        if let Some(entry) = entry {
            debug!(port, "replacing existing callback forwarder");
            Self::shut_down_entry(entry).await;
        }
    }

    async fn shut_down_entry(entry: ForwarderEntry) {
        let _ = entry.shutdown.send(());
        if tokio::time::timeout(SHUTDOWN_GRACE, entry.join).await.is_err() {
            warn!("callback forwarder did not shut down within grace period");
        }
    }
}
