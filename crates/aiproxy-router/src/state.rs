use std::path::PathBuf;
use std::sync::Arc;

use aiproxy_credential::CredentialManager;
use aiproxy_oauth::{ForwarderRegistry, SessionStore};

use crate::usage::UsageStore;

/// Shared state behind every management handler. Cloning is cheap; the
/// interesting members are all `Arc`s.
#[derive(Clone)]
pub struct ManagementState {
    pub manager: Arc<CredentialManager>,
    pub sessions: Arc<SessionStore>,
    pub forwarders: Arc<ForwarderRegistry>,
    pub usage: Arc<UsageStore>,
    /// Directory holding token files and OAuth callback files.
    pub auth_dir: PathBuf,
    pub management_key: String,
    /// Base URL of this server as reachable from a local browser, e.g.
    /// `http://127.0.0.1:8317`.
    pub base_url: String,
    pub global_proxy: Option<String>,
}

impl ManagementState {
    /// Target base handed to the callback forwarder; the forwarder appends
    /// `/<provider>?<query>`.
    pub fn callback_target(&self) -> String {
        format!(
            "{}/v0/management/oauth/callback",
            self.base_url.trim_end_matches('/')
        )
    }
}
