use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use aiproxy_credential::{CredentialManager, FileStore};
use aiproxy_oauth::providers::{antigravity, claude, codex, gemini, iflow, kimi, qwen};
use aiproxy_oauth::{ForwarderRegistry, SessionStore};
use aiproxy_router::state::ManagementState;
use aiproxy_router::usage::UsageStore;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::Cli::parse();
    let base_url = args.base_url();

    let store = Arc::new(FileStore::new(args.auth_dir.clone()));
    let manager = Arc::new(
        CredentialManager::new(store)
            .with_refresher(Arc::new(claude::ClaudeRefresher))
            .with_refresher(Arc::new(codex::CodexRefresher))
            .with_refresher(Arc::new(gemini::GeminiRefresher))
            .with_refresher(Arc::new(antigravity::AntigravityRefresher))
            .with_refresher(Arc::new(qwen::QwenRefresher))
            .with_refresher(Arc::new(kimi::KimiRefresher))
            .with_refresher(Arc::new(iflow::IflowRefresher)),
    );
    let loaded = manager.load().await?;
    tracing::info!(loaded, "credential discovery complete");
    let refresh_task = manager.clone().spawn_refresh_loop();

    let state = ManagementState {
        manager,
        sessions: Arc::new(SessionStore::default()),
        forwarders: Arc::new(ForwarderRegistry::new()),
        usage: Arc::new(UsageStore::new()),
        auth_dir: args.auth_dir.clone(),
        management_key: args.management_key.clone(),
        base_url,
        global_proxy: args.proxy.clone(),
    };

    let app = aiproxy_router::management_router(state);

    let bind = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    refresh_task.abort();
    Ok(())
}
