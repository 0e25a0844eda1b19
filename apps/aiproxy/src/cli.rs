use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "aiproxy", about = "Multi-provider AI proxy server")]
pub struct Cli {
    #[arg(long, env = "AIPROXY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "AIPROXY_PORT", default_value_t = 8317)]
    pub port: u16,

    /// Key required on every management request.
    #[arg(long, env = "AIPROXY_MANAGEMENT_KEY")]
    pub management_key: String,

    /// Directory holding token files and OAuth callback files.
    #[arg(long, env = "AIPROXY_AUTH_DIR", default_value = "./auths")]
    pub auth_dir: PathBuf,

    /// Outbound proxy URL for upstream egress.
    #[arg(long, env = "AIPROXY_PROXY")]
    pub proxy: Option<String>,

    /// Base URL a local browser can reach this server under; defaults to
    /// http://127.0.0.1:<port>.
    #[arg(long, env = "AIPROXY_BASE_URL")]
    pub base_url: Option<String>,
}

impl Cli {
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.port))
    }
}
