use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use aiproxy_common::ProxyError;

static CLIENT_CACHE: OnceLock<Mutex<HashMap<Option<String>, wreq::Client>>> = OnceLock::new();

/// Shared outbound client, cached per proxy URL. Proxies never come from the
/// environment; only an explicit per-credential or global proxy applies.
pub fn client_for_proxy(proxy: Option<&str>) -> Result<wreq::Client, ProxyError> {
    let key = normalize_proxy(proxy);
    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache
        .lock()
        .map_err(|_| ProxyError::internal("http client cache lock failed"))?;
    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }
    let client = build_client(key.as_deref())?;
    guard.insert(key, client.clone());
    Ok(client)
}

fn build_client(proxy: Option<&str>) -> Result<wreq::Client, ProxyError> {
    let mut builder = wreq::Client::builder();
    match proxy {
        Some(proxy_url) => {
            builder = builder.proxy(
                wreq::Proxy::all(proxy_url).map_err(|err| ProxyError::invalid(err.to_string()))?,
            );
        }
        // Direct means direct: the environment's proxy settings do not leak
        // into upstream egress.
        None => {
            builder = builder.no_proxy();
        }
    }
    builder
        .build()
        .map_err(|err| ProxyError::internal(err.to_string()))
}

fn normalize_proxy(value: Option<&str>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

#[cfg(test)]
mod tests {
    use super::normalize_proxy;

    #[test]
    fn blank_proxies_collapse_to_direct() {
        assert_eq!(normalize_proxy(None), None);
        assert_eq!(normalize_proxy(Some("")), None);
        assert_eq!(normalize_proxy(Some("  ")), None);
        assert_eq!(
            normalize_proxy(Some(" socks5://localhost:1080 ")),
            Some("socks5://localhost:1080".to_string())
        );
    }
}
