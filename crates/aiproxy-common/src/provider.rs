use crate::ProxyError;

/// Canonical provider names accepted by the OAuth surface.
pub const PROVIDERS: [&str; 6] = ["anthropic", "codex", "gemini", "iflow", "antigravity", "qwen"];

/// Collapse provider aliases to their canonical name.
///
/// The alias table is the sole source of truth; anything outside it is an
/// unsupported provider, not a passthrough.
pub fn normalize_provider(input: &str) -> Result<&'static str, ProxyError> {
    match input.trim().to_ascii_lowercase().as_str() {
        "anthropic" | "claude" => Ok("anthropic"),
        "codex" | "openai" => Ok("codex"),
        "gemini" | "google" => Ok("gemini"),
        "iflow" | "i-flow" => Ok("iflow"),
        "antigravity" | "anti-gravity" => Ok("antigravity"),
        "qwen" => Ok("qwen"),
        other => Err(ProxyError::invalid(format!("unsupported provider: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_provider;

    #[test]
    fn aliases_collapse_to_canonical_names() {
        for (alias, want) in [
            ("anthropic", "anthropic"),
            ("claude", "anthropic"),
            ("codex", "codex"),
            ("openai", "codex"),
            ("gemini", "gemini"),
            ("google", "gemini"),
            ("iflow", "iflow"),
            ("i-flow", "iflow"),
            ("antigravity", "antigravity"),
            ("anti-gravity", "antigravity"),
            ("qwen", "qwen"),
            ("CLAUDE", "anthropic"),
            (" Gemini ", "gemini"),
        ] {
            assert_eq!(normalize_provider(alias).unwrap(), want, "alias {alias}");
        }
    }

    #[test]
    fn unknown_providers_are_rejected() {
        for bad in ["", "kimi2", "vertex-ai", "azure", "anthropi"] {
            assert!(normalize_provider(bad).is_err(), "input {bad:?}");
        }
    }
}
