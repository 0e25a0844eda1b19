use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use sha2::{Digest, Sha256};

/// Sentinel accepted by Gemini-family validators in place of a real
/// thought signature.
pub const SKIP_SIGNATURE_SENTINEL: &str = "skip_thought_signature_validator";

/// Real signatures observed on the wire are long opaque tokens; anything
/// shorter is treated as garbage.
pub const MIN_SIGNATURE_LEN: usize = 50;

const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const DEFAULT_CAPACITY: u64 = 4096;

type Key = (String, [u8; 32]);

/// Associates upstream-minted thought signatures with the thinking text they
/// were minted for, scoped by model group so a signature from one family can
/// never be replayed to another.
///
/// Cloning is cheap; all clones share the same store.
#[derive(Clone)]
pub struct SignatureCache {
    store: Arc<Cache<Key, String>>,
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

impl SignatureCache {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        let store = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(capacity.max(1))
            .support_invalidation_closures()
            .build();
        Self {
            store: Arc::new(store),
        }
    }

    /// Store `signature` for `(model group, text)`. Empty text and invalid
    /// signatures are ignored silently; an existing entry is overwritten.
    pub fn cache(&self, model: &str, text: &str, signature: &str) {
        if text.is_empty() || !self.has_valid_signature(model, signature) {
            return;
        }
        let key = (model_group(model), hash_text(text));
        self.store.insert(key, signature.to_string());
    }

    /// Look up the signature for `(model group, text)`. A miss is not an
    /// error; callers fall back to client-provided proof or drop the block.
    pub fn get(&self, model: &str, text: &str) -> Option<String> {
        self.store.get(&(model_group(model), hash_text(text)))
    }

    /// `scope == ""` clears everything; otherwise clears one model group.
    pub fn clear(&self, scope: &str) {
        if scope.is_empty() {
            self.store.invalidate_all();
            return;
        }
        let scope = scope.to_string();
        let _ = self
            .store
            .invalidate_entries_if(move |(group, _), _| *group == scope);
    }

    pub fn has_valid_signature(&self, model: &str, signature: &str) -> bool {
        if signature.len() >= MIN_SIGNATURE_LEN {
            return true;
        }
        signature == SKIP_SIGNATURE_SENTINEL && is_gemini_family(model)
    }
}

fn hash_text(text: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.finalize().into()
}

/// Canonicalize a model id to its coarse signature-isolation group.
pub fn model_group(model: &str) -> String {
    let lowered = model.to_ascii_lowercase();
    if lowered.contains("claude") {
        return "claude-thinking".to_string();
    }
    if lowered.contains("gemini-3") {
        return "gemini-3".to_string();
    }
    if lowered.contains("gemini-2.5") {
        return "gemini-2.5".to_string();
    }
    if lowered.contains("gemini") {
        return "gemini".to_string();
    }
    lowered
}

pub fn is_gemini_family(model: &str) -> bool {
    model_group(model).starts_with("gemini")
}

/// Signature form sent to clients: `<modelGroup>#<sig>`. The group prefix
/// lets a later request prove which family minted the signature.
pub fn wire_signature(model: &str, signature: &str) -> String {
    format!("{}#{signature}", model_group(model))
}

/// Split a client-provided `<modelGroup>#<sig>` signature.
pub fn parse_wire_signature(raw: &str) -> Option<(&str, &str)> {
    let (group, sig) = raw.split_once('#')?;
    if group.is_empty() || sig.is_empty() {
        return None;
    }
    Some((group, sig))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIG: &str = "SIGNATURE_OF_AT_LEAST_FIFTY_CHARACTERS_0123456789ABCDEF";

    #[test]
    fn cached_signatures_come_back_until_cleared() {
        let cache = SignatureCache::default();
        cache.cache("gemini-3-pro", "thought", SIG);
        assert_eq!(cache.get("gemini-3-pro", "thought").as_deref(), Some(SIG));

        // Same group, different model id.
        assert_eq!(
            cache.get("gemini-3-flash", "thought").as_deref(),
            Some(SIG)
        );

        cache.clear("");
        cache.store.run_pending_tasks();
        assert!(cache.get("gemini-3-pro", "thought").is_none());
    }

    #[test]
    fn groups_isolate_signatures() {
        let cache = SignatureCache::default();
        cache.cache("claude-opus-4-thinking", "thought", SIG);
        assert!(cache.get("gemini-3-pro", "thought").is_none());
    }

    #[test]
    fn scoped_clear_leaves_other_groups() {
        let cache = SignatureCache::default();
        cache.cache("gemini-3-pro", "a", SIG);
        cache.cache("claude-opus-4", "b", SIG);
        cache.clear("gemini-3");
        cache.store.run_pending_tasks();
        assert!(cache.get("gemini-3-pro", "a").is_none());
        assert_eq!(cache.get("claude-opus-4", "b").as_deref(), Some(SIG));
    }

    #[test]
    fn short_or_empty_inputs_are_ignored() {
        let cache = SignatureCache::default();
        cache.cache("gemini-3-pro", "", SIG);
        cache.cache("gemini-3-pro", "thought", "short");
        assert!(cache.get("gemini-3-pro", "").is_none());
        assert!(cache.get("gemini-3-pro", "thought").is_none());
    }

    #[test]
    fn sentinel_is_valid_only_for_gemini_family() {
        let cache = SignatureCache::default();
        assert!(cache.has_valid_signature("gemini-3-pro", SKIP_SIGNATURE_SENTINEL));
        assert!(!cache.has_valid_signature("claude-opus-4", SKIP_SIGNATURE_SENTINEL));
        assert!(cache.has_valid_signature("claude-opus-4", SIG));
        assert!(!cache.has_valid_signature("gemini-3-pro", "tiny"));
    }

    #[test]
    fn model_groups_collapse_families() {
        assert_eq!(model_group("claude-sonnet-4-5-thinking"), "claude-thinking");
        assert_eq!(model_group("claude-opus-4"), "claude-thinking");
        assert_eq!(model_group("gemini-3-pro-preview"), "gemini-3");
        assert_eq!(model_group("gemini-2.5-flash"), "gemini-2.5");
        assert_eq!(model_group("gemini-1.5-pro"), "gemini");
        assert_eq!(model_group("qwen3-coder"), "qwen3-coder");
    }

    #[test]
    fn wire_signatures_round_trip() {
        let wire = wire_signature("gemini-3-pro", SIG);
        assert_eq!(wire, format!("gemini-3#{SIG}"));
        let (group, sig) = parse_wire_signature(&wire).unwrap();
        assert_eq!(group, "gemini-3");
        assert_eq!(sig, SIG);
        assert!(parse_wire_signature("nohash").is_none());
        assert!(parse_wire_signature("#sig").is_none());
    }
}
