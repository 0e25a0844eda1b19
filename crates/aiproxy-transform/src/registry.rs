use std::collections::HashMap;

use bytes::Bytes;
use serde_json::{Value, json};

use aiproxy_protocol::gemini::types::SafetySetting;

use crate::generate_content;
use crate::signature::SignatureCache;

/// Wire formats the proxy speaks. A format can appear on either side of a
/// translator pair: the client-facing source or the upstream-facing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Claude,
    OpenAiChat,
    Gemini,
    GeminiCli,
    Antigravity,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Claude => "claude",
            Format::OpenAiChat => "openai",
            Format::Gemini => "gemini",
            Format::GeminiCli => "gemini_cli",
            Format::Antigravity => "antigravity",
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("invalid {format} payload: {reason}")]
    InvalidPayload { format: &'static str, reason: String },
    #[error("no translator registered for {source} -> {target}")]
    NotRegistered { source: Format, target: Format },
}

impl TranslateError {
    pub fn invalid(format: &'static str, err: impl std::fmt::Display) -> Self {
        TranslateError::InvalidPayload {
            format,
            reason: err.to_string(),
        }
    }
}

/// Externally supplied defaults stamped into translated requests.
#[derive(Debug, Clone, Default)]
pub struct TranslateDefaults {
    pub safety_settings: Option<Vec<SafetySetting>>,
}

/// Per-request inputs to a request transform.
pub struct TranslateContext<'a> {
    pub cache: &'a SignatureCache,
    pub defaults: &'a TranslateDefaults,
}

/// Per-connection inputs to a response transform; owns its data because the
/// stream state outlives the request that created it.
#[derive(Clone)]
pub struct StreamContext {
    pub model: String,
    pub cache: SignatureCache,
}

/// Persistent per-stream translator state. Feed raw SSE/JSON chunks, collect
/// encoded events in the source dialect.
pub trait ResponseStreamTranslator: Send {
    fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Bytes>;

    /// Flush anything the state machine is still holding at end of stream.
    fn finish(&mut self) -> Vec<Bytes> {
        Vec::new()
    }
}

pub type RequestFn = fn(&TranslateContext, &[u8]) -> Result<Vec<u8>, TranslateError>;
pub type StreamFn = fn(&StreamContext) -> Box<dyn ResponseStreamTranslator>;
pub type NonStreamFn = fn(&StreamContext, &[u8]) -> Result<Vec<u8>, TranslateError>;
pub type TokenCountFn = fn(u64) -> Value;

/// The translator triple (plus the token-count envelope) for one
/// (source, target) pair.
#[derive(Clone)]
pub struct TranslatorSet {
    pub request: RequestFn,
    pub stream: StreamFn,
    pub non_stream: NonStreamFn,
    pub token_count: TokenCountFn,
}

/// Two-level (source -> target) translator table. Built once at bootstrap;
/// lookups are O(1) and registration order is irrelevant.
pub struct Registry {
    table: HashMap<(Format, Format), TranslatorSet>,
}

impl Registry {
    /// Deterministic reset point for tests.
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        generate_content::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, source: Format, target: Format, set: TranslatorSet) {
        self.table.insert((source, target), set);
    }

    pub fn resolve(&self, source: Format, target: Format) -> Result<&TranslatorSet, TranslateError> {
        self.table
            .get(&(source, target))
            .ok_or(TranslateError::NotRegistered { source, target })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Token-count envelope in the source client's dialect.
pub fn token_count_envelope(source: Format, count: u64) -> Value {
    match source {
        Format::Claude => json!({ "input_tokens": count }),
        Format::OpenAiChat => json!({ "prompt_tokens": count }),
        Format::Gemini | Format::Antigravity => json!({ "totalTokens": count }),
        Format::GeminiCli => json!({ "response": { "totalTokens": count } }),
    }
}
