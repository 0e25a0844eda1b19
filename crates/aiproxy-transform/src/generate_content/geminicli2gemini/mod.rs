//! Gemini CLI clients speak the cloudcode envelope; the public Gemini API
//! wants the bare generate-content shapes. Requests unwrap, responses wrap.

use bytes::Bytes;
use tracing::debug;

use aiproxy_protocol::gemini::cli::{CliRequestEnvelope, CliResponseEnvelope};
use aiproxy_protocol::gemini::response::GenerateContentResponse;
use aiproxy_protocol::sse;

use crate::registry::{
    Format, Registry, ResponseStreamTranslator, StreamContext, TranslateContext, TranslateError,
    TranslatorSet, token_count_envelope,
};

pub fn register(registry: &mut Registry) {
    registry.register(
        Format::GeminiCli,
        Format::Gemini,
        TranslatorSet {
            request: translate_request,
            stream: new_stream,
            non_stream: translate_non_stream,
            token_count: |count| token_count_envelope(Format::GeminiCli, count),
        },
    );
}

fn translate_request(ctx: &TranslateContext, payload: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let envelope: CliRequestEnvelope =
        serde_json::from_slice(payload).map_err(|err| TranslateError::invalid("gemini_cli", err))?;
    let mut inner = envelope.request;
    if inner.safety_settings.is_none() {
        inner.safety_settings = ctx.defaults.safety_settings.clone();
    }
    serde_json::to_vec(&inner).map_err(|err| TranslateError::invalid("gemini", err))
}

fn new_stream(_ctx: &StreamContext) -> Box<dyn ResponseStreamTranslator> {
    Box::new(GeminiToCliStream)
}

fn translate_non_stream(_ctx: &StreamContext, payload: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let response: GenerateContentResponse =
        serde_json::from_slice(payload).map_err(|err| TranslateError::invalid("gemini", err))?;
    serde_json::to_vec(&CliResponseEnvelope { response })
        .map_err(|err| TranslateError::invalid("gemini_cli", err))
}

/// Stateless per-chunk wrap; the CLI dialect keeps Gemini's data-only SSE
/// framing.
struct GeminiToCliStream;

impl ResponseStreamTranslator for GeminiToCliStream {
    fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        let payload = text.trim().strip_prefix("data:").unwrap_or(text.trim());
        let payload = payload.trim();
        if payload.is_empty() {
            return Vec::new();
        }
        if payload == sse::DONE {
            return vec![sse::encode_done()];
        }
        match serde_json::from_str::<GenerateContentResponse>(payload) {
            Ok(response) => vec![sse::encode_data(&CliResponseEnvelope { response })],
            Err(err) => {
                debug!(%err, "skipping malformed upstream chunk");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::registry::TranslateDefaults;
    use crate::signature::SignatureCache;

    use super::*;

    #[test]
    fn request_envelope_unwraps_to_public_shape() {
        let cache = SignatureCache::default();
        let defaults = TranslateDefaults::default();
        let ctx = TranslateContext {
            cache: &cache,
            defaults: &defaults,
        };
        let payload = json!({
            "model": "gemini-3-pro",
            "project": "p-1",
            "request": {"contents": [{"role": "user", "parts": [{"text": "hi"}]}]}
        });
        let translated =
            translate_request(&ctx, payload.to_string().as_bytes()).expect("translates");
        let value: serde_json::Value = serde_json::from_slice(&translated).unwrap();
        assert!(value.get("request").is_none());
        assert_eq!(value["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn stream_chunks_are_rewrapped() {
        let mut stream = GeminiToCliStream;
        let out = stream.push_chunk(
            format!(
                "data: {}",
                json!({"candidates": [{"content": {"parts": [{"text": "x"}]}}]})
            )
            .as_bytes(),
        );
        let text = String::from_utf8_lossy(&out[0]);
        let data: serde_json::Value =
            serde_json::from_str(text.trim().strip_prefix("data:").unwrap().trim()).unwrap();
        assert_eq!(
            data["response"]["candidates"][0]["content"]["parts"][0]["text"],
            "x"
        );
    }
}
