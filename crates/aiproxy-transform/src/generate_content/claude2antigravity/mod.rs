//! Claude Messages clients dispatched to the Antigravity backend. The
//! mapping is the Gemini one with the stricter Antigravity schema dialect,
//! wrapped in the cloudcode request envelope; responses arrive wrapped the
//! same way and unwrap onto the shared Gemini-to-Claude machinery.

use bytes::Bytes;
use tracing::debug;

use aiproxy_protocol::claude::request::CreateMessageRequest;
use aiproxy_protocol::gemini::cli::{CliRequestEnvelope, CliResponseEnvelope};
use aiproxy_protocol::gemini::response::GenerateContentResponse;
use aiproxy_protocol::sse;

use crate::registry::{
    Format, Registry, ResponseStreamTranslator, StreamContext, TranslateContext, TranslateError,
    TranslatorSet, token_count_envelope,
};
use crate::schema::Dialect;

use super::claude2gemini::{request, response, stream};

pub fn register(registry: &mut Registry) {
    registry.register(
        Format::Claude,
        Format::Antigravity,
        TranslatorSet {
            request: translate_request,
            stream: new_stream,
            non_stream: translate_non_stream,
            token_count: |count| token_count_envelope(Format::Claude, count),
        },
    );
}

fn translate_request(ctx: &TranslateContext, payload: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let claude_request: CreateMessageRequest =
        serde_json::from_slice(payload).map_err(|err| TranslateError::invalid("claude", err))?;
    let model = claude_request.model.clone();
    let mut inner = request::transform_request(ctx, claude_request, Dialect::Antigravity);
    if inner.safety_settings.is_none() {
        inner.safety_settings = ctx.defaults.safety_settings.clone();
    }
    let envelope = CliRequestEnvelope {
        model: Some(model),
        // The dispatcher fills the project from the selected credential.
        project: None,
        user_prompt_id: None,
        request: inner,
    };
    serde_json::to_vec(&envelope).map_err(|err| TranslateError::invalid("antigravity", err))
}

fn new_stream(ctx: &StreamContext) -> Box<dyn ResponseStreamTranslator> {
    Box::new(AntigravityToClaudeStream {
        inner: stream::GeminiToClaudeStream::new(ctx.clone()),
    })
}

fn translate_non_stream(ctx: &StreamContext, payload: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let response = unwrap_response(payload)
        .map_err(|err| TranslateError::invalid("antigravity", err))?;
    let message = response::transform_response(ctx, &response);
    serde_json::to_vec(&message).map_err(|err| TranslateError::invalid("claude", err))
}

/// Wraps the Gemini-to-Claude state machine, peeling the `{"response": ...}`
/// envelope off every chunk first.
struct AntigravityToClaudeStream {
    inner: stream::GeminiToClaudeStream,
}

impl ResponseStreamTranslator for AntigravityToClaudeStream {
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
            return self.inner.push_chunk(chunk);
        }
        match unwrap_response(payload.as_bytes()) {
            Ok(response) => {
                let body = serde_json::to_vec(&response).unwrap_or_default();
                let framed = [b"data: ", body.as_slice()].concat();
                self.inner.push_chunk(&framed)
            }
            Err(err) => {
                debug!(%err, "skipping malformed antigravity chunk");
                Vec::new()
            }
        }
    }

    fn finish(&mut self) -> Vec<Bytes> {
        self.inner.finish()
    }
}

/// Accept both the wrapped and the bare response shape; some error paths
/// skip the envelope.
fn unwrap_response(payload: &[u8]) -> Result<GenerateContentResponse, serde_json::Error> {
    match serde_json::from_slice::<CliResponseEnvelope>(payload) {
        Ok(envelope) => Ok(envelope.response),
        Err(_) => serde_json::from_slice::<GenerateContentResponse>(payload),
    }
}
