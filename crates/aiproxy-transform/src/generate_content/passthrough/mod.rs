//! Identity pairs. Same-dialect traffic still gets the outbound stamps the
//! target expects: Claude-bound requests receive cache-control breakpoints,
//! Gemini-bound requests the default safety settings.

use bytes::Bytes;

use aiproxy_protocol::claude::request::CreateMessageRequest;
use aiproxy_protocol::gemini::request::GenerateContentRequest;

use crate::cache_control;
use crate::registry::{
    Format, Registry, ResponseStreamTranslator, TranslateContext, TranslateError, TranslatorSet,
    token_count_envelope,
};

pub fn register(registry: &mut Registry) {
    registry.register(
        Format::Claude,
        Format::Claude,
        TranslatorSet {
            request: claude_request,
            stream: passthrough_stream,
            non_stream: passthrough_body,
            token_count: |count| token_count_envelope(Format::Claude, count),
        },
    );
    registry.register(
        Format::Gemini,
        Format::Gemini,
        TranslatorSet {
            request: gemini_request,
            stream: passthrough_stream,
            non_stream: passthrough_body,
            token_count: |count| token_count_envelope(Format::Gemini, count),
        },
    );
    registry.register(
        Format::OpenAiChat,
        Format::OpenAiChat,
        TranslatorSet {
            request: identity_request,
            stream: passthrough_stream,
            non_stream: passthrough_body,
            token_count: |count| token_count_envelope(Format::OpenAiChat, count),
        },
    );
}

fn identity_request(_ctx: &TranslateContext, payload: &[u8]) -> Result<Vec<u8>, TranslateError> {
    Ok(payload.to_vec())
}

fn passthrough_stream(
    _ctx: &crate::registry::StreamContext,
) -> Box<dyn ResponseStreamTranslator> {
    Box::new(Passthrough)
}

fn passthrough_body(
    _ctx: &crate::registry::StreamContext,
    payload: &[u8],
) -> Result<Vec<u8>, TranslateError> {
    Ok(payload.to_vec())
}

fn claude_request(_ctx: &TranslateContext, payload: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let mut request: CreateMessageRequest =
        serde_json::from_slice(payload).map_err(|err| TranslateError::invalid("claude", err))?;
    cache_control::inject(&mut request);
    serde_json::to_vec(&request).map_err(|err| TranslateError::invalid("claude", err))
}

fn gemini_request(ctx: &TranslateContext, payload: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let mut request: GenerateContentRequest =
        serde_json::from_slice(payload).map_err(|err| TranslateError::invalid("gemini", err))?;
    if request.safety_settings.is_none() {
        request.safety_settings = ctx.defaults.safety_settings.clone();
    }
    serde_json::to_vec(&request).map_err(|err| TranslateError::invalid("gemini", err))
}

struct Passthrough;

impl ResponseStreamTranslator for Passthrough {
    fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        vec![Bytes::copy_from_slice(chunk)]
    }
}
