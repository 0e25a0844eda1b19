//! Claude Messages clients dispatched to a Gemini-family upstream: requests
//! map forward, responses (stream and non-stream) map back.

pub mod request;
pub mod response;
pub mod stream;

use crate::registry::{
    Format, Registry, ResponseStreamTranslator, StreamContext, TranslateContext, TranslateError,
    TranslatorSet, token_count_envelope,
};
use crate::schema::Dialect;

use aiproxy_protocol::claude::request::CreateMessageRequest;
use aiproxy_protocol::gemini::response::GenerateContentResponse;

pub fn register(registry: &mut Registry) {
    registry.register(
        Format::Claude,
        Format::Gemini,
        TranslatorSet {
            request: translate_request,
            stream: new_stream,
            non_stream: translate_non_stream,
            token_count: |count| token_count_envelope(Format::Claude, count),
        },
    );
}

fn translate_request(ctx: &TranslateContext, payload: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let request: CreateMessageRequest =
        serde_json::from_slice(payload).map_err(|err| TranslateError::invalid("claude", err))?;
    let mut translated = request::transform_request(ctx, request, Dialect::Gemini);
    if translated.safety_settings.is_none() {
        translated.safety_settings = ctx.defaults.safety_settings.clone();
    }
    serde_json::to_vec(&translated).map_err(|err| TranslateError::invalid("gemini", err))
}

fn new_stream(ctx: &StreamContext) -> Box<dyn ResponseStreamTranslator> {
    Box::new(stream::GeminiToClaudeStream::new(ctx.clone()))
}

fn translate_non_stream(ctx: &StreamContext, payload: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let response: GenerateContentResponse =
        serde_json::from_slice(payload).map_err(|err| TranslateError::invalid("gemini", err))?;
    let message = response::transform_response(ctx, &response);
    serde_json::to_vec(&message).map_err(|err| TranslateError::invalid("claude", err))
}
