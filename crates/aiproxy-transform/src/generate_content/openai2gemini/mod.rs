//! OpenAI Chat Completions clients dispatched to a Gemini-family upstream.

pub mod request;
pub mod response;
pub mod stream;

use crate::registry::{
    Format, Registry, ResponseStreamTranslator, StreamContext, TranslateContext, TranslateError,
    TranslatorSet, token_count_envelope,
};

use aiproxy_protocol::gemini::response::GenerateContentResponse;
use aiproxy_protocol::openai::request::ChatCompletionRequest;

pub fn register(registry: &mut Registry) {
    registry.register(
        Format::OpenAiChat,
        Format::Gemini,
        TranslatorSet {
            request: translate_request,
            stream: new_stream,
            non_stream: translate_non_stream,
            token_count: |count| token_count_envelope(Format::OpenAiChat, count),
        },
    );
}

fn translate_request(ctx: &TranslateContext, payload: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let request: ChatCompletionRequest =
        serde_json::from_slice(payload).map_err(|err| TranslateError::invalid("openai", err))?;
    let mut translated = request::transform_request(request);
    if translated.safety_settings.is_none() {
        translated.safety_settings = ctx.defaults.safety_settings.clone();
    }
    serde_json::to_vec(&translated).map_err(|err| TranslateError::invalid("gemini", err))
}

fn new_stream(ctx: &StreamContext) -> Box<dyn ResponseStreamTranslator> {
    Box::new(stream::GeminiToOpenAiStream::new(ctx.clone()))
}

fn translate_non_stream(ctx: &StreamContext, payload: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let parsed: GenerateContentResponse =
        serde_json::from_slice(payload).map_err(|err| TranslateError::invalid("gemini", err))?;
    let completion = response::transform_response(ctx, &parsed);
    serde_json::to_vec(&completion).map_err(|err| TranslateError::invalid("openai", err))
}
