use bytes::Bytes;
use tracing::debug;

use aiproxy_protocol::claude::response::Message;
use aiproxy_protocol::claude::stream::{
    ContentBlockDelta, MessageDeltaBody, StreamContentBlock, StreamEvent,
};
use aiproxy_protocol::claude::types::{JsonObject, StopReason, Usage};
use aiproxy_protocol::gemini::response::GenerateContentResponse;
use aiproxy_protocol::gemini::types::{FinishReason, Part, UsageMetadata};
use aiproxy_protocol::sse;

use crate::ids::next_tool_call_id;
use crate::registry::{ResponseStreamTranslator, StreamContext};
use crate::signature::wire_signature;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    None,
    Text,
    Thinking,
    Tool,
}

/// Per-connection state machine translating Gemini generate-content chunks
/// into the Anthropic named-event stream dialect. Mutated in place; one
/// instance per response stream, touched only by the serving task.
pub struct GeminiToClaudeStream {
    ctx: StreamContext,
    response_id: String,
    model_version: Option<String>,
    started: bool,
    block: Block,
    open_index: Option<u32>,
    next_index: u32,
    thinking_buf: String,
    produced_content: bool,
    saw_tool_call: bool,
    finish_reason: Option<FinishReason>,
    usage: Option<UsageMetadata>,
    finish_flushed: bool,
    stopped: bool,
}

impl GeminiToClaudeStream {
    pub fn new(ctx: StreamContext) -> Self {
        Self {
            ctx,
            response_id: "response".to_string(),
            model_version: None,
            started: false,
            block: Block::None,
            open_index: None,
            next_index: 0,
            thinking_buf: String::new(),
            produced_content: false,
            saw_tool_call: false,
            finish_reason: None,
            usage: None,
            finish_flushed: false,
            stopped: false,
        }
    }

    pub fn push_response(&mut self, response: GenerateContentResponse) -> Vec<StreamEvent> {
        if self.stopped {
            return Vec::new();
        }

        if let Some(id) = &response.response_id {
            self.response_id = id.clone();
        }
        if let Some(version) = &response.model_version {
            self.model_version = Some(version.clone());
        }
        if let Some(usage) = response.usage() {
            self.usage = Some(*usage);
        }

        let mut events = Vec::new();
        self.ensure_started(&mut events);

        if let Some(candidate) = response.candidates.first() {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    self.handle_part(part, &mut events);
                }
            }
            if let Some(reason) = candidate.finish_reason {
                self.finish_reason = Some(reason);
            }
        }

        self.maybe_flush_finish(&mut events);
        events
    }

    /// Handle the `[DONE]` sentinel: the terminal `message_stop` only goes
    /// out after the finish pair was flushed and only once.
    fn handle_done(&mut self) -> Vec<StreamEvent> {
        if self.stopped || !self.finish_flushed {
            self.stopped = true;
            return Vec::new();
        }
        self.stopped = true;
        vec![StreamEvent::MessageStop]
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        let mut message = Message::new(
            self.response_id.clone(),
            self.model_version
                .clone()
                .unwrap_or_else(|| self.ctx.model.clone()),
        );
        if let Some(usage) = &self.usage {
            message.usage = claude_usage(usage);
        }
        events.push(StreamEvent::MessageStart { message });
    }

    fn handle_part(&mut self, part: &Part, events: &mut Vec<StreamEvent>) {
        if let Some(call) = &part.function_call {
            let id = next_tool_call_id(&call.name);
            self.open_block(
                Block::Tool,
                StreamContentBlock::ToolUse {
                    id,
                    name: call.name.clone(),
                    input: JsonObject::new(),
                },
                events,
            );
            let partial_json = call
                .args
                .as_ref()
                .map(|args| serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string()))
                .unwrap_or_else(|| "{}".to_string());
            self.push_delta(ContentBlockDelta::InputJsonDelta { partial_json }, events);
            self.saw_tool_call = true;
            // A tool block holds exactly one argument payload; the next part
            // of any kind starts a fresh block.
            self.block = Block::None;
            return;
        }

        if part.is_thought() {
            let text = part.text.as_deref().unwrap_or_default();
            if !text.is_empty() {
                self.ensure_block(
                    Block::Thinking,
                    StreamContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                    events,
                );
                self.push_delta(
                    ContentBlockDelta::ThinkingDelta {
                        thinking: text.to_string(),
                    },
                    events,
                );
                self.thinking_buf.push_str(text);
            }
            if let Some(signature) = part
                .thought_signature
                .as_deref()
                .filter(|sig| !sig.is_empty())
            {
                self.ensure_block(
                    Block::Thinking,
                    StreamContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                    events,
                );
                self.push_delta(
                    ContentBlockDelta::SignatureDelta {
                        signature: wire_signature(&self.ctx.model, signature),
                    },
                    events,
                );
                self.ctx
                    .cache
                    .cache(&self.ctx.model, &self.thinking_buf, signature);
                self.thinking_buf.clear();
            }
            return;
        }

        if let Some(text) = part.text.as_deref().filter(|text| !text.is_empty()) {
            self.ensure_block(
                Block::Text,
                StreamContentBlock::Text {
                    text: String::new(),
                },
                events,
            );
            self.push_delta(
                ContentBlockDelta::TextDelta {
                    text: text.to_string(),
                },
                events,
            );
            return;
        }

        if let Some(blob) = &part.inline_data {
            self.ensure_block(
                Block::Text,
                StreamContentBlock::Text {
                    text: String::new(),
                },
                events,
            );
            self.push_delta(
                ContentBlockDelta::TextDelta {
                    text: format!("![image](data:{};base64,{})", blob.mime_type, blob.data),
                },
                events,
            );
        }
    }

    /// Open a block of `kind` unless one is already open.
    fn ensure_block(
        &mut self,
        kind: Block,
        start: StreamContentBlock,
        events: &mut Vec<StreamEvent>,
    ) {
        if self.block == kind {
            return;
        }
        self.open_block(kind, start, events);
    }

    /// Close whatever block is open and start a new one at the next index.
    fn open_block(&mut self, kind: Block, start: StreamContentBlock, events: &mut Vec<StreamEvent>) {
        self.close_block(events);
        let index = self.next_index;
        self.next_index += 1;
        self.open_index = Some(index);
        self.block = kind;
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: start,
        });
        self.produced_content = true;
    }

    fn close_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(index) = self.open_index.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
        self.block = Block::None;
    }

    fn push_delta(&mut self, delta: ContentBlockDelta, events: &mut Vec<StreamEvent>) {
        let Some(index) = self.open_index else {
            return;
        };
        events.push(StreamEvent::ContentBlockDelta { index, delta });
    }

    /// The finish pair waits for both a finish reason and usage metadata;
    /// nothing final is emitted for streams that never produced content.
    fn maybe_flush_finish(&mut self, events: &mut Vec<StreamEvent>) {
        if self.finish_flushed || !self.produced_content {
            return;
        }
        let (Some(reason), Some(usage)) = (self.finish_reason, self.usage.as_ref()) else {
            return;
        };
        let usage = claude_usage(usage);
        self.close_block(events);
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(map_stop_reason(reason, self.saw_tool_call)),
                stop_sequence: None,
            },
            usage,
        });
        self.finish_flushed = true;
    }
}

impl ResponseStreamTranslator for GeminiToClaudeStream {
    fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            debug!("dropping non-utf8 stream chunk");
            return Vec::new();
        };
        let payload = text.trim().strip_prefix("data:").unwrap_or(text.trim());
        let payload = payload.trim();
        if payload.is_empty() {
            return Vec::new();
        }
        let events = if payload == sse::DONE {
            self.handle_done()
        } else {
            match serde_json::from_str::<GenerateContentResponse>(payload) {
                Ok(response) => self.push_response(response),
                Err(err) => {
                    debug!(%err, "skipping malformed upstream chunk");
                    Vec::new()
                }
            }
        };
        encode_events(&events)
    }

    fn finish(&mut self) -> Vec<Bytes> {
        encode_events(&self.handle_done())
    }
}

fn encode_events(events: &[StreamEvent]) -> Vec<Bytes> {
    events
        .iter()
        .map(|event| sse::encode_named(event.event_name(), event))
        .collect()
}

pub(super) fn map_stop_reason(reason: FinishReason, saw_tool_call: bool) -> StopReason {
    if saw_tool_call {
        return StopReason::ToolUse;
    }
    match reason {
        FinishReason::MaxTokens => StopReason::MaxTokens,
        FinishReason::Safety
        | FinishReason::Recitation
        | FinishReason::Blocklist
        | FinishReason::ProhibitedContent => StopReason::Refusal,
        FinishReason::Stop
        | FinishReason::Unspecified
        | FinishReason::Unknown
        | FinishReason::MalformedFunctionCall
        | FinishReason::Other => StopReason::EndTurn,
    }
}

/// Map Gemini usage to the Anthropic shape. `candidatesTokenCount` can be
/// zero alongside a real total; derive it then. Cached tokens surface as
/// `cache_read_input_tokens` and leave `input_tokens` to avoid
/// double-counting.
pub(super) fn claude_usage(usage: &UsageMetadata) -> Usage {
    let prompt = usage.prompt_token_count.unwrap_or(0);
    let thoughts = usage.thoughts_token_count.unwrap_or(0);
    let cached = usage.cached_content_token_count.unwrap_or(0);
    let candidates = match usage.candidates_token_count {
        Some(count) if count > 0 => count,
        _ => usage
            .total_token_count
            .unwrap_or(0)
            .saturating_sub(prompt)
            .saturating_sub(thoughts),
    };
    Usage {
        input_tokens: prompt.saturating_sub(cached),
        output_tokens: candidates,
        cache_read_input_tokens: (cached > 0).then_some(cached),
        cache_creation_input_tokens: None,
    }
}

#[cfg(test)]
mod tests {
    use aiproxy_protocol::sse::SseParser;
    use serde_json::json;

    use crate::signature::SignatureCache;

    use super::*;

    const SIG: &str = "SIGNATURE_OF_AT_LEAST_FIFTY_CHARACTERS_0123456789ABCDEF";

    fn new_stream() -> GeminiToClaudeStream {
        GeminiToClaudeStream::new(StreamContext {
            model: "claude-sonnet-4-5-thinking".to_string(),
            cache: SignatureCache::default(),
        })
    }

    fn parse(chunks: Vec<Bytes>) -> Vec<StreamEvent> {
        let mut parser = SseParser::new();
        let mut events = Vec::new();
        for chunk in chunks {
            for sse_event in parser.push_bytes(&chunk) {
                events.push(serde_json::from_str::<StreamEvent>(&sse_event.data).unwrap());
            }
        }
        events
    }

    fn chunk(json: serde_json::Value) -> String {
        format!("data: {json}")
    }

    #[test]
    fn text_stream_produces_ordered_block_lifecycle() {
        let mut stream = new_stream();
        let mut out = Vec::new();
        out.extend(stream.push_chunk(
            chunk(json!({
                "responseId": "r1",
                "modelVersion": "models/gemini-3-pro",
                "candidates": [{"content": {"role": "model", "parts": [{"text": "Hel"}]}}]
            }))
            .as_bytes(),
        ));
        out.extend(stream.push_chunk(
            chunk(json!({
                "candidates": [
                    {"content": {"parts": [{"text": "lo"}]}, "finishReason": "STOP"}
                ],
                "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 2, "totalTokenCount": 12}
            }))
            .as_bytes(),
        ));
        out.extend(stream.push_chunk(b"data: [DONE]"));

        let events = parse(out);
        let kinds: Vec<&str> = events.iter().map(StreamEvent::event_name).collect();
        assert_eq!(
            kinds,
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        match &events[0] {
            StreamEvent::MessageStart { message } => {
                assert_eq!(message.id, "r1");
                assert_eq!(message.model, "models/gemini-3-pro");
            }
            other => panic!("unexpected first event {other:?}"),
        }
        match &events[5] {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, Some(StopReason::EndTurn));
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn thinking_signature_is_prefixed_and_cached() {
        let mut stream = new_stream();
        stream.push_chunk(
            chunk(json!({
                "candidates": [{"content": {"parts": [{"text": "deep thought", "thought": true}]}}]
            }))
            .as_bytes(),
        );
        let out = stream.push_chunk(
            chunk(json!({
                "candidates": [{"content": {"parts": [
                    {"text": "", "thought": true, "thoughtSignature": SIG}
                ]}}]
            }))
            .as_bytes(),
        );

        let events = parse(out);
        match &events[0] {
            StreamEvent::ContentBlockDelta {
                delta: ContentBlockDelta::SignatureDelta { signature },
                ..
            } => assert_eq!(signature, &format!("claude-thinking#{SIG}")),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            stream
                .ctx
                .cache
                .get("claude-sonnet-4-5-thinking", "deep thought")
                .as_deref(),
            Some(SIG)
        );
        assert!(stream.thinking_buf.is_empty());
    }

    #[test]
    fn block_transitions_close_and_reindex() {
        let mut stream = new_stream();
        let out = stream.push_chunk(
            chunk(json!({
                "candidates": [{"content": {"parts": [
                    {"text": "thinking...", "thought": true},
                    {"text": "visible"},
                    {"functionCall": {"name": "lookup", "args": {"q": "x"}}}
                ]}}]
            }))
            .as_bytes(),
        );
        let events = parse(out);
        let kinds: Vec<&str> = events.iter().map(StreamEvent::event_name).collect();
        assert_eq!(
            kinds,
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
            ]
        );
        match &events[7] {
            StreamEvent::ContentBlockStart {
                index,
                content_block: StreamContentBlock::ToolUse { id, name, .. },
            } => {
                assert_eq!(*index, 2);
                assert_eq!(name, "lookup");
                assert!(id.starts_with("lookup-"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &events[8] {
            StreamEvent::ContentBlockDelta {
                delta: ContentBlockDelta::InputJsonDelta { partial_json },
                ..
            } => assert_eq!(partial_json, "{\"q\":\"x\"}"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn tool_use_stop_reason_wins() {
        let mut stream = new_stream();
        let mut out = Vec::new();
        out.extend(stream.push_chunk(
            chunk(json!({
                "candidates": [{
                    "content": {"parts": [{"functionCall": {"name": "t", "args": {}}}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 4, "totalTokenCount": 9, "thoughtsTokenCount": 2}
            }))
            .as_bytes(),
        ));
        let events = parse(out);
        let delta = events
            .iter()
            .find_map(|event| match event {
                StreamEvent::MessageDelta { delta, usage } => Some((delta, usage)),
                _ => None,
            })
            .expect("finish pair flushed");
        assert_eq!(delta.0.stop_reason, Some(StopReason::ToolUse));
        // candidates derived: 9 - 4 - 2 = 3.
        assert_eq!(delta.1.output_tokens, 3);
    }

    #[test]
    fn cached_tokens_are_subtracted_from_input() {
        let usage = claude_usage(&UsageMetadata {
            prompt_token_count: Some(100),
            candidates_token_count: Some(7),
            thoughts_token_count: None,
            cached_content_token_count: Some(60),
            total_token_count: Some(107),
        });
        assert_eq!(usage.input_tokens, 40);
        assert_eq!(usage.cache_read_input_tokens, Some(60));
    }

    #[test]
    fn no_content_means_no_final_events() {
        let mut stream = new_stream();
        let mut out = Vec::new();
        out.extend(stream.push_chunk(
            chunk(json!({
                "candidates": [{"finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 1, "totalTokenCount": 1}
            }))
            .as_bytes(),
        ));
        out.extend(stream.push_chunk(b"data: [DONE]"));
        let events = parse(out);
        assert!(
            events
                .iter()
                .all(|event| matches!(event, StreamEvent::MessageStart { .. })),
            "only the prelude may appear: {events:?}"
        );
    }

    #[test]
    fn malformed_chunks_are_skipped_not_fatal() {
        let mut stream = new_stream();
        assert!(stream.push_chunk(b"data: {not json").is_empty());
        let out = stream.push_chunk(
            chunk(json!({
                "candidates": [{"content": {"parts": [{"text": "ok"}]}}]
            }))
            .as_bytes(),
        );
        assert!(!out.is_empty());
    }
}
