use bytes::Bytes;
use time::OffsetDateTime;
use tracing::debug;

use aiproxy_protocol::gemini::response::GenerateContentResponse;
use aiproxy_protocol::gemini::types::{FinishReason, Part, UsageMetadata};
use aiproxy_protocol::openai::stream::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ToolCallChunk, ToolCallChunkFunction,
};
use aiproxy_protocol::openai::types::{CompletionUsage, PromptTokensDetails};
use aiproxy_protocol::sse;

use crate::ids::next_tool_call_id;
use crate::registry::{ResponseStreamTranslator, StreamContext};

/// Gemini chunks rendered as OpenAI `chat.completion.chunk` events. The
/// first emitted delta carries the assistant role; the finish chunk waits
/// for both a finish reason and usage metadata.
pub struct GeminiToOpenAiStream {
    ctx: StreamContext,
    id: String,
    created: i64,
    model: Option<String>,
    role_sent: bool,
    tool_index: u32,
    saw_tool_call: bool,
    produced_content: bool,
    finish_reason: Option<FinishReason>,
    usage: Option<UsageMetadata>,
    finish_flushed: bool,
    done_sent: bool,
}

impl GeminiToOpenAiStream {
    pub fn new(ctx: StreamContext) -> Self {
        Self {
            ctx,
            id: "chatcmpl-response".to_string(),
            created: OffsetDateTime::now_utc().unix_timestamp(),
            model: None,
            role_sent: false,
            tool_index: 0,
            saw_tool_call: false,
            produced_content: false,
            finish_reason: None,
            usage: None,
            finish_flushed: false,
            done_sent: false,
        }
    }

    fn push_response(&mut self, response: GenerateContentResponse) -> Vec<ChatCompletionChunk> {
        if let Some(id) = &response.response_id {
            self.id = format!("chatcmpl-{id}");
        }
        if let Some(version) = &response.model_version {
            self.model = Some(version.clone());
        }
        if let Some(usage) = response.usage() {
            self.usage = Some(*usage);
        }

        let mut chunks = Vec::new();
        if let Some(candidate) = response.candidates.first() {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(delta) = self.map_part(part) {
                        chunks.push(self.chunk(delta, None));
                        self.produced_content = true;
                    }
                }
            }
            if let Some(reason) = candidate.finish_reason {
                self.finish_reason = Some(reason);
            }
        }

        if !self.finish_flushed
            && self.produced_content
            && let (Some(reason), Some(usage)) = (self.finish_reason, self.usage.as_ref())
        {
            let finish = finish_reason_label(reason, self.saw_tool_call);
            let usage = completion_usage(usage);
            let mut chunk = self.chunk(ChunkDelta::default(), Some(finish));
            chunk.usage = Some(usage);
            chunks.push(chunk);
            self.finish_flushed = true;
        }
        chunks
    }

    fn map_part(&mut self, part: &Part) -> Option<ChunkDelta> {
        if let Some(call) = &part.function_call {
            let index = self.tool_index;
            self.tool_index += 1;
            self.saw_tool_call = true;
            let arguments = call
                .args
                .as_ref()
                .map(|args| serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string()))
                .unwrap_or_else(|| "{}".to_string());
            return Some(self.delta(ChunkDelta {
                tool_calls: Some(vec![ToolCallChunk {
                    index,
                    id: Some(next_tool_call_id(&call.name)),
                    r#type: Some("function".to_string()),
                    function: Some(ToolCallChunkFunction {
                        name: Some(call.name.clone()),
                        arguments: Some(arguments),
                    }),
                }]),
                ..ChunkDelta::default()
            }));
        }

        let text = part.text.as_deref().filter(|text| !text.is_empty());
        if part.is_thought() {
            return text.map(|text| {
                self.delta(ChunkDelta {
                    reasoning_content: Some(text.to_string()),
                    ..ChunkDelta::default()
                })
            });
        }
        if let Some(text) = text {
            return Some(self.delta(ChunkDelta {
                content: Some(text.to_string()),
                ..ChunkDelta::default()
            }));
        }
        if let Some(blob) = &part.inline_data {
            return Some(self.delta(ChunkDelta {
                content: Some(format!(
                    "![image](data:{};base64,{})",
                    blob.mime_type, blob.data
                )),
                ..ChunkDelta::default()
            }));
        }
        None
    }

    fn delta(&mut self, mut delta: ChunkDelta) -> ChunkDelta {
        if !self.role_sent {
            self.role_sent = true;
            delta.role = Some("assistant".to_string());
        }
        delta
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<&'static str>) -> ChatCompletionChunk {
        let mut chunk = ChatCompletionChunk::new(
            self.id.clone(),
            self.created,
            self.model.clone().unwrap_or_else(|| self.ctx.model.clone()),
        );
        chunk.choices = vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason: finish_reason.map(str::to_string),
        }];
        chunk
    }

    fn handle_done(&mut self) -> Vec<Bytes> {
        if self.done_sent || !self.finish_flushed {
            self.done_sent = true;
            return Vec::new();
        }
        self.done_sent = true;
        vec![sse::encode_done()]
    }
}

impl ResponseStreamTranslator for GeminiToOpenAiStream {
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
        if payload == sse::DONE {
            return self.handle_done();
        }
        match serde_json::from_str::<GenerateContentResponse>(payload) {
            Ok(response) => self
                .push_response(response)
                .iter()
                .map(sse::encode_data)
                .collect(),
            Err(err) => {
                debug!(%err, "skipping malformed upstream chunk");
                Vec::new()
            }
        }
    }

    fn finish(&mut self) -> Vec<Bytes> {
        self.handle_done()
    }
}

fn finish_reason_label(reason: FinishReason, saw_tool_call: bool) -> &'static str {
    if saw_tool_call {
        return "tool_calls";
    }
    match reason {
        FinishReason::MaxTokens => "length",
        FinishReason::Safety
        | FinishReason::Recitation
        | FinishReason::Blocklist
        | FinishReason::ProhibitedContent => "content_filter",
        _ => "stop",
    }
}

pub(super) fn completion_usage(usage: &UsageMetadata) -> CompletionUsage {
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
    let completion = candidates + thoughts;
    CompletionUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
        prompt_tokens_details: (cached > 0).then_some(PromptTokensDetails {
            cached_tokens: Some(cached),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::signature::SignatureCache;

    use super::*;

    fn new_stream() -> GeminiToOpenAiStream {
        GeminiToOpenAiStream::new(StreamContext {
            model: "gemini-3-pro".to_string(),
            cache: SignatureCache::default(),
        })
    }

    fn chunks_of(out: Vec<Bytes>) -> Vec<ChatCompletionChunk> {
        out.iter()
            .filter_map(|bytes| {
                let text = std::str::from_utf8(bytes).unwrap();
                let data = text.trim().strip_prefix("data:")?.trim();
                if data == sse::DONE {
                    return None;
                }
                serde_json::from_str(data).ok()
            })
            .collect()
    }

    #[test]
    fn first_delta_carries_role_and_thoughts_go_to_reasoning() {
        let mut stream = new_stream();
        let out = stream.push_chunk(
            format!(
                "data: {}",
                json!({
                    "responseId": "r2",
                    "candidates": [{"content": {"parts": [
                        {"text": "think", "thought": true},
                        {"text": "answer"}
                    ]}}]
                })
            )
            .as_bytes(),
        );
        let chunks = chunks_of(out);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, "chatcmpl-r2");
        assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(
            chunks[0].choices[0].delta.reasoning_content.as_deref(),
            Some("think")
        );
        assert!(chunks[1].choices[0].delta.role.is_none());
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("answer"));
    }

    #[test]
    fn finish_chunk_carries_usage_and_done_follows() {
        let mut stream = new_stream();
        let mut out = stream.push_chunk(
            format!(
                "data: {}",
                json!({
                    "candidates": [{
                        "content": {"parts": [{"functionCall": {"name": "f", "args": {}}}]},
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": {
                        "promptTokenCount": 10,
                        "candidatesTokenCount": 5,
                        "cachedContentTokenCount": 4,
                        "totalTokenCount": 15
                    }
                })
            )
            .as_bytes(),
        );
        out.extend(stream.push_chunk(b"data: [DONE]"));

        let done = out
            .iter()
            .any(|bytes| std::str::from_utf8(bytes).unwrap().contains("[DONE]"));
        assert!(done);

        let chunks = chunks_of(out);
        assert_eq!(chunks.len(), 2);
        let tool = chunks[0].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(tool[0].function.as_ref().unwrap().name.as_deref(), Some("f"));
        let finish = &chunks[1];
        assert_eq!(finish.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        let usage = finish.usage.as_ref().unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(
            usage
                .prompt_tokens_details
                .as_ref()
                .unwrap()
                .cached_tokens,
            Some(4)
        );
    }
}
