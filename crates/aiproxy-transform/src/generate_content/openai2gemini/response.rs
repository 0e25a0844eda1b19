use time::OffsetDateTime;

use aiproxy_protocol::gemini::response::GenerateContentResponse;
use aiproxy_protocol::gemini::types::FinishReason;
use aiproxy_protocol::openai::response::{AssistantMessage, ChatCompletion, Choice};
use aiproxy_protocol::openai::types::{FunctionCallSpec, ToolCall};

use crate::ids::next_tool_call_id;
use crate::registry::StreamContext;

use super::stream::completion_usage;

pub fn transform_response(
    ctx: &StreamContext,
    response: &GenerateContentResponse,
) -> ChatCompletion {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut finish_reason: Option<FinishReason> = None;

    if let Some(candidate) = response.candidates.first() {
        finish_reason = candidate.finish_reason;
        if let Some(candidate_content) = &candidate.content {
            for part in &candidate_content.parts {
                if let Some(call) = &part.function_call {
                    let arguments = call
                        .args
                        .as_ref()
                        .map(|args| {
                            serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string())
                        })
                        .unwrap_or_else(|| "{}".to_string());
                    tool_calls.push(ToolCall {
                        id: next_tool_call_id(&call.name),
                        r#type: "function".to_string(),
                        function: FunctionCallSpec {
                            name: call.name.clone(),
                            arguments,
                        },
                    });
                    continue;
                }
                let Some(text) = part.text.as_deref().filter(|text| !text.is_empty()) else {
                    continue;
                };
                if part.is_thought() {
                    reasoning.push_str(text);
                } else {
                    content.push_str(text);
                }
            }
        }
    }

    let finish = match (finish_reason, tool_calls.is_empty()) {
        (_, false) => Some("tool_calls".to_string()),
        (Some(FinishReason::MaxTokens), _) => Some("length".to_string()),
        (Some(_), _) => Some("stop".to_string()),
        (None, _) => None,
    };

    ChatCompletion {
        id: format!(
            "chatcmpl-{}",
            response.response_id.as_deref().unwrap_or("response")
        ),
        object: "chat.completion".to_string(),
        created: OffsetDateTime::now_utc().unix_timestamp(),
        model: response
            .model_version
            .clone()
            .unwrap_or_else(|| ctx.model.clone()),
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: (!content.is_empty()).then_some(content),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: finish,
        }],
        usage: response.usage().map(completion_usage),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::signature::SignatureCache;

    use super::*;

    #[test]
    fn full_response_maps_to_one_choice() {
        let ctx = StreamContext {
            model: "gemini-3-pro".to_string(),
            cache: SignatureCache::default(),
        };
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "responseId": "r7",
            "modelVersion": "models/gemini-3-pro",
            "candidates": [{
                "content": {"parts": [
                    {"text": "mull", "thought": true},
                    {"text": "final answer"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 3, "totalTokenCount": 11}
        }))
        .unwrap();
        let completion = transform_response(&ctx, &response);
        assert_eq!(completion.id, "chatcmpl-r7");
        assert_eq!(completion.model, "models/gemini-3-pro");
        let choice = &completion.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("final answer"));
        assert_eq!(choice.message.reasoning_content.as_deref(), Some("mull"));
        assert_eq!(choice.finish_reason.as_deref(), Some("stop"));
        assert_eq!(completion.usage.as_ref().unwrap().prompt_tokens, 8);
    }
}
