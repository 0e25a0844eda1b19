use aiproxy_protocol::claude::response::Message;
use aiproxy_protocol::claude::types::{ContentBlock, Usage};
use aiproxy_protocol::gemini::response::GenerateContentResponse;
use aiproxy_protocol::gemini::types::Part;

use crate::ids::next_tool_call_id;
use crate::registry::StreamContext;
use crate::signature::wire_signature;

use super::stream::{claude_usage, map_stop_reason};

/// Collapse a complete Gemini response into one Claude message. Unlike the
/// streaming path, a thinking block without a signature is still emitted:
/// a non-streaming exchange is terminal and will not be replayed.
pub fn transform_response(ctx: &StreamContext, response: &GenerateContentResponse) -> Message {
    let mut message = Message::new(
        response
            .response_id
            .clone()
            .unwrap_or_else(|| "response".to_string()),
        response
            .model_version
            .clone()
            .unwrap_or_else(|| ctx.model.clone()),
    );

    let mut saw_tool_call = false;
    if let Some(candidate) = response.candidates.first() {
        if let Some(content) = &candidate.content {
            for part in &content.parts {
                append_part(ctx, part, &mut message.content, &mut saw_tool_call);
            }
        }
        message.stop_reason = candidate
            .finish_reason
            .map(|reason| map_stop_reason(reason, saw_tool_call));
    }

    if let Some(usage) = response.usage() {
        message.usage = claude_usage(usage);
    } else {
        message.usage = Usage::default();
    }
    message
}

fn append_part(
    ctx: &StreamContext,
    part: &Part,
    content: &mut Vec<ContentBlock>,
    saw_tool_call: &mut bool,
) {
    if let Some(call) = &part.function_call {
        *saw_tool_call = true;
        content.push(ContentBlock::ToolUse {
            id: next_tool_call_id(&call.name),
            name: call.name.clone(),
            input: call.args.clone().unwrap_or_else(|| serde_json::json!({})),
        });
        return;
    }

    if part.is_thought() {
        let text = part.text.as_deref().unwrap_or_default();
        let signature = part
            .thought_signature
            .as_deref()
            .filter(|sig| !sig.is_empty());
        if let Some(signature) = signature {
            ctx.cache.cache(&ctx.model, text, signature);
        }
        // Signature-only parts extend the preceding thinking block.
        if text.is_empty() {
            if let Some(ContentBlock::Thinking {
                thinking,
                signature: slot @ None,
            }) = content.last_mut()
            {
                if let Some(signature) = signature {
                    ctx.cache.cache(&ctx.model, thinking, signature);
                    *slot = Some(wire_signature(&ctx.model, signature));
                }
            }
            return;
        }
        content.push(ContentBlock::Thinking {
            thinking: text.to_string(),
            signature: signature.map(|sig| wire_signature(&ctx.model, sig)),
        });
        return;
    }

    if let Some(text) = part.text.as_deref().filter(|text| !text.is_empty()) {
        content.push(ContentBlock::Text {
            text: text.to_string(),
        });
        return;
    }

    if let Some(blob) = &part.inline_data {
        content.push(ContentBlock::Text {
            text: format!("![image](data:{};base64,{})", blob.mime_type, blob.data),
        });
    }
}
