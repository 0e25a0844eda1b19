use serde_json::{Value, json};
use tracing::debug;

use aiproxy_protocol::claude::request::CreateMessageRequest;
use aiproxy_protocol::claude::types::{
    ContentBlockParam, ImageSource, MessageContent, MessageParam, MessageRole, SystemParam,
    ThinkingParam, ToolParam,
};
use aiproxy_protocol::gemini::request::GenerateContentRequest;
use aiproxy_protocol::gemini::types::{
    Content, ContentRole, FunctionCall, FunctionDeclaration, FunctionResponse, GenerationConfig,
    Part, ThinkingConfig, Tool,
};

use crate::ids::strip_tool_call_suffix;
use crate::registry::TranslateContext;
use crate::schema::{self, Dialect};
use crate::signature::{self, SKIP_SIGNATURE_SENTINEL, SignatureCache};

/// Appended to the system instruction when a Claude-thinking model runs with
/// tools, so the upstream keeps emitting thought blocks between calls.
const INTERLEAVED_THINKING_HINT: &str = "Interleaved thinking is enabled: you may emit thinking \
between tool calls and after receiving tool results before producing the next response.";

pub fn transform_request(
    ctx: &TranslateContext,
    request: CreateMessageRequest,
    dialect: Dialect,
) -> GenerateContentRequest {
    let model = request.model.clone();
    let mut contents = Vec::new();
    for message in &request.messages {
        if let Some(content) = map_message(ctx.cache, &model, message) {
            contents.push(content);
        }
    }

    let tools = map_tools(request.tools.as_deref(), dialect);
    let wants_hint = tools.is_some()
        && thinking_enabled(request.thinking.as_ref())
        && signature::model_group(&model) == "claude-thinking";
    let system_instruction = map_system(request.system.as_ref(), wants_hint);

    GenerateContentRequest {
        contents,
        system_instruction,
        tools,
        tool_config: map_tool_choice(request.tool_choice.as_ref()),
        safety_settings: None,
        generation_config: map_generation_config(&request),
    }
}

fn thinking_enabled(thinking: Option<&ThinkingParam>) -> bool {
    matches!(
        thinking,
        Some(ThinkingParam::Enabled { .. }) | Some(ThinkingParam::Adaptive)
    )
}

fn map_system(system: Option<&SystemParam>, append_hint: bool) -> Option<Content> {
    let mut parts: Vec<Part> = Vec::new();
    match system {
        Some(SystemParam::Text(text)) if !text.is_empty() => parts.push(Part::text(text.clone())),
        Some(SystemParam::Blocks(blocks)) => {
            parts.extend(
                blocks
                    .iter()
                    .filter(|block| !block.text.is_empty())
                    .map(|block| Part::text(block.text.clone())),
            );
        }
        _ => {}
    }
    if append_hint {
        parts.push(Part::text(INTERLEAVED_THINKING_HINT));
    }
    if parts.is_empty() {
        None
    } else {
        Some(Content {
            role: Some(ContentRole::User),
            parts,
        })
    }
}

fn map_message(cache: &SignatureCache, model: &str, message: &MessageParam) -> Option<Content> {
    let role = match message.role {
        MessageRole::User => ContentRole::User,
        MessageRole::Assistant => ContentRole::Model,
    };
    let parts = match (&message.content, message.role) {
        (MessageContent::Text(text), _) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![Part::text(text.clone())]
            }
        }
        (MessageContent::Blocks(blocks), MessageRole::Assistant) => {
            map_assistant_blocks(cache, model, blocks)
        }
        (MessageContent::Blocks(blocks), MessageRole::User) => map_user_blocks(blocks),
    };

    // The upstream rejects contents with an empty parts array outright.
    if parts.is_empty() {
        None
    } else {
        Some(Content {
            role: Some(role),
            parts,
        })
    }
}

fn map_user_blocks(blocks: &[ContentBlockParam]) -> Vec<Part> {
    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlockParam::Text { text, .. } => {
                // Empty text parts trip the "required oneof field 'data'"
                // validator upstream.
                if !text.is_empty() {
                    parts.push(Part::text(text.clone()));
                }
            }
            ContentBlockParam::Image { source, .. } => match source {
                ImageSource::Base64 { media_type, data } => {
                    parts.push(Part::inline_data(media_type.clone(), data.clone()));
                }
                ImageSource::Url { .. } => {
                    debug!("dropping URL image block; upstream requires inline data");
                }
            },
            ContentBlockParam::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                parts.push(Part::function_response(map_tool_result(
                    tool_use_id,
                    content.as_ref(),
                )));
            }
            other => {
                debug!(block = ?std::mem::discriminant(other), "skipping block in user message");
            }
        }
    }
    parts
}

fn map_assistant_blocks(
    cache: &SignatureCache,
    model: &str,
    blocks: &[ContentBlockParam],
) -> Vec<Part> {
    let mut thinking_parts = Vec::new();
    let mut other_parts = Vec::new();
    let mut proven_signature: Option<String> = None;

    for block in blocks {
        match block {
            ContentBlockParam::Thinking {
                thinking,
                signature: client_signature,
            } => {
                match prove_signature(cache, model, thinking, client_signature.as_deref()) {
                    Some(signature) => {
                        proven_signature = Some(signature.clone());
                        thinking_parts.push(Part::thinking(thinking.clone(), signature));
                    }
                    // No downgrade to text: an assistant turn that opens with
                    // unprovable thinking must simply lose the block.
                    None => {
                        debug!("dropping thinking block without provable signature");
                    }
                }
            }
            ContentBlockParam::RedactedThinking { .. } => {
                debug!("dropping redacted thinking block");
            }
            ContentBlockParam::Text { text, .. } => {
                if !text.is_empty() {
                    other_parts.push(Part::text(text.clone()));
                }
            }
            ContentBlockParam::Image { source, .. } => {
                if let ImageSource::Base64 { media_type, data } = source {
                    other_parts.push(Part::inline_data(media_type.clone(), data.clone()));
                }
            }
            ContentBlockParam::ToolUse {
                id, name, input, ..
            } => {
                let signature = proven_signature
                    .clone()
                    .unwrap_or_else(|| SKIP_SIGNATURE_SENTINEL.to_string());
                other_parts.push(Part::function_call(
                    FunctionCall {
                        id: Some(id.clone()),
                        name: name.clone(),
                        args: Some(normalize_tool_args(input)),
                    },
                    Some(signature),
                ));
            }
            ContentBlockParam::ToolResult { .. } => {
                debug!("skipping tool_result block in assistant message");
            }
        }
    }

    // Assistant turns that carry thinking must lead with it.
    thinking_parts.extend(other_parts);
    thinking_parts
}

/// Tool arguments may arrive as an object or as a JSON-encoded string;
/// either way the upstream only accepts an object.
fn normalize_tool_args(input: &Value) -> Value {
    match input {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed @ Value::Object(_)) => parsed,
            Ok(parsed) => json!({ "value": parsed }),
            Err(err) => {
                debug!(%err, "tool_use input is not valid JSON");
                json!({ "value": raw })
            }
        },
        Value::Object(_) => input.clone(),
        other => json!({ "value": other }),
    }
}

fn map_tool_result(tool_use_id: &str, content: Option<&Value>) -> FunctionResponse {
    let name = strip_tool_call_suffix(tool_use_id).to_string();
    let response = match content {
        None | Some(Value::Null) => json!({ "response": { "result": "" } }),
        Some(Value::String(text)) => json!({ "response": { "result": text } }),
        Some(Value::Array(items)) => match items.as_slice() {
            [single] => json!({ "response": { "result": flatten_result_item(single) } }),
            _ => json!({ "response": { "result": Value::Array(items.clone()) } }),
        },
        Some(other) => json!({ "response": { "result": other.clone() } }),
    };
    FunctionResponse {
        id: Some(tool_use_id.to_string()),
        name,
        response,
    }
}

fn flatten_result_item(item: &Value) -> Value {
    match item {
        Value::Object(map) => map
            .get("text")
            .cloned()
            .unwrap_or_else(|| Value::Object(map.clone())),
        other => other.clone(),
    }
}

/// Attach a signature to a thinking block only when it can be proven: a
/// cache hit for this model group and text, or a client-supplied
/// `<modelGroup>#<sig>` whose group matches the current model.
fn prove_signature(
    cache: &SignatureCache,
    model: &str,
    thinking: &str,
    client_signature: Option<&str>,
) -> Option<String> {
    if let Some(cached) = cache.get(model, thinking)
        && cache.has_valid_signature(model, &cached)
    {
        return Some(cached);
    }
    let raw = client_signature?;
    let (group, sig) = signature::parse_wire_signature(raw)?;
    if group == signature::model_group(model) && cache.has_valid_signature(model, sig) {
        return Some(sig.to_string());
    }
    None
}

fn map_tools(tools: Option<&[ToolParam]>, dialect: Dialect) -> Option<Vec<Tool>> {
    let tools = tools?;
    let declarations: Vec<FunctionDeclaration> = tools
        .iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters_json_schema: Some(schema::clean(tool.input_schema.clone(), dialect)),
        })
        .collect();
    if declarations.is_empty() {
        return None;
    }
    Some(vec![Tool {
        function_declarations: Some(declarations),
        ..Tool::default()
    }])
}

fn map_tool_choice(choice: Option<&Value>) -> Option<Value> {
    let choice = choice?;
    let mode = choice.get("type").and_then(Value::as_str)?;
    let config = match mode {
        "auto" => json!({ "mode": "AUTO" }),
        "any" => json!({ "mode": "ANY" }),
        "none" => json!({ "mode": "NONE" }),
        "tool" => {
            let name = choice.get("name").and_then(Value::as_str)?;
            json!({ "mode": "ANY", "allowedFunctionNames": [name] })
        }
        _ => return None,
    };
    Some(json!({ "functionCallingConfig": config }))
}

fn map_generation_config(request: &CreateMessageRequest) -> Option<GenerationConfig> {
    let thinking_config = map_thinking_config(request.thinking.as_ref());
    let has_config = request.max_tokens > 0
        || request.temperature.is_some()
        || request.top_p.is_some()
        || request.top_k.is_some()
        || request.stop_sequences.is_some()
        || thinking_config.is_some();
    if !has_config {
        return None;
    }
    Some(GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        max_output_tokens: (request.max_tokens > 0).then_some(request.max_tokens),
        stop_sequences: request.stop_sequences.clone(),
        thinking_config,
        ..GenerationConfig::default()
    })
}

fn map_thinking_config(thinking: Option<&ThinkingParam>) -> Option<ThinkingConfig> {
    match thinking {
        Some(ThinkingParam::Enabled { budget_tokens }) => Some(ThinkingConfig {
            include_thoughts: Some(true),
            thinking_budget: Some(*budget_tokens),
            thinking_level: None,
        }),
        Some(ThinkingParam::Adaptive) => Some(ThinkingConfig {
            include_thoughts: Some(true),
            thinking_budget: None,
            thinking_level: Some("high".to_string()),
        }),
        Some(ThinkingParam::Disabled) | None => None,
    }
}
