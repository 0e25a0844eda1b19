use std::collections::HashMap;

use serde_json::{Value, json};
use tracing::debug;

use aiproxy_protocol::gemini::request::GenerateContentRequest;
use aiproxy_protocol::gemini::types::{
    Content, ContentRole, FunctionCall, FunctionDeclaration, FunctionResponse, GenerationConfig,
    ImageConfig, Part, ThinkingConfig, Tool,
};
use aiproxy_protocol::openai::request::ChatCompletionRequest;
use aiproxy_protocol::openai::types::{ChatContent, ChatMessage, ChatTool, ContentPart};

use crate::ids::strip_tool_call_suffix;
use crate::schema::{self, Dialect};

pub fn transform_request(request: ChatCompletionRequest) -> GenerateContentRequest {
    // First pass: tool messages reference calls by id only; the upstream
    // wants the function name back.
    let call_names: HashMap<String, String> = request
        .messages
        .iter()
        .flat_map(|message| message.tool_calls.iter().flatten())
        .map(|call| (call.id.clone(), call.function.name.clone()))
        .collect();

    let inline_system = request.messages.len() == 1;
    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                let text = content_text(message.content.as_ref());
                if text.is_empty() {
                    continue;
                }
                if inline_system {
                    contents.push(Content {
                        role: Some(ContentRole::User),
                        parts: vec![Part::text(text)],
                    });
                } else {
                    system_texts.push(text);
                }
            }
            "user" => {
                let parts = user_parts(message.content.as_ref());
                if !parts.is_empty() {
                    contents.push(Content {
                        role: Some(ContentRole::User),
                        parts,
                    });
                }
            }
            "assistant" => {
                let parts = assistant_parts(message);
                if !parts.is_empty() {
                    contents.push(Content {
                        role: Some(ContentRole::Model),
                        parts,
                    });
                }
            }
            "tool" => {
                if let Some(part) = tool_part(message, &call_names) {
                    contents.push(Content {
                        role: Some(ContentRole::User),
                        parts: vec![part],
                    });
                }
            }
            other => {
                debug!(role = other, "skipping message with unknown role");
            }
        }
    }

    let system_instruction = (!system_texts.is_empty()).then(|| Content {
        role: Some(ContentRole::User),
        parts: system_texts.into_iter().map(Part::text).collect(),
    });

    GenerateContentRequest {
        contents,
        system_instruction,
        tools: map_tools(request.tools.as_deref()),
        tool_config: None,
        safety_settings: None,
        generation_config: map_generation_config(&request),
    }
}

fn content_text(content: Option<&ChatContent>) -> String {
    match content {
        Some(ChatContent::Text(text)) => text.clone(),
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<&str>>()
            .join("\n"),
        None => String::new(),
    }
}

fn user_parts(content: Option<&ChatContent>) -> Vec<Part> {
    match content {
        Some(ChatContent::Text(text)) if !text.is_empty() => vec![Part::text(text.clone())],
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } if !text.is_empty() => Some(Part::text(text.clone())),
                ContentPart::Text { .. } => None,
                ContentPart::ImageUrl { image_url } => match parse_data_url(&image_url.url) {
                    Some((mime_type, data)) => Some(Part::inline_data(mime_type, data)),
                    None => {
                        debug!("dropping image part that is not a data URL");
                        None
                    }
                },
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// `data:<mime>;base64,<payload>` → (mime, payload).
fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (mime_type, data) = rest.split_once(";base64,")?;
    if mime_type.is_empty() || data.is_empty() {
        return None;
    }
    Some((mime_type.to_string(), data.to_string()))
}

fn assistant_parts(message: &ChatMessage) -> Vec<Part> {
    let mut parts = Vec::new();
    let text = content_text(message.content.as_ref());
    if !text.is_empty() {
        parts.push(Part::text(text));
    }
    for call in message.tool_calls.iter().flatten() {
        let args = match serde_json::from_str::<Value>(&call.function.arguments) {
            Ok(parsed @ Value::Object(_)) => parsed,
            Ok(parsed) => json!({ "value": parsed }),
            Err(_) => json!({}),
        };
        parts.push(Part::function_call(
            FunctionCall {
                id: Some(call.id.clone()),
                name: call.function.name.clone(),
                args: Some(args),
            },
            None,
        ));
    }
    parts
}

fn tool_part(message: &ChatMessage, call_names: &HashMap<String, String>) -> Option<Part> {
    let call_id = message.tool_call_id.as_deref()?;
    let name = call_names
        .get(call_id)
        .cloned()
        .unwrap_or_else(|| strip_tool_call_suffix(call_id).to_string());
    let result = content_text(message.content.as_ref());
    Some(Part::function_response(FunctionResponse {
        id: Some(call_id.to_string()),
        name,
        response: json!({ "response": { "result": result } }),
    }))
}

fn map_tools(tools: Option<&[ChatTool]>) -> Option<Vec<Tool>> {
    let tools = tools?;
    let mut output: Vec<Tool> = Vec::new();
    let mut declarations: Vec<FunctionDeclaration> = Vec::new();

    for tool in tools {
        match tool.r#type.as_str() {
            "function" => {
                let Some(function) = &tool.function else {
                    continue;
                };
                declarations.push(FunctionDeclaration {
                    name: function.name.clone(),
                    description: function.description.clone(),
                    parameters_json_schema: function
                        .parameters
                        .clone()
                        .map(|schema| schema::clean(schema, Dialect::Gemini)),
                });
            }
            "google_search" => output.push(Tool {
                google_search: Some(json!({})),
                ..Tool::default()
            }),
            "code_execution" => output.push(Tool {
                code_execution: Some(json!({})),
                ..Tool::default()
            }),
            "url_context" => output.push(Tool {
                url_context: Some(json!({})),
                ..Tool::default()
            }),
            other => {
                debug!(tool = other, "skipping unsupported tool type");
            }
        }
    }

    if !declarations.is_empty() {
        output.push(Tool {
            function_declarations: Some(declarations),
            ..Tool::default()
        });
    }
    (!output.is_empty()).then_some(output)
}

fn map_generation_config(request: &ChatCompletionRequest) -> Option<GenerationConfig> {
    let max_output_tokens = request.max_completion_tokens.or(request.max_tokens);
    let stop_sequences = request.stop.as_ref().and_then(|stop| match stop {
        Value::String(single) => Some(vec![single.clone()]),
        Value::Array(values) => Some(
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    });
    let thinking_config = map_reasoning_effort(request.reasoning_effort.as_deref());
    let response_modalities = request.modalities.as_ref().map(|modalities| {
        modalities
            .iter()
            .map(|modality| modality.to_ascii_uppercase())
            .collect()
    });
    let image_config = request
        .image_config
        .as_ref()
        .and_then(|config| config.aspect_ratio.clone())
        .map(|aspect_ratio| ImageConfig {
            aspect_ratio: Some(aspect_ratio),
        });

    let has_config = request.temperature.is_some()
        || request.top_p.is_some()
        || max_output_tokens.is_some()
        || stop_sequences.is_some()
        || thinking_config.is_some()
        || response_modalities.is_some()
        || image_config.is_some();
    if !has_config {
        return None;
    }
    Some(GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens,
        stop_sequences,
        thinking_config,
        response_modalities,
        image_config,
        ..GenerationConfig::default()
    })
}

fn map_reasoning_effort(effort: Option<&str>) -> Option<ThinkingConfig> {
    match effort? {
        "auto" => Some(ThinkingConfig {
            include_thoughts: Some(true),
            thinking_budget: Some(-1),
            thinking_level: None,
        }),
        "none" => Some(ThinkingConfig {
            include_thoughts: Some(false),
            thinking_budget: Some(0),
            thinking_level: None,
        }),
        level @ ("low" | "medium" | "high") => Some(ThinkingConfig {
            include_thoughts: Some(true),
            thinking_budget: None,
            thinking_level: Some(level.to_string()),
        }),
        other => {
            debug!(effort = other, "ignoring unknown reasoning_effort");
            None
        }
    }
}
