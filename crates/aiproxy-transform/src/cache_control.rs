use aiproxy_protocol::claude::request::CreateMessageRequest;
use aiproxy_protocol::claude::types::{
    CacheControl, ContentBlockParam, MessageContent, MessageRole, SystemBlock, SystemParam,
};

/// Stamp `cache_control: ephemeral` at the Anthropic prompt-caching
/// breakpoints: last tool, last system block, and the second-to-last user
/// message's final content part. Each breakpoint is independent and existing
/// stamps are never overwritten, so a request never ends up with more than
/// four markers.
pub fn inject(request: &mut CreateMessageRequest) {
    stamp_tools(request);
    stamp_system(request);
    stamp_messages(request);
}

fn stamp_tools(request: &mut CreateMessageRequest) {
    if let Some(tools) = request.tools.as_mut()
        && let Some(last) = tools.last_mut()
        && last.cache_control.is_none()
    {
        last.cache_control = Some(CacheControl::ephemeral());
    }
}

fn stamp_system(request: &mut CreateMessageRequest) {
    let system = match request.system.take() {
        Some(SystemParam::Text(text)) => {
            // A string system prompt has nowhere to carry the marker; promote
            // it to the one-element block form first.
            let mut block = SystemBlock::text(text);
            block.cache_control = Some(CacheControl::ephemeral());
            Some(SystemParam::Blocks(vec![block]))
        }
        Some(SystemParam::Blocks(mut blocks)) => {
            if let Some(last) = blocks.last_mut()
                && last.cache_control.is_none()
            {
                last.cache_control = Some(CacheControl::ephemeral());
            }
            Some(SystemParam::Blocks(blocks))
        }
        None => None,
    };
    request.system = system;
}

fn stamp_messages(request: &mut CreateMessageRequest) {
    let user_indices: Vec<usize> = request
        .messages
        .iter()
        .enumerate()
        .filter(|(_, message)| message.role == MessageRole::User)
        .map(|(index, _)| index)
        .collect();
    // Single-turn requests have no stable prefix worth caching yet.
    if user_indices.len() < 2 {
        return;
    }
    let target = user_indices[user_indices.len() - 2];

    if request.messages[target..]
        .iter()
        .any(|message| message_has_cache_control(&message.content))
    {
        return;
    }

    let content = &mut request.messages[target].content;
    if let MessageContent::Text(text) = content {
        *content = MessageContent::Blocks(vec![ContentBlockParam::Text {
            text: std::mem::take(text),
            cache_control: None,
        }]);
    }
    if let MessageContent::Blocks(blocks) = content
        && let Some(last) = blocks.last_mut()
    {
        last.set_cache_control(CacheControl::ephemeral());
    }
}

fn message_has_cache_control(content: &MessageContent) -> bool {
    match content {
        MessageContent::Text(_) => false,
        MessageContent::Blocks(blocks) => blocks.iter().any(ContentBlockParam::has_cache_control),
    }
}

#[cfg(test)]
mod tests {
    use aiproxy_protocol::claude::types::{MessageParam, ToolParam};

    use super::*;

    fn user(text: &str) -> MessageParam {
        MessageParam {
            role: MessageRole::User,
            content: MessageContent::Text(text.to_string()),
        }
    }

    fn assistant(text: &str) -> MessageParam {
        MessageParam {
            role: MessageRole::Assistant,
            content: MessageContent::Text(text.to_string()),
        }
    }

    fn tool(name: &str) -> ToolParam {
        ToolParam {
            name: name.to_string(),
            description: None,
            input_schema: serde_json::json!({"type": "object"}),
            cache_control: None,
        }
    }

    fn request(messages: Vec<MessageParam>) -> CreateMessageRequest {
        CreateMessageRequest {
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 1024,
            messages,
            system: None,
            tools: None,
            tool_choice: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            thinking: None,
            stream: None,
            metadata: None,
        }
    }

    #[test]
    fn stamps_all_three_breakpoints() {
        let mut req = request(vec![
            user("turn 1"),
            assistant("answer 1"),
            user("turn 2"),
            assistant("answer 2"),
            user("turn 3"),
        ]);
        req.tools = Some(vec![tool("a"), tool("b")]);
        req.system = Some(SystemParam::Blocks(vec![
            SystemBlock::text("first"),
            SystemBlock::text("second"),
        ]));

        inject(&mut req);

        let tools = req.tools.as_ref().unwrap();
        assert!(tools[0].cache_control.is_none());
        assert!(tools[1].cache_control.is_some());

        let Some(SystemParam::Blocks(system)) = &req.system else {
            panic!("system should stay in block form");
        };
        assert!(system[0].cache_control.is_none());
        assert!(system[1].cache_control.is_some());

        // Second-to-last user message is index 2; its sole part is stamped.
        let MessageContent::Blocks(blocks) = &req.messages[2].content else {
            panic!("target user content should be promoted to blocks");
        };
        assert!(blocks[0].has_cache_control());
        let stamped: usize = req
            .messages
            .iter()
            .map(|message| match &message.content {
                MessageContent::Text(_) => 0,
                MessageContent::Blocks(blocks) => blocks
                    .iter()
                    .filter(|block| block.has_cache_control())
                    .count(),
            })
            .sum();
        assert_eq!(stamped, 1);
    }

    #[test]
    fn string_system_is_promoted_and_stamped() {
        let mut req = request(vec![user("hi")]);
        req.system = Some(SystemParam::Text("be terse".to_string()));
        inject(&mut req);
        let Some(SystemParam::Blocks(blocks)) = &req.system else {
            panic!("system should be promoted");
        };
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text, "be terse");
        assert!(blocks[0].cache_control.is_some());
    }

    #[test]
    fn existing_stamps_are_preserved() {
        let mut req = request(vec![user("a"), assistant("b"), user("c")]);
        let mut stamped_tool = tool("t");
        stamped_tool.cache_control = Some(CacheControl {
            r#type: "ephemeral".to_string(),
            ttl: Some("1h".to_string()),
        });
        req.tools = Some(vec![stamped_tool]);
        inject(&mut req);
        assert_eq!(
            req.tools.as_ref().unwrap()[0]
                .cache_control
                .as_ref()
                .unwrap()
                .ttl
                .as_deref(),
            Some("1h")
        );
    }

    #[test]
    fn downstream_stamp_suppresses_message_breakpoint() {
        let mut req = request(vec![
            user("a"),
            assistant("b"),
            user("c"),
            assistant("d"),
            MessageParam {
                role: MessageRole::User,
                content: MessageContent::Blocks(vec![ContentBlockParam::Text {
                    text: "e".to_string(),
                    cache_control: Some(CacheControl::ephemeral()),
                }]),
            },
        ]);
        inject(&mut req);
        // Index 2 (second-to-last user) must stay untouched.
        assert!(matches!(&req.messages[2].content, MessageContent::Text(_)));
    }
}
