//! Translation between the OpenAI chat-completions wire shape (what this
//! gateway exposes to callers) and the Anthropic Messages wire shape (what
//! `v1-messages` custom providers speak). Grounded in the original
//! implementation's `_convert_to_anthropic_messages` and its response-side
//! counterpart.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod openai {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ChatCompletionRequest {
        pub model: String,
        pub messages: Vec<ChatMessage>,
        #[serde(default)]
        pub stream: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tools: Option<Vec<Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tool_choice: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub temperature: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub max_tokens: Option<u32>,
        #[serde(flatten)]
        pub extra: serde_json::Map<String, Value>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ChatMessage {
        pub role: String,
        #[serde(default)]
        pub content: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tool_calls: Option<Vec<ToolCall>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tool_call_id: Option<String>,
    }

    impl ChatMessage {
        pub fn text(&self) -> String {
            match &self.content {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(parts)) => parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join(""),
                _ => String::new(),
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ToolCall {
        pub id: String,
        #[serde(default = "function_type")]
        #[serde(rename = "type")]
        pub kind: String,
        pub function: FunctionCall,
    }

    fn function_type() -> String {
        "function".to_string()
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FunctionCall {
        pub name: String,
        /// JSON-encoded arguments, as OpenAI's wire format requires.
        pub arguments: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ChatCompletionResponse {
        pub id: String,
        pub object: String,
        #[serde(default)]
        pub created: u64,
        pub model: String,
        pub choices: Vec<Choice>,
        #[serde(default)]
        pub usage: Option<Usage>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Choice {
        pub index: u32,
        pub message: ChatMessage,
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
    pub struct Usage {
        #[serde(default)]
        pub prompt_tokens: u32,
        #[serde(default)]
        pub completion_tokens: u32,
        #[serde(default)]
        pub total_tokens: u32,
    }
}

pub mod anthropic {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MessagesRequest {
        pub model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub system: Option<String>,
        pub messages: Vec<AnthropicMessage>,
        #[serde(default)]
        pub stream: bool,
        pub max_tokens: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tools: Option<Vec<Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tool_choice: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub temperature: Option<f64>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AnthropicMessage {
        pub role: String,
        pub content: Vec<ContentBlock>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum ContentBlock {
        Text {
            text: String,
        },
        ToolUse {
            id: String,
            name: String,
            input: Value,
        },
        ToolResult {
            tool_use_id: String,
            content: String,
        },
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MessagesResponse {
        pub id: String,
        pub role: String,
        pub model: String,
        pub content: Vec<ContentBlock>,
        #[serde(default)]
        pub stop_reason: Option<String>,
        #[serde(default)]
        pub usage: Option<AnthropicUsage>,
    }

    #[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
    pub struct AnthropicUsage {
        #[serde(default)]
        pub input_tokens: u32,
        #[serde(default)]
        pub output_tokens: u32,
    }
}

/// Converts an OpenAI-shaped chat request into the Anthropic Messages shape.
///
/// - All `system` messages are concatenated (newline-joined) into the
///   top-level `system` field; Anthropic has no in-body system role.
/// - Consecutive messages of the same non-tool role are merged into one
///   Anthropic message, since the Messages API requires strict user/assistant
///   alternation.
/// - Assistant `tool_calls` become `tool_use` content blocks; malformed JSON
///   arguments decode to an empty object rather than failing the request.
/// - `tool` role messages are buffered and flushed as `tool_result` blocks the
///   moment a non-tool message is encountered: the buffer merges into the
///   preceding Anthropic message if that message's role is already `user`,
///   otherwise it becomes a new `user` message of its own. The message that
///   follows the flush then applies the ordinary consecutive-user merge
///   check against whatever the flush just left at the tail, so a flushed
///   tool-result turn and an immediately following `user` text turn can
///   collapse into one message.
pub fn chat_to_anthropic(req: &openai::ChatCompletionRequest) -> anthropic::MessagesRequest {
    use anthropic::{AnthropicMessage, ContentBlock};

    let mut system_parts = Vec::new();
    let mut messages: Vec<AnthropicMessage> = Vec::new();
    let mut tool_result_buffer: Vec<ContentBlock> = Vec::new();

    let flush_tool_buffer = |buf: &mut Vec<ContentBlock>, out: &mut Vec<AnthropicMessage>| {
        if buf.is_empty() {
            return;
        }
        if let Some(last) = out.last_mut() {
            if last.role == "user" {
                last.content.append(buf);
                return;
            }
        }
        out.push(AnthropicMessage {
            role: "user".to_string(),
            content: std::mem::take(buf),
        });
    };

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" => {
                let text = msg.text();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "tool" => {
                let tool_use_id = msg.tool_call_id.clone().unwrap_or_default();
                tool_result_buffer.push(ContentBlock::ToolResult {
                    tool_use_id,
                    content: msg.text(),
                });
            }
            "user" => {
                flush_tool_buffer(&mut tool_result_buffer, &mut messages);
                let block = ContentBlock::Text { text: msg.text() };
                if matches!(messages.last(), Some(m) if m.role == "user") {
                    messages.last_mut().unwrap().content.push(block);
                } else {
                    messages.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: vec![block],
                    });
                }
            }
            "assistant" => {
                flush_tool_buffer(&mut tool_result_buffer, &mut messages);
                let mut content = Vec::new();
                let text = msg.text();
                if !text.is_empty() {
                    content.push(ContentBlock::Text { text });
                }
                for call in msg.tool_calls.iter().flatten() {
                    let input = serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| Value::Object(Default::default()));
                    content.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input,
                    });
                }
                messages.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content,
                });
            }
            other => {
                tracing::warn!(role = other, "dropping message with unknown role");
            }
        }
    }
    flush_tool_buffer(&mut tool_result_buffer, &mut messages);

    anthropic::MessagesRequest {
        model: req.model.clone(),
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        },
        messages,
        stream: req.stream,
        max_tokens: req.max_tokens.unwrap_or(4096),
        tools: req.tools.as_ref().map(|tools| {
            tools.iter().map(tool_to_anthropic).collect()
        }),
        tool_choice: req.tool_choice.as_ref().and_then(tool_choice_to_anthropic),
        temperature: req.temperature,
    }
}

/// `{type:"function", function:{name, description, parameters}}` ->
/// `{name, description, input_schema: parameters}`. Passed through unchanged
/// if it doesn't match the expected OpenAI tool shape.
fn tool_to_anthropic(tool: &Value) -> Value {
    let Some(function) = tool.get("function") else {
        return tool.clone();
    };
    let mut out = serde_json::Map::new();
    if let Some(name) = function.get("name") {
        out.insert("name".to_string(), name.clone());
    }
    if let Some(description) = function.get("description") {
        out.insert("description".to_string(), description.clone());
    }
    out.insert(
        "input_schema".to_string(),
        function
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default())),
    );
    Value::Object(out)
}

/// `"auto"` -> `{type:"auto"}`; `{type:"function", function:{name}}` ->
/// `{type:"tool", name}`; `"none"` -> omit entirely (`None`).
fn tool_choice_to_anthropic(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(s) if s == "auto" => Some(serde_json::json!({"type": "auto"})),
        Value::String(s) if s == "none" => None,
        Value::Object(_) => {
            let name = choice.get("function").and_then(|f| f.get("name"));
            match name {
                Some(name) => Some(serde_json::json!({"type": "tool", "name": name})),
                None => Some(choice.clone()),
            }
        }
        other => Some(other.clone()),
    }
}

/// Converts an Anthropic Messages response back into the OpenAI shape, for
/// non-streaming calls against `v1-messages` providers.
pub fn anthropic_response_to_chat(
    resp: &anthropic::MessagesResponse,
) -> openai::ChatCompletionResponse {
    use anthropic::ContentBlock;
    use openai::{ChatCompletionResponse, ChatMessage, Choice, FunctionCall, ToolCall, Usage};

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in &resp.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall {
                    id: id.clone(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: name.clone(),
                        arguments: serde_json::to_string(input).unwrap_or_default(),
                    },
                });
            }
            ContentBlock::ToolResult { .. } => {}
        }
    }

    let message = ChatMessage {
        role: "assistant".to_string(),
        content: if text.is_empty() {
            None
        } else {
            Some(Value::String(text))
        },
        name: None,
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        tool_call_id: None,
    };

    let usage = resp.usage.map(|u| Usage {
        prompt_tokens: u.input_tokens,
        completion_tokens: u.output_tokens,
        total_tokens: u.input_tokens + u.output_tokens,
    });

    ChatCompletionResponse {
        id: resp.id.clone(),
        object: "chat.completion".to_string(),
        created: now_unix_seconds(),
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: resp.stop_reason.clone(),
        }],
        usage,
    }
}

fn now_unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use openai::{ChatCompletionRequest, ChatMessage, FunctionCall, ToolCall};

    fn msg(role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: Some(Value::String(content.to_string())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[test]
    fn concatenates_system_messages() {
        let req = ChatCompletionRequest {
            model: "gpt-4".to_string(),
            messages: vec![msg("system", "be helpful"), msg("user", "hi")],
            stream: false,
            tools: None,
            tool_choice: None,
            temperature: None,
            max_tokens: None,
            extra: Default::default(),
        };
        let out = chat_to_anthropic(&req);
        assert_eq!(out.system.as_deref(), Some("be helpful"));
        assert_eq!(out.messages.len(), 1);
    }

    #[test]
    fn merges_consecutive_user_messages() {
        let req = ChatCompletionRequest {
            model: "gpt-4".to_string(),
            messages: vec![msg("user", "a"), msg("user", "b")],
            stream: false,
            tools: None,
            tool_choice: None,
            temperature: None,
            max_tokens: None,
            extra: Default::default(),
        };
        let out = chat_to_anthropic(&req);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].content.len(), 2);
    }

    #[test]
    fn translates_tool_definitions_and_auto_choice() {
        let req = ChatCompletionRequest {
            model: "gpt-4".to_string(),
            messages: vec![msg("user", "what's the weather")],
            stream: false,
            tools: Some(vec![serde_json::json!({
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "Look up current weather",
                    "parameters": {"type": "object", "properties": {}},
                },
            })]),
            tool_choice: Some(Value::String("auto".to_string())),
            temperature: None,
            max_tokens: None,
            extra: Default::default(),
        };
        let out = chat_to_anthropic(&req);
        let tools = out.tools.unwrap();
        assert_eq!(tools[0]["name"], "get_weather");
        assert_eq!(tools[0]["description"], "Look up current weather");
        assert_eq!(tools[0]["input_schema"]["type"], "object");
        assert_eq!(out.tool_choice.unwrap(), serde_json::json!({"type": "auto"}));
    }

    #[test]
    fn translates_forced_function_choice_and_drops_none() {
        let forced = tool_choice_to_anthropic(&serde_json::json!({
            "type": "function",
            "function": {"name": "get_weather"},
        }));
        assert_eq!(forced, Some(serde_json::json!({"type": "tool", "name": "get_weather"})));

        let none = tool_choice_to_anthropic(&Value::String("none".to_string()));
        assert_eq!(none, None);
    }

    #[test]
    fn tool_call_with_malformed_arguments_becomes_empty_object() {
        let mut assistant = msg("assistant", "");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "call_1".to_string(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: "lookup".to_string(),
                arguments: "{not json".to_string(),
            },
        }]);
        let req = ChatCompletionRequest {
            model: "gpt-4".to_string(),
            messages: vec![msg("user", "hi"), assistant],
            stream: false,
            tools: None,
            tool_choice: None,
            temperature: None,
            max_tokens: None,
            extra: Default::default(),
        };
        let out = chat_to_anthropic(&req);
        let anthropic::ContentBlock::ToolUse { input, .. } = &out.messages[1].content[0] else {
            panic!("expected tool_use block");
        };
        assert_eq!(*input, Value::Object(Default::default()));
    }

    #[test]
    fn tool_messages_flushed_into_preceding_user_message() {
        // Tool results that follow a `user` text turn with nothing assistant
        // in between merge into that same turn, and a subsequent `user`
        // message merges right along with it (matching the original's
        // `flush_tool_buffer` checking `anthropic_messages[-1]["role"]`).
        let mut tool_msg_1 = msg("tool", "result one");
        tool_msg_1.tool_call_id = Some("call_1".to_string());
        let mut tool_msg_2 = msg("tool", "result two");
        tool_msg_2.tool_call_id = Some("call_2".to_string());

        let req = ChatCompletionRequest {
            model: "gpt-4".to_string(),
            messages: vec![
                msg("user", "run tools"),
                tool_msg_1,
                tool_msg_2,
                msg("user", "thanks"),
            ],
            stream: false,
            tools: None,
            tool_choice: None,
            temperature: None,
            max_tokens: None,
            extra: Default::default(),
        };
        let out = chat_to_anthropic(&req);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].role, "user");
        assert_eq!(out.messages[0].content.len(), 4);
    }

    #[test]
    fn tool_messages_after_assistant_become_their_own_user_turn() {
        // A tool-result flush whose preceding message is `assistant` (not
        // `user`) starts a fresh user message rather than merging.
        let mut assistant = msg("assistant", "");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "t1".to_string(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: "f".to_string(),
                arguments: "{\"x\":1}".to_string(),
            },
        }]);
        let mut tool_msg = msg("tool", "42");
        tool_msg.tool_call_id = Some("t1".to_string());

        let req = ChatCompletionRequest {
            model: "gpt-4".to_string(),
            messages: vec![msg("system", "S"), msg("user", "u1"), assistant, tool_msg],
            stream: false,
            tools: None,
            tool_choice: None,
            temperature: None,
            max_tokens: None,
            extra: Default::default(),
        };
        let out = chat_to_anthropic(&req);
        assert_eq!(out.system.as_deref(), Some("S"));
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[0].role, "user");
        assert_eq!(out.messages[1].role, "assistant");
        assert_eq!(out.messages[2].role, "user");
        let anthropic::ContentBlock::ToolResult { tool_use_id, content } = &out.messages[2].content[0]
        else {
            panic!("expected tool_result block");
        };
        assert_eq!(tool_use_id, "t1");
        assert_eq!(content, "42");
    }
}
