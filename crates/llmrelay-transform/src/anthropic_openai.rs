//! Anthropic Messages ↔ OpenAI Chat translation.
//!
//! The translator's four named entry points otherwise only cover OpenAI ↔
//! Gemini; this pair is the one addition unified-gateway mode needs (a
//! `claude` platform request must be able to fall back to an OpenAI-shaped
//! gateway upstream, then have the response translated back to Anthropic
//! shape for the client). Same pure-function, no-I/O discipline as
//! `openai_gemini`.

use bytes::Bytes;
use llmrelay_protocol::anthropic::{
    ContentBlock, CreateMessageRequest, CreateMessageResponse, Message, MessageContent, Role,
    SystemPrompt, Usage as AnthropicUsage,
};
use llmrelay_protocol::openai_chat::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, FunctionCall as OpenAiFunctionCall,
    ToolCall,
};
use llmrelay_protocol::sse::render_data_frame;

use crate::errors::TransformError;

/// Anthropic Messages request → OpenAI chat request. `system` (string or
/// block form) becomes the first OpenAI message with `role: "system"`.
pub fn anthropic_request_to_openai(req: &CreateMessageRequest) -> Result<ChatCompletionRequest, TransformError> {
    let mut messages = Vec::new();

    if let Some(system) = &req.system {
        let text = match system {
            SystemPrompt::Text(s) => s.clone(),
            SystemPrompt::Blocks(blocks) => blocks.iter().map(|b| b.text.as_str()).collect::<Vec<_>>().join("\n"),
        };
        if !text.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: Some(serde_json::Value::String(text)),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            });
        }
    }

    for message in &req.messages {
        messages.extend(anthropic_message_to_openai_messages(message));
    }

    Ok(ChatCompletionRequest {
        model: req.model.clone(),
        messages,
        stream: req.stream,
        temperature: req.temperature,
        top_p: None,
        max_tokens: req.max_tokens,
        tools: None,
        extra: Default::default(),
    })
}

/// Expands a single Anthropic message into one or more OpenAI messages,
/// splitting `tool_result` content blocks (which Anthropic keeps inline in a
/// `user` message) into their own `role: "tool"` OpenAI messages.
pub fn anthropic_message_to_openai_messages(message: &Message) -> Vec<ChatMessage> {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    let blocks = match &message.content {
        MessageContent::Text(text) => {
            return vec![ChatMessage {
                role: role.to_string(),
                content: Some(serde_json::Value::String(text.clone())),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            }];
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut out = Vec::new();
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                kind: "function".to_string(),
                function: OpenAiFunctionCall { name: name.clone(), arguments: input.to_string() },
            }),
            ContentBlock::ToolResult { tool_use_id, content } => {
                out.push(ChatMessage {
                    role: "tool".to_string(),
                    content: content.clone(),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                    name: None,
                });
            }
        }
    }

    if !text.is_empty() || !tool_calls.is_empty() {
        out.insert(
            0,
            ChatMessage {
                role: role.to_string(),
                content: if text.is_empty() { None } else { Some(serde_json::Value::String(text)) },
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                tool_call_id: None,
                name: None,
            },
        );
    }

    out
}

/// OpenAI chat response → Anthropic Messages response.
pub fn openai_response_to_anthropic(resp: &ChatCompletionResponse, id: &str) -> CreateMessageResponse {
    let choice = resp.choices.first();
    let mut content = Vec::new();
    if let Some(choice) = choice {
        if let Some(serde_json::Value::String(text)) = &choice.message.content {
            if !text.is_empty() {
                content.push(ContentBlock::Text { text: text.clone() });
            }
        }
        if let Some(tool_calls) = &choice.message.tool_calls {
            for call in tool_calls {
                let input = serde_json::from_str(&call.function.arguments).unwrap_or(serde_json::Value::Null);
                content.push(ContentBlock::ToolUse { id: call.id.clone(), name: call.function.name.clone(), input });
            }
        }
    }

    let stop_reason = choice.and_then(|c| c.finish_reason.as_deref()).map(map_openai_finish_reason_to_anthropic);

    CreateMessageResponse {
        id: id.to_string(),
        role: Role::Assistant,
        content,
        stop_reason,
        usage: AnthropicUsage {
            input_tokens: resp.usage.prompt_tokens,
            output_tokens: resp.usage.completion_tokens,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: resp.usage.prompt_tokens_details.as_ref().map(|d| d.cached_tokens).unwrap_or(0),
        },
        extra: Default::default(),
    }
}

fn map_openai_finish_reason_to_anthropic(reason: &str) -> String {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        "content_filter" => "stop_sequence",
        other => return other.to_string(),
    }
    .to_string()
}

/// Simulates the Anthropic SSE event sequence for a complete response, used
/// when unified-gateway mode returns non-streaming OpenAI shape but the
/// original client asked the `claude` platform endpoint for a stream.
pub fn simulate_anthropic_stream(resp: &CreateMessageResponse) -> Vec<Bytes> {
    let mut frames = Vec::new();

    let message_start = serde_json::json!({
        "type": "message_start",
        "message": {
            "id": resp.id,
            "role": "assistant",
            "content": [],
            "usage": resp.usage,
        }
    });
    frames.push(render_data_frame(&message_start.to_string()));

    for (index, block) in resp.content.iter().enumerate() {
        let start = serde_json::json!({
            "type": "content_block_start",
            "index": index,
            "content_block": block,
        });
        frames.push(render_data_frame(&start.to_string()));

        if let ContentBlock::Text { text } = block {
            let delta = serde_json::json!({
                "type": "content_block_delta",
                "index": index,
                "delta": { "type": "text_delta", "text": text },
            });
            frames.push(render_data_frame(&delta.to_string()));
        }

        let stop = serde_json::json!({ "type": "content_block_stop", "index": index });
        frames.push(render_data_frame(&stop.to_string()));
    }

    let message_delta = serde_json::json!({
        "type": "message_delta",
        "delta": { "stop_reason": resp.stop_reason },
        "usage": resp.usage,
    });
    frames.push(render_data_frame(&message_delta.to_string()));
    frames.push(render_data_frame(&serde_json::json!({ "type": "message_stop" }).to_string()));

    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmrelay_protocol::anthropic::Usage;

    #[test]
    fn system_prompt_becomes_first_openai_message() {
        let req = CreateMessageRequest {
            model: "claude-sonnet-4".to_string(),
            messages: vec![Message { role: Role::User, content: MessageContent::Text("hi".to_string()) }],
            system: Some(SystemPrompt::Text("be terse".to_string())),
            stream: false,
            max_tokens: Some(100),
            temperature: None,
            tools: None,
            extra: Default::default(),
        };
        let openai = anthropic_request_to_openai(&req).unwrap();
        assert_eq!(openai.messages[0].role, "system");
        assert_eq!(openai.messages[1].role, "user");
    }

    #[test]
    fn tool_use_block_becomes_openai_tool_call() {
        let req = CreateMessageRequest {
            model: "claude-sonnet-4".to_string(),
            messages: vec![Message {
                role: Role::Assistant,
                content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "get_weather".to_string(),
                    input: serde_json::json!({"city": "nyc"}),
                }]),
            }],
            system: None,
            stream: false,
            max_tokens: None,
            temperature: None,
            tools: None,
            extra: Default::default(),
        };
        let openai = anthropic_request_to_openai(&req).unwrap();
        let call = &openai.messages[0].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.function.name, "get_weather");
    }

    #[test]
    fn tool_result_expands_into_its_own_tool_message() {
        let message = Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_1".to_string(),
                content: Some(serde_json::json!("72F")),
            }]),
        };
        let expanded = anthropic_message_to_openai_messages(&message);
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].role, "tool");
        assert_eq!(expanded[0].tool_call_id.as_deref(), Some("toolu_1"));
    }

    #[test]
    fn openai_response_maps_finish_reason_and_usage() {
        let openai = ChatCompletionResponse {
            id: "chatcmpl-1".to_string(),
            model: "gpt-4o".to_string(),
            choices: vec![llmrelay_protocol::openai_chat::Choice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: Some(serde_json::Value::String("hi".to_string())),
                    tool_calls: None,
                    tool_call_id: None,
                    name: None,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: llmrelay_protocol::openai_chat::Usage {
                prompt_tokens: 5,
                completion_tokens: 2,
                total_tokens: 7,
                ..Default::default()
            },
            extra: Default::default(),
        };
        let anthropic = openai_response_to_anthropic(&openai, "msg_1");
        assert_eq!(anthropic.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(anthropic.usage.input_tokens, 5);
        assert_eq!(anthropic.usage.output_tokens, 2);
    }

    #[test]
    fn stream_simulation_emits_message_start_and_stop() {
        let resp = CreateMessageResponse {
            id: "msg_1".to_string(),
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: "hi".to_string() }],
            stop_reason: Some("end_turn".to_string()),
            usage: Usage { input_tokens: 1, output_tokens: 1, ..Default::default() },
            extra: Default::default(),
        };
        let frames = simulate_anthropic_stream(&resp);
        let first = std::str::from_utf8(&frames[0]).unwrap();
        let last = std::str::from_utf8(frames.last().unwrap()).unwrap();
        assert!(first.contains("message_start"));
        assert!(last.contains("message_stop"));
    }
}
