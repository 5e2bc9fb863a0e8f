//! The single OpenAI ↔ Gemini translator: four entry points (request
//! forward, request backward, response forward, response backward) plus one
//! streaming-chunk forward conversion, all sharing the same role and
//! finish-reason mapping so the two directions can't drift apart.
//!
//! "Forward" is OpenAI → Gemini (the direction a `gemini-cli` provider
//! needs when the client spoke OpenAI chat); "backward" is Gemini → OpenAI
//! (the direction unified-gateway mode needs when a Gemini-native client is
//! re-homed to an OpenAI-compatible gateway).

use bytes::Bytes;
use llmrelay_protocol::gemini::{
    Candidate, Content, FunctionCall as GeminiFunctionCall, FunctionDeclaration,
    FunctionResponse, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part,
    ToolDeclaration, UsageMetadata,
};
use llmrelay_protocol::openai_chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatTool,
    Choice, ChunkChoice, ChunkDelta, FunctionCall as OpenAiFunctionCall, FunctionDef, ToolCall,
    Usage as OpenAiUsage,
};
use llmrelay_protocol::sse::render_data_frame;

use crate::errors::TransformError;

/// `req fwd`: OpenAI chat request → Gemini `generateContent` request.
pub fn openai_request_to_gemini(req: &ChatCompletionRequest) -> Result<GenerateContentRequest, TransformError> {
    let mut contents = Vec::new();
    let mut system_parts = Vec::new();

    for message in &req.messages {
        match message.role.as_str() {
            "system" => {
                if let Some(text) = message_text(message) {
                    system_parts.push(Part::text(text));
                }
            }
            "tool" => {
                let name = message.name.clone().unwrap_or_else(|| "function".to_string());
                let response = tool_content_to_value(message)?;
                contents.push(Content {
                    role: Some("user".to_string()),
                    parts: vec![Part {
                        text: None,
                        function_call: None,
                        function_response: Some(FunctionResponse { name, response }),
                        inline_data: None,
                    }],
                });
            }
            role => {
                let gemini_role = if role == "assistant" { "model" } else { "user" };
                let mut parts = Vec::new();
                if let Some(text) = message_text(message) {
                    parts.push(Part::text(text));
                }
                if let Some(tool_calls) = &message.tool_calls {
                    for call in tool_calls {
                        let args = serde_json::from_str(&call.function.arguments)
                            .map_err(|e| TransformError::MalformedToolArguments(e.to_string()))?;
                        parts.push(Part {
                            text: None,
                            function_call: Some(GeminiFunctionCall { name: call.function.name.clone(), args }),
                            function_response: None,
                            inline_data: None,
                        });
                    }
                }
                if !parts.is_empty() {
                    contents.push(Content { role: Some(gemini_role.to_string()), parts });
                }
            }
        }
    }

    let system_instruction = if system_parts.is_empty() {
        None
    } else {
        Some(Content { role: None, parts: system_parts })
    };

    let tools = req.tools.as_ref().map(|tools| {
        vec![ToolDeclaration {
            function_declarations: tools.iter().map(openai_tool_to_gemini_declaration).collect(),
        }]
    });

    let generation_config = if req.temperature.is_some() || req.max_tokens.is_some() || req.top_p.is_some() {
        Some(GenerationConfig {
            temperature: req.temperature,
            max_output_tokens: req.max_tokens,
            top_p: req.top_p,
        })
    } else {
        None
    };

    Ok(GenerateContentRequest { contents, system_instruction, tools, generation_config })
}

fn openai_tool_to_gemini_declaration(tool: &ChatTool) -> FunctionDeclaration {
    FunctionDeclaration {
        name: tool.function.name.clone(),
        description: tool.function.description.clone(),
        parameters: tool.function.parameters.clone(),
    }
}

fn message_text(message: &ChatMessage) -> Option<String> {
    match message.content.as_ref()? {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn tool_content_to_value(message: &ChatMessage) -> Result<serde_json::Value, TransformError> {
    match message.content.as_ref() {
        Some(serde_json::Value::String(s)) => {
            Ok(serde_json::from_str(s).unwrap_or_else(|_| serde_json::json!({ "result": s })))
        }
        Some(other) => Ok(other.clone()),
        None => Ok(serde_json::json!({})),
    }
}

/// `req bwd`: Gemini `generateContent` request → OpenAI chat request. Used
/// when a `gemini-cli` client is re-homed to an OpenAI-compatible gateway.
pub fn gemini_request_to_openai(req: &GenerateContentRequest, model: &str) -> ChatCompletionRequest {
    let mut messages = Vec::new();

    if let Some(system) = &req.system_instruction {
        let text = concat_text_parts(&system.parts);
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

    for content in &req.contents {
        let role = content.role.as_deref().unwrap_or("user");
        let mut tool_calls = Vec::new();
        for part in &content.parts {
            if let Some(func) = &part.function_call {
                tool_calls.push(ToolCall {
                    id: format!("call_{}", tool_calls.len()),
                    kind: "function".to_string(),
                    function: OpenAiFunctionCall {
                        name: func.name.clone(),
                        arguments: func.args.to_string(),
                    },
                });
            }
            if let Some(resp) = &part.function_response {
                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(resp.response.clone()),
                    tool_calls: None,
                    tool_call_id: None,
                    name: Some(resp.name.clone()),
                });
            }
        }
        let text = concat_text_parts(&content.parts);
        let openai_role = if role == "model" { "assistant" } else { "user" };
        if !text.is_empty() || !tool_calls.is_empty() {
            messages.push(ChatMessage {
                role: openai_role.to_string(),
                content: if text.is_empty() { None } else { Some(serde_json::Value::String(text)) },
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                tool_call_id: None,
                name: None,
            });
        }
    }

    let tools = req.tools.as_ref().map(|decls| {
        decls
            .iter()
            .flat_map(|d| d.function_declarations.iter())
            .map(|f| ChatTool {
                kind: "function".to_string(),
                function: FunctionDef {
                    name: f.name.clone(),
                    description: f.description.clone(),
                    parameters: f.parameters.clone(),
                },
            })
            .collect()
    });

    let (temperature, max_tokens, top_p) = match &req.generation_config {
        Some(cfg) => (cfg.temperature, cfg.max_output_tokens, cfg.top_p),
        None => (None, None, None),
    };

    ChatCompletionRequest {
        model: model.to_string(),
        messages,
        stream: false,
        temperature,
        top_p,
        max_tokens,
        tools,
        extra: Default::default(),
    }
}

fn concat_text_parts(parts: &[Part]) -> String {
    parts.iter().filter_map(|p| p.text.as_deref()).collect::<Vec<_>>().join("")
}

/// `resp bwd`: Gemini `generateContent` response → OpenAI chat response.
pub fn gemini_response_to_openai(resp: &GenerateContentResponse, id: &str, model: &str) -> ChatCompletionResponse {
    let candidate = resp.candidates.first();
    let (content, tool_calls) = match candidate {
        Some(c) => {
            let text = concat_text_parts(&c.content.parts);
            let mut calls = Vec::new();
            for part in &c.content.parts {
                if let Some(func) = &part.function_call {
                    calls.push(ToolCall {
                        id: format!("call_{}", calls.len()),
                        kind: "function".to_string(),
                        function: OpenAiFunctionCall { name: func.name.clone(), arguments: func.args.to_string() },
                    });
                }
            }
            (text, calls)
        }
        None => (String::new(), Vec::new()),
    };

    let finish_reason = candidate
        .and_then(|c| c.finish_reason.as_deref())
        .map(map_gemini_finish_reason_to_openai);

    let message = ChatMessage {
        role: "assistant".to_string(),
        content: if content.is_empty() { None } else { Some(serde_json::Value::String(content)) },
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
        tool_call_id: None,
        name: None,
    };

    let usage = resp
        .usage_metadata
        .as_ref()
        .map(|u| OpenAiUsage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
            completion_tokens_details: None,
            prompt_tokens_details: None,
        })
        .unwrap_or_default();

    ChatCompletionResponse {
        id: id.to_string(),
        model: model.to_string(),
        choices: vec![Choice { index: 0, message, finish_reason }],
        usage,
        extra: Default::default(),
    }
}

fn map_gemini_finish_reason_to_openai(reason: &str) -> String {
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" => "content_filter",
        other => return other.to_lowercase(),
    }
    .to_string()
}

fn map_openai_finish_reason_to_gemini(reason: &str) -> String {
    match reason {
        "stop" => "STOP",
        "length" => "MAX_TOKENS",
        "content_filter" => "SAFETY",
        other => return other.to_uppercase(),
    }
    .to_string()
}

/// `resp fwd`: OpenAI chat response → Gemini `generateContent` response.
/// Needed when a unified-gateway response must be handed back to a
/// `gemini-cli` client in native shape.
pub fn openai_response_to_gemini(resp: &ChatCompletionResponse) -> GenerateContentResponse {
    let choice = resp.choices.first();
    let mut parts = Vec::new();
    if let Some(choice) = choice {
        if let Some(serde_json::Value::String(text)) = &choice.message.content {
            parts.push(Part::text(text.clone()));
        }
        if let Some(tool_calls) = &choice.message.tool_calls {
            for call in tool_calls {
                let args = serde_json::from_str(&call.function.arguments).unwrap_or(serde_json::Value::Null);
                parts.push(Part {
                    text: None,
                    function_call: Some(GeminiFunctionCall { name: call.function.name.clone(), args }),
                    function_response: None,
                    inline_data: None,
                });
            }
        }
    }
    if parts.is_empty() {
        parts.push(Part::text(""));
    }

    let finish_reason = choice
        .and_then(|c| c.finish_reason.as_deref())
        .map(map_openai_finish_reason_to_gemini);

    let candidates = vec![Candidate {
        content: Content { role: Some("model".to_string()), parts },
        finish_reason,
    }];

    let usage_metadata = Some(UsageMetadata {
        prompt_token_count: resp.usage.prompt_tokens,
        candidates_token_count: resp.usage.completion_tokens,
        total_token_count: resp.usage.total_tokens,
        cached_content_token_count: resp.usage.prompt_tokens_details.as_ref().map(|d| d.cached_tokens).unwrap_or(0),
    });

    GenerateContentResponse { candidates, usage_metadata }
}

/// Streaming-chunk fwd: one OpenAI SSE chunk → the Gemini chunk shape a
/// `gemini-cli` client expects when fed through a local OpenAI-chat
/// provider. `delta.content` may be an empty string; that's preserved, not
/// dropped, since an empty-text chunk still keeps the stream alive.
pub fn openai_chunk_to_gemini(chunk: &ChatCompletionChunk) -> GenerateContentResponse {
    let text = chunk
        .choices
        .first()
        .and_then(|c| c.delta.content.clone())
        .unwrap_or_default();

    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Content { role: Some("model".to_string()), parts: vec![Part::text(text)] },
            finish_reason: None,
        }],
        usage_metadata: chunk.usage.as_ref().map(|u| UsageMetadata {
            prompt_token_count: u.prompt_tokens,
            candidates_token_count: u.completion_tokens,
            total_token_count: u.total_tokens,
            cached_content_token_count: 0,
        }),
    }
}

/// Non-stream → SSE simulation: a complete OpenAI response rendered as the
/// two-chunk-plus-`[DONE]` sequence a streaming OpenAI client expects, used
/// when the chosen upstream only returned a non-streaming body.
pub fn simulate_openai_stream(resp: &ChatCompletionResponse) -> Vec<Bytes> {
    let choice = resp.choices.first();
    let role_delta = ChunkDelta { role: Some("assistant".to_string()), content: None, tool_calls: None };
    let (content, tool_calls) = match choice {
        Some(c) => (
            c.message.content.as_ref().and_then(|v| v.as_str()).map(|s| s.to_string()),
            c.message.tool_calls.clone(),
        ),
        None => (None, None),
    };

    let first = ChatCompletionChunk {
        id: resp.id.clone(),
        model: resp.model.clone(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta { content, tool_calls, ..role_delta },
            finish_reason: None,
        }],
        usage: None,
        extra: Default::default(),
    };

    let second = ChatCompletionChunk {
        id: resp.id.clone(),
        model: resp.model.clone(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta::default(),
            finish_reason: choice.and_then(|c| c.finish_reason.clone()),
        }],
        usage: Some(resp.usage.clone()),
        extra: Default::default(),
    };

    vec![
        render_data_frame(&serde_json::to_string(&first).unwrap_or_default()),
        render_data_frame(&serde_json::to_string(&second).unwrap_or_default()),
        Bytes::from_static(llmrelay_protocol::sse::DONE_FRAME),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmrelay_protocol::openai_chat::Usage;

    fn text_message(role: &str, text: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: Some(serde_json::Value::String(text.to_string())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    #[test]
    fn openai_request_lifts_system_into_system_instruction() {
        let req = ChatCompletionRequest {
            model: "gemini-2.5-pro".to_string(),
            messages: vec![text_message("system", "be terse"), text_message("user", "hi")],
            stream: false,
            temperature: None,
            top_p: None,
            max_tokens: None,
            tools: None,
            extra: Default::default(),
        };
        let gemini = openai_request_to_gemini(&req).unwrap();
        assert_eq!(gemini.system_instruction.unwrap().parts[0].text.as_deref(), Some("be terse"));
        assert_eq!(gemini.contents.len(), 1);
        assert_eq!(gemini.contents[0].role.as_deref(), Some("user"));
    }

    #[test]
    fn openai_request_maps_assistant_to_model_role() {
        let req = ChatCompletionRequest {
            model: "m".to_string(),
            messages: vec![text_message("assistant", "ack")],
            stream: false,
            temperature: None,
            top_p: None,
            max_tokens: None,
            tools: None,
            extra: Default::default(),
        };
        let gemini = openai_request_to_gemini(&req).unwrap();
        assert_eq!(gemini.contents[0].role.as_deref(), Some("model"));
    }

    #[test]
    fn gemini_to_openai_response_preserves_concatenated_text_and_usage() {
        let gemini = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content { role: Some("model".to_string()), parts: vec![Part::text("hel"), Part::text("lo")] },
                finish_reason: Some("STOP".to_string()),
            }],
            usage_metadata: Some(UsageMetadata {
                prompt_token_count: 10,
                candidates_token_count: 4,
                total_token_count: 14,
                cached_content_token_count: 0,
            }),
        };
        let openai = gemini_response_to_openai(&gemini, "id-1", "gemini-2.5-pro");
        assert_eq!(openai.choices[0].message.content.as_ref().unwrap().as_str(), Some("hello"));
        assert_eq!(openai.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(openai.usage.prompt_tokens, 10);
        assert_eq!(openai.usage.completion_tokens, 4);
    }

    #[test]
    fn round_trip_preserves_text_and_usage_counts() {
        let gemini = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content { role: Some("model".to_string()), parts: vec![Part::text("abc")] },
                finish_reason: Some("STOP".to_string()),
            }],
            usage_metadata: Some(UsageMetadata {
                prompt_token_count: 5,
                candidates_token_count: 2,
                total_token_count: 7,
                cached_content_token_count: 0,
            }),
        };
        let openai = gemini_response_to_openai(&gemini, "id", "m");
        let back = openai_response_to_gemini(&openai);
        assert_eq!(concat_text_parts(&back.candidates[0].content.parts), "abc");
        assert_eq!(back.usage_metadata.as_ref().unwrap().prompt_token_count, 5);
        assert_eq!(back.usage_metadata.as_ref().unwrap().candidates_token_count, 2);
    }

    #[test]
    fn streaming_chunk_conversion_allows_empty_text() {
        let chunk = ChatCompletionChunk {
            id: "c".to_string(),
            model: "m".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta { role: None, content: Some(String::new()), tool_calls: None },
                finish_reason: None,
            }],
            usage: None,
            extra: Default::default(),
        };
        let gemini = openai_chunk_to_gemini(&chunk);
        assert_eq!(gemini.candidates[0].content.parts[0].text.as_deref(), Some(""));
    }

    #[test]
    fn non_stream_sse_simulation_emits_two_chunks_and_done() {
        let resp = ChatCompletionResponse {
            id: "r1".to_string(),
            model: "gpt-4o".to_string(),
            choices: vec![Choice {
                index: 0,
                message: text_message("assistant", "hi there"),
                finish_reason: Some("stop".to_string()),
            }],
            usage: Usage { prompt_tokens: 3, completion_tokens: 2, total_tokens: 5, ..Default::default() },
            extra: Default::default(),
        };
        let frames = simulate_openai_stream(&resp);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[2][..], llmrelay_protocol::sse::DONE_FRAME);
        assert!(frames[0].starts_with(b"data: "));
        assert!(std::str::from_utf8(&frames[0]).unwrap().contains("\"hi there\""));
    }
}
