//! Format Translator: converts between the Anthropic Messages shape this
//! proxy exposes and the Cloud Code wire format it speaks to upstream.

use crate::anthropic::{
    ContentBlock, Message, MessagesRequest, MessagesResponse, Role, SystemPrompt,
    ToolDefinition, ToolResultContent, Usage,
};
use crate::schema::sanitize;
use crate::wire::{
    CodeAssistRequest, Content, FunctionCall, FunctionDeclaration, FunctionResponse, GenerateContentRequest,
    GenerateContentResponse, GenerationConfig, InlineData, Part, Tool,
};

/// Outcome of translating a non-streaming upstream response: either a
/// well-formed reply, or the "zero content blocks" edge case the Message
/// Handler treats as an empty response to retry.
pub enum Translated {
    Response(MessagesResponse),
    Empty,
}

/// Build the upstream request body for `project`/`model` from an Anthropic
/// request.
#[must_use]
pub fn build_upstream_request(req: &MessagesRequest, project: &str, model: &str) -> CodeAssistRequest {
    let system_instruction = req.system.as_ref().map(system_to_content);
    let contents = req.messages.iter().map(message_to_content).collect();
    let tools = req.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        vec![Tool { function_declarations: tools.iter().map(tool_to_declaration).collect() }]
    });

    CodeAssistRequest {
        project: project.to_string(),
        model: model.to_string(),
        request: GenerateContentRequest {
            contents,
            system_instruction,
            tools,
            generation_config: GenerationConfig {
                temperature: req.temperature,
                max_output_tokens: req.max_tokens,
                stop_sequences: req.stop_sequences.clone(),
            },
            safety_settings: None,
        },
    }
}

fn system_to_content(system: &SystemPrompt) -> Content {
    let text = match system {
        SystemPrompt::Text(text) => text.clone(),
        SystemPrompt::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    };
    Content { role: None, parts: vec![Part::Text { text, thought: None, thought_signature: None }] }
}

fn tool_to_declaration(tool: &ToolDefinition) -> FunctionDeclaration {
    FunctionDeclaration {
        name: tool.name.clone(),
        description: tool.description.clone(),
        parameters: sanitize(&tool.input_schema),
    }
}

fn message_to_content(message: &Message) -> Content {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "model",
    };
    let blocks = message.content.clone().into_blocks();
    let parts = blocks.iter().filter_map(block_to_part).collect();
    Content { role: Some(role.to_string()), parts }
}

fn block_to_part(block: &ContentBlock) -> Option<Part> {
    match block {
        ContentBlock::Text { text } if text.is_empty() => None,
        ContentBlock::Text { text } => Some(Part::Text { text: text.clone(), thought: None, thought_signature: None }),
        ContentBlock::Thinking { thinking, signature } => Some(Part::Text {
            text: thinking.clone(),
            thought: Some(true),
            thought_signature: signature.clone(),
        }),
        ContentBlock::ToolUse { name, input, signature, .. } => Some(Part::FunctionCall {
            function_call: FunctionCall { name: name.clone(), args: input.clone() },
            thought_signature: signature.clone(),
        }),
        ContentBlock::ToolResult { content, .. } => {
            let response = match content {
                Some(ToolResultContent::Text(text)) => serde_json::json!({ "output": text }),
                Some(ToolResultContent::Blocks(blocks)) => {
                    let text: String = blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => Some(text.clone()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    serde_json::json!({ "output": text })
                }
                None => serde_json::json!({}),
            };
            // Gemini's functionResponse has no slot for the originating tool_use_id;
            // the call name is the correlation key the upstream expects.
            Some(Part::FunctionResponse { function_response: FunctionResponse { name: tool_result_name(block), response } })
        }
    }
}

fn tool_result_name(block: &ContentBlock) -> String {
    match block {
        ContentBlock::ToolResult { tool_use_id, .. } => tool_use_id.clone(),
        _ => String::new(),
    }
}

/// Translate a non-streaming upstream response into the Anthropic shape, or
/// report it as empty so the Message Handler can retry.
#[must_use]
pub fn translate_response(resp: &GenerateContentResponse, model: &str) -> Translated {
    let Some(candidate) = resp.candidates.first() else { return Translated::Empty };

    let mut blocks = Vec::new();
    for part in &candidate.content.parts {
        if let Some(block) = part_to_block(part) {
            blocks.push(block);
        }
    }
    if blocks.is_empty() {
        return Translated::Empty;
    }

    let stop_reason = candidate.finish_reason.as_deref().map(map_finish_reason).map(str::to_string);
    let usage = resp
        .usage_metadata
        .as_ref()
        .map(|u| Usage { input_tokens: u.prompt_token_count, output_tokens: u.candidates_token_count.unwrap_or(0) })
        .unwrap_or_default();

    Translated::Response(MessagesResponse {
        id: synthesize_id("msg"),
        response_type: "message",
        role: Role::Assistant,
        content: blocks,
        model: model.to_string(),
        stop_reason,
        usage,
    })
}

fn part_to_block(part: &Part) -> Option<ContentBlock> {
    match part {
        Part::Text { text, .. } if text.is_empty() => None,
        Part::Text { text, thought: Some(true), thought_signature } => {
            Some(ContentBlock::Thinking { thinking: text.clone(), signature: thought_signature.clone() })
        }
        Part::Text { text, .. } => Some(ContentBlock::Text { text: text.clone() }),
        Part::FunctionCall { function_call, thought_signature } => Some(ContentBlock::ToolUse {
            id: synthesize_id("toolu"),
            name: function_call.name.clone(),
            input: function_call.args.clone(),
            signature: thought_signature.clone(),
        }),
        Part::FunctionResponse { .. } | Part::InlineData { .. } => None,
    }
}

fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "STOP" => "end_turn",
        "MAX_TOKENS" => "max_tokens",
        "SAFETY" | "RECITATION" => "stop_sequence",
        _ if reason.eq_ignore_ascii_case("tool") => "tool_use",
        _ => "end_turn",
    }
}

/// Synthesize a stable, collision-free id for a tool-use block or message
/// the upstream didn't label with one; any scheme with those two properties
/// satisfies the contract.
#[must_use]
pub fn synthesize_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

/// Translate Anthropic inline image content into a Gemini inline data part,
/// used when a message contains non-text attachments. Exposed for the
/// streaming path, which builds parts incrementally.
#[must_use]
pub fn image_part(mime_type: &str, data: &str) -> Part {
    Part::InlineData { inline_data: InlineData { mime_type: mime_type.to_string(), data: data.to_string() } }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::{MessageContent, Role};
    use crate::wire::{Candidate, UsageMetadata};

    fn user_message(text: &str) -> Message {
        Message { role: Role::User, content: MessageContent::Text(text.to_string()) }
    }

    #[test]
    fn builds_upstream_request_with_contents_and_generation_config() {
        let req = MessagesRequest {
            model: "claude-opus-4-5".into(),
            messages: vec![user_message("hello")],
            system: Some(SystemPrompt::Text("be nice".into())),
            tools: None,
            max_tokens: Some(256),
            temperature: Some(0.5),
            stop_sequences: None,
            stream: false,
        };
        let upstream = build_upstream_request(&req, "proj-1", "claude-opus-4-5");
        assert_eq!(upstream.project, "proj-1");
        assert_eq!(upstream.request.contents.len(), 1);
        assert_eq!(upstream.request.contents[0].role.as_deref(), Some("user"));
        assert_eq!(upstream.request.generation_config.max_output_tokens, Some(256));
        assert!(upstream.request.system_instruction.is_some());
    }

    #[test]
    fn empty_assistant_text_block_is_dropped() {
        let message = Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![ContentBlock::Text { text: String::new() }]),
        };
        let content = message_to_content(&message);
        assert!(content.parts.is_empty());
    }

    #[test]
    fn zero_candidates_is_reported_as_empty() {
        let resp = GenerateContentResponse { candidates: vec![], usage_metadata: None };
        assert!(matches!(translate_response(&resp, "m"), Translated::Empty));
    }

    #[test]
    fn translates_text_candidate_with_usage() {
        let resp = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content { role: Some("model".into()), parts: vec![Part::Text { text: "ok".into(), thought: None, thought_signature: None }] },
                finish_reason: Some("STOP".into()),
            }],
            usage_metadata: Some(UsageMetadata { prompt_token_count: 10, candidates_token_count: Some(5), total_token_count: 15 }),
        };
        let translated = translate_response(&resp, "claude-opus-4-5");
        match translated {
            Translated::Response(msg) => {
                assert_eq!(msg.stop_reason.as_deref(), Some("end_turn"));
                assert_eq!(msg.usage.input_tokens, 10);
                assert_eq!(msg.content.len(), 1);
            }
            Translated::Empty => panic!("expected a response"),
        }
    }

    #[test]
    fn synthesized_ids_are_unique() {
        let a = synthesize_id("toolu");
        let b = synthesize_id("toolu");
        assert_ne!(a, b);
        assert!(a.starts_with("toolu_"));
    }
}
