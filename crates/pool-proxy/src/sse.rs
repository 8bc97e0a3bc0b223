//! SSE Streamer: turns a stream of upstream JSON chunks into the canonical
//! Anthropic SSE event sequence. A pure transformer — it holds only the
//! small amount of state needed to know which content block is currently
//! open; callers own the actual downstream write.

use crate::anthropic::{ContentBlock, ContentDelta, MessageDelta, MessagesResponse, Role, SseEvent, Usage};
use crate::translator::synthesize_id;
use crate::wire::{Part, StreamChunk};

#[derive(Debug, Clone, PartialEq)]
enum OpenKind {
    Text,
    Thinking,
    ToolUse,
}

struct OpenBlock {
    index: usize,
    kind: OpenKind,
}

/// Re-emits Anthropic-flavored SSE events from a sequence of upstream
/// Gemini-shaped chunks for one downstream message.
pub struct SseStreamer {
    message_id: String,
    model: String,
    open: Option<OpenBlock>,
    next_index: usize,
    input_tokens: u32,
    output_tokens: u32,
}

impl SseStreamer {
    /// Begin a new streamed message for `model`.
    #[must_use]
    pub fn new(model: String) -> Self {
        Self {
            message_id: synthesize_id("msg"),
            model,
            open: None,
            next_index: 0,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// The mandatory first event: `message_start` with usage placeholders.
    #[must_use]
    pub fn message_start(&self) -> SseEvent {
        SseEvent::MessageStart {
            message: MessagesResponse {
                id: self.message_id.clone(),
                response_type: "message",
                role: Role::Assistant,
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                usage: Usage::default(),
            },
        }
    }

    /// Translate one upstream chunk into zero or more SSE events, opening
    /// and closing content blocks as the part kind changes.
    pub fn on_chunk(&mut self, chunk: &StreamChunk) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if let Some(usage) = &chunk.usage_metadata {
            self.input_tokens = usage.prompt_token_count;
            self.output_tokens = usage.candidates_token_count.unwrap_or(self.output_tokens);
        }
        let Some(candidate) = chunk.candidates.first() else { return events };
        for part in &candidate.content.parts {
            self.emit_part(part, &mut events);
        }
        events
    }

    fn emit_part(&mut self, part: &Part, events: &mut Vec<SseEvent>) {
        match part {
            Part::Text { text, thought: Some(true), thought_signature } => {
                self.ensure_open(OpenKind::Thinking, events, || ContentBlock::Thinking { thinking: String::new(), signature: None });
                if !text.is_empty() {
                    events.push(self.delta(ContentDelta::ThinkingDelta { thinking: text.clone() }));
                }
                if let Some(sig) = thought_signature {
                    events.push(self.delta(ContentDelta::SignatureDelta { signature: sig.clone() }));
                }
            }
            Part::Text { text, .. } => {
                if text.is_empty() {
                    return;
                }
                self.ensure_open(OpenKind::Text, events, || ContentBlock::Text { text: String::new() });
                events.push(self.delta(ContentDelta::TextDelta { text: text.clone() }));
            }
            Part::FunctionCall { function_call, thought_signature } => {
                let id = synthesize_id("toolu");
                self.close_open(events);
                let index = self.open_new(OpenKind::ToolUse, events, ContentBlock::ToolUse {
                    id: id.clone(),
                    name: function_call.name.clone(),
                    input: serde_json::json!({}),
                    signature: thought_signature.clone(),
                });
                let partial_json = function_call.args.to_string();
                events.push(SseEvent::ContentBlockDelta { index, delta: ContentDelta::InputJsonDelta { partial_json } });
                self.close_open(events);
            }
            Part::FunctionResponse { .. } | Part::InlineData { .. } => {}
        }
    }

    fn ensure_open(&mut self, kind: OpenKind, events: &mut Vec<SseEvent>, block: impl FnOnce() -> ContentBlock) {
        if self.open.as_ref().map(|o| &o.kind) == Some(&kind) {
            return;
        }
        self.close_open(events);
        self.open_new(kind, events, block());
    }

    fn open_new(&mut self, kind: OpenKind, events: &mut Vec<SseEvent>, block: ContentBlock) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        events.push(SseEvent::ContentBlockStart { index, content_block: block });
        self.open = Some(OpenBlock { index, kind });
        index
    }

    fn close_open(&mut self, events: &mut Vec<SseEvent>) {
        if let Some(open) = self.open.take() {
            events.push(SseEvent::ContentBlockStop { index: open.index });
        }
    }

    fn delta(&self, delta: ContentDelta) -> SseEvent {
        SseEvent::ContentBlockDelta { index: self.open.as_ref().map_or(0, |o| o.index), delta }
    }

    /// Clean terminal sequence: close any open block, emit `message_delta`
    /// with the final stop reason, then `message_stop`.
    pub fn finish(&mut self, stop_reason: Option<String>) -> Vec<SseEvent> {
        let mut events = Vec::new();
        self.close_open(&mut events);
        events.push(SseEvent::MessageDelta {
            delta: MessageDelta { stop_reason },
            usage: Usage { input_tokens: self.input_tokens, output_tokens: self.output_tokens },
        });
        events.push(SseEvent::MessageStop);
        events
    }

    /// Upstream aborted mid-stream after bytes were already sent downstream:
    /// close whatever block is open, then the same terminal sequence with a
    /// synthetic `"error"` stop reason. No retry is possible at this point.
    pub fn abort(&mut self) -> Vec<SseEvent> {
        self.finish(Some("error".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Candidate, Content, GenerateContentResponse};

    fn text_chunk(text: &str) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content { role: Some("model".into()), parts: vec![Part::Text { text: text.into(), thought: None, thought_signature: None }] },
                finish_reason: None,
            }],
            usage_metadata: None,
        }
    }

    #[test]
    fn every_content_block_start_has_a_matching_stop() {
        let mut streamer = SseStreamer::new("claude-opus-4-5".into());
        let starts = streamer.on_chunk(&text_chunk("hello"));
        assert!(matches!(starts[0], SseEvent::ContentBlockStart { .. }));
        let finish = streamer.finish(Some("end_turn".to_string()));
        assert!(matches!(finish[0], SseEvent::ContentBlockStop { .. }));
        assert!(matches!(finish.last().unwrap(), SseEvent::MessageStop));
    }

    #[test]
    fn abort_mid_block_emits_well_formed_terminal_sequence() {
        let mut streamer = SseStreamer::new("claude-opus-4-5".into());
        let _ = streamer.on_chunk(&GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    role: Some("model".into()),
                    parts: vec![Part::Text { text: "thinking...".into(), thought: Some(true), thought_signature: None }],
                },
                finish_reason: None,
            }],
            usage_metadata: None,
        });
        let events = streamer.abort();
        assert!(matches!(events[0], SseEvent::ContentBlockStop { .. }));
        match &events[1] {
            SseEvent::MessageDelta { delta, .. } => assert_eq!(delta.stop_reason.as_deref(), Some("error")),
            _ => panic!("expected message_delta"),
        }
        assert!(matches!(events[2], SseEvent::MessageStop));
    }

    #[test]
    fn switching_part_kind_closes_and_reopens_blocks() {
        let mut streamer = SseStreamer::new("claude-opus-4-5".into());
        let _ = streamer.on_chunk(&text_chunk("hello"));
        let events = streamer.on_chunk(&GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    role: Some("model".into()),
                    parts: vec![Part::FunctionCall {
                        function_call: crate::wire::FunctionCall { name: "lookup".into(), args: serde_json::json!({"q":"x"}) },
                        thought_signature: None,
                    }],
                },
                finish_reason: None,
            }],
            usage_metadata: None,
        });
        assert!(matches!(events[0], SseEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(events[1], SseEvent::ContentBlockStart { index: 1, .. }));
        assert!(matches!(events.last().unwrap(), SseEvent::ContentBlockStop { index: 1 }));
    }
}
