use crate::dto::openai::{ChatResponse, ChatStreamChunk, MessageContent};

const OPEN_TAG: &str = "<think>\n";
const CLOSE_TAG: &str = "\n</think>\n\n";

/// Moves `reasoning_content` into `content` wrapped in `<think>` tags.
/// Each tag is written exactly once per stream.
#[derive(Debug, Default)]
pub struct ThinkingToContent {
    has_sent_thinking: bool,
    sent_closing_tag: bool,
}

impl ThinkingToContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, chunk: &mut ChatStreamChunk) {
        for choice in &mut chunk.choices {
            let delta = &mut choice.delta;
            let mut out = String::new();
            if let Some(reasoning) = delta.reasoning_content.take().filter(|r| !r.is_empty()) {
                if !self.sent_closing_tag {
                    if !self.has_sent_thinking {
                        out.push_str(OPEN_TAG);
                        self.has_sent_thinking = true;
                    }
                    out.push_str(&reasoning);
                }
            }
            if let Some(content) = delta.content.take().filter(|c| !c.is_empty()) {
                if self.has_sent_thinking && !self.sent_closing_tag {
                    out.push_str(CLOSE_TAG);
                    self.sent_closing_tag = true;
                }
                out.push_str(&content);
            }
            if !out.is_empty() {
                delta.content = Some(out);
            }
        }
    }

    /// Closing tag for a stream that ended while still thinking.
    pub fn finish(&mut self) -> Option<String> {
        if self.has_sent_thinking && !self.sent_closing_tag {
            self.sent_closing_tag = true;
            return Some(CLOSE_TAG.to_string());
        }
        None
    }
}

pub fn inline_thinking(response: &mut ChatResponse) {
    for choice in &mut response.choices {
        let Some(reasoning) = choice.message.reasoning_content.take().filter(|r| !r.is_empty()) else {
            continue;
        };
        let content = choice.message.content_text();
        choice.message.content = Some(MessageContent::Text(format!("{OPEN_TAG}{reasoning}{CLOSE_TAG}{content}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::openai::{Delta, Message};

    fn chunk(reasoning: Option<&str>, content: Option<&str>) -> ChatStreamChunk {
        ChatStreamChunk::new("c", "m", 0).with_delta(
            Delta {
                reasoning_content: reasoning.map(str::to_string),
                content: content.map(str::to_string),
                ..Default::default()
            },
            None,
        )
    }

    fn run(state: &mut ThinkingToContent, reasoning: Option<&str>, content: Option<&str>) -> Option<String> {
        let mut c = chunk(reasoning, content);
        state.apply(&mut c);
        assert!(c.choices[0].delta.reasoning_content.is_none());
        c.choices[0].delta.content.clone()
    }

    #[test]
    fn tags_are_emitted_once() {
        let mut state = ThinkingToContent::new();
        let mut out = String::new();
        for (r, c) in [(Some("a"), None), (Some("b"), None), (None, Some("x")), (None, Some("y"))] {
            if let Some(text) = run(&mut state, r, c) {
                out.push_str(&text);
            }
        }
        assert!(state.finish().is_none());
        assert_eq!(out, "<think>\nab\n</think>\n\nxy");
    }

    #[test]
    fn unterminated_thinking_is_closed_at_the_end() {
        let mut state = ThinkingToContent::new();
        assert_eq!(run(&mut state, Some("only"), None).as_deref(), Some("<think>\nonly"));
        assert_eq!(state.finish().as_deref(), Some(CLOSE_TAG));
        assert!(state.finish().is_none());
    }

    #[test]
    fn plain_content_is_untouched() {
        let mut state = ThinkingToContent::new();
        assert_eq!(run(&mut state, None, Some("hello")).as_deref(), Some("hello"));
        assert!(state.finish().is_none());
    }

    #[test]
    fn non_stream_response_is_inlined() {
        let mut message = Message::text("assistant", "answer");
        message.reasoning_content = Some("why".into());
        let mut response = ChatResponse {
            choices: vec![crate::dto::openai::Choice { index: 0, message, finish_reason: Some("stop".into()) }],
            ..Default::default()
        };
        inline_thinking(&mut response);
        assert_eq!(response.first_text(), "<think>\nwhy\n</think>\n\nanswer");
    }
}
