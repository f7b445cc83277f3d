//! Dialect bridges. Every conversion goes through the OpenAI chat shapes in
//! `dto::openai`, so N dialects need 2N conversions instead of N².

use bytes::Bytes;

use crate::controller::error::RelayError;
use crate::dto::openai::{ChatStreamChunk, Usage};
use crate::schema::enum_def::RelayFormat;
use crate::utils::sse::{done_frame, json_frame, SseEvent};

pub mod claude;
pub mod gemini;
pub mod responses;
pub mod thinking;

/// Turns upstream event-stream frames into chat chunks.
pub trait StreamDecoder: Send {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<ChatStreamChunk>, RelayError>;
}

/// Renders chat chunks in the dialect the client spoke.
pub trait ClientEncoder: Send {
    fn encode(&mut self, chunk: &ChatStreamChunk) -> Vec<Bytes>;
    /// Closing frames. `usage` is the settled usage of the whole stream.
    fn finish(&mut self, usage: &Usage) -> Vec<Bytes>;

    /// Tells the client the stream was cut short. Sent ahead of [`ClientEncoder::finish`].
    fn error(&mut self, err: &RelayError) -> Vec<Bytes> {
        vec![json_frame(&err.to_body())]
    }
}

pub fn encoder_for(format: RelayFormat, include_usage: bool, model: &str) -> Box<dyn ClientEncoder> {
    match format {
        RelayFormat::OpenAi => Box::new(OpenAiStreamEncoder::new(include_usage, model)),
        RelayFormat::Claude => Box::new(claude::ClaudeStreamEncoder::new(model)),
        RelayFormat::Gemini => Box::new(gemini::GeminiStreamEncoder::new(model)),
        RelayFormat::Responses => Box::new(responses::ResponsesStreamEncoder::new(model)),
    }
}

/// OpenAI-compatible upstream frames.
#[derive(Debug, Default)]
pub struct OpenAiStreamDecoder;

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<ChatStreamChunk>, RelayError> {
        if event.is_done() || event.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let value: serde_json::Value = serde_json::from_str(&event.data)
            .map_err(|e| RelayError::upstream_transport(format!("bad stream frame: {e}")))?;
        if let Some(error) = value.get("error") {
            let message = error.get("message").and_then(|m| m.as_str()).unwrap_or("upstream stream error");
            return Err(RelayError::upstream(500, message, None));
        }
        let mut chunk: ChatStreamChunk = serde_json::from_value(value)
            .map_err(|e| RelayError::upstream_transport(format!("bad stream frame: {e}")))?;
        if let Some(usage) = chunk.usage.as_mut() {
            usage.normalize();
        }
        Ok(vec![chunk])
    }
}

/// Chat chunks back to the client as `data:` frames, upstream usage frames
/// replaced by a single final one when the client asked for it.
pub struct OpenAiStreamEncoder {
    include_usage: bool,
    id: String,
    model: String,
    created: i64,
}

impl OpenAiStreamEncoder {
    pub fn new(include_usage: bool, model: &str) -> Self {
        Self {
            include_usage,
            id: String::new(),
            model: model.to_string(),
            created: 0,
        }
    }
}

impl ClientEncoder for OpenAiStreamEncoder {
    fn encode(&mut self, chunk: &ChatStreamChunk) -> Vec<Bytes> {
        if self.id.is_empty() && !chunk.id.is_empty() {
            self.id = chunk.id.clone();
            self.created = chunk.created;
            if !chunk.model.is_empty() {
                self.model = chunk.model.clone();
            }
        }
        if chunk.choices.is_empty() {
            return Vec::new();
        }
        if chunk.usage.is_some() {
            let mut stripped = chunk.clone();
            stripped.usage = None;
            return vec![json_frame(&stripped)];
        }
        vec![json_frame(chunk)]
    }

    fn finish(&mut self, usage: &Usage) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if self.include_usage {
            let chunk = ChatStreamChunk::usage_only(&self.id, &self.model, self.created, usage.clone());
            frames.push(json_frame(&chunk));
        }
        frames.push(done_frame());
        frames
    }
}

pub fn anthropic_stop_to_openai(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop",
        "tool_use" => "tool_calls",
        "max_tokens" => "length",
        "refusal" => "content_filter",
        _ => "stop",
    }
    .to_string()
}

pub fn openai_finish_to_anthropic(reason: &str) -> String {
    match reason {
        "tool_calls" | "function_call" => "tool_use",
        "length" => "max_tokens",
        "content_filter" => "refusal",
        _ => "end_turn",
    }
    .to_string()
}

pub fn gemini_finish_to_openai(reason: &str, has_tool_call: bool) -> String {
    match reason {
        "STOP" if has_tool_call => "tool_calls",
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => "content_filter",
        _ => "stop",
    }
    .to_string()
}

pub fn openai_finish_to_gemini(reason: &str) -> String {
    match reason {
        "length" => "MAX_TOKENS",
        "content_filter" => "SAFETY",
        _ => "STOP",
    }
    .to_string()
}

/// Thinking budget for an OpenAI `reasoning_effort`.
pub fn effort_to_budget(effort: &str) -> Option<u64> {
    match effort {
        "minimal" | "low" => Some(1024),
        "medium" => Some(8192),
        "high" => Some(24576),
        _ => None,
    }
}

pub fn budget_to_effort(budget: u64) -> &'static str {
    match budget {
        0..=1024 => "low",
        1025..=8192 => "medium",
        _ => "high",
    }
}

/// Splits `data:<mime>;base64,<payload>` urls.
pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    Some((mime.to_string(), data.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::openai::Delta;

    #[test]
    fn openai_encoder_replaces_usage_frames() {
        let mut encoder = OpenAiStreamEncoder::new(true, "gpt-4o");
        let chunk = ChatStreamChunk::new("c1", "gpt-4o", 1).with_delta(
            Delta { content: Some("hi".into()), ..Default::default() },
            None,
        );
        assert_eq!(encoder.encode(&chunk).len(), 1);
        let upstream_usage = ChatStreamChunk::usage_only("c1", "gpt-4o", 1, Usage::new(1, 1));
        assert!(encoder.encode(&upstream_usage).is_empty());

        let frames = encoder.finish(&Usage::new(3, 4));
        assert_eq!(frames.len(), 2);
        let text = String::from_utf8(frames[0].to_vec()).unwrap();
        assert!(text.contains("\"total_tokens\":7"));
        assert!(text.contains("\"id\":\"c1\""));
        assert_eq!(frames[1], done_frame());
    }

    #[test]
    fn openai_encoder_without_usage_only_sends_done() {
        let mut encoder = OpenAiStreamEncoder::new(false, "gpt-4o");
        assert_eq!(encoder.finish(&Usage::new(3, 4)), vec![done_frame()]);
    }

    #[test]
    fn decoder_normalizes_cache_hits() {
        let mut decoder = OpenAiStreamDecoder;
        let event = SseEvent::data(
            r#"{"id":"x","choices":[],"usage":{"prompt_tokens":10,"completion_tokens":2,"total_tokens":12,"prompt_cache_hit_tokens":6}}"#,
        );
        let chunks = decoder.decode(&event).unwrap();
        assert_eq!(chunks[0].usage.as_ref().unwrap().cached_tokens(), 6);
        assert!(decoder.decode(&SseEvent::data("[DONE]")).unwrap().is_empty());
        assert!(decoder.decode(&SseEvent::data(r#"{"error":{"message":"boom"}}"#)).is_err());
    }

    #[test]
    fn data_urls() {
        assert_eq!(
            parse_data_url("data:image/png;base64,AAAA"),
            Some(("image/png".to_string(), "AAAA".to_string()))
        );
        assert!(parse_data_url("https://x/y.png").is_none());
    }
}
