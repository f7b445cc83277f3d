use std::collections::HashMap;

use bytes::Bytes;
use serde_json::{json, Value};

use super::{
    anthropic_stop_to_openai, budget_to_effort, effort_to_budget, openai_finish_to_anthropic, parse_data_url,
    ClientEncoder, StreamDecoder,
};
use crate::controller::error::RelayError;
use crate::dto::claude::{
    BlockDelta, ClaudeContent, ClaudeMessage, ClaudeRequest, ClaudeResponse, ClaudeTool, ClaudeUsage, ContentBlock,
    ImageSource, MessageDeltaBody, StreamEvent,
};
use crate::dto::openai::{
    ChatRequest, ChatResponse, ChatStreamChunk, Choice, ContentPart, Delta, FunctionCall, FunctionDefinition,
    Message, MessageContent, StreamOptions, Tool, ToolCall, Usage,
};
use crate::utils::now_secs;
use crate::utils::sse::{named_json_frame, SseEvent};

pub const DEFAULT_MAX_TOKENS: u64 = 4096;

fn system_text(system: &Value) -> String {
    match system {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn claude_usage_to_openai(usage: &ClaudeUsage) -> Usage {
    let cache_read = usage.cache_read_input_tokens.unwrap_or(0);
    let cache_write = usage.cache_creation_input_tokens.unwrap_or(0);
    let mut out = Usage::new(usage.input_tokens + cache_read + cache_write, usage.output_tokens);
    if cache_read > 0 {
        out.set_cached_tokens(cache_read);
    }
    out
}

fn openai_usage_to_claude(usage: &Usage) -> ClaudeUsage {
    let cached = usage.cached_tokens();
    ClaudeUsage {
        input_tokens: usage.prompt_tokens - cached,
        output_tokens: usage.completion_tokens,
        cache_read_input_tokens: (cached > 0).then_some(cached),
        cache_creation_input_tokens: None,
    }
}

/// Anthropic Messages request into the chat hub.
pub fn claude_to_chat(req: ClaudeRequest) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = req.system.as_ref().map(system_text).filter(|s| !s.is_empty()) {
        messages.push(Message::text("system", system));
    }

    for message in req.messages {
        let blocks = message.content.blocks();
        if message.role == "assistant" {
            let mut text = String::new();
            let mut reasoning = String::new();
            let mut calls = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text: t } => text.push_str(&t),
                    ContentBlock::Thinking { thinking, .. } => reasoning.push_str(&thinking),
                    ContentBlock::ToolUse { id, name, input } => calls.push(ToolCall {
                        index: None,
                        id,
                        kind: "function".to_string(),
                        function: FunctionCall { name, arguments: input.to_string() },
                    }),
                    _ => {}
                }
            }
            messages.push(Message {
                role: "assistant".to_string(),
                content: (!text.is_empty() || calls.is_empty()).then(|| MessageContent::Text(text)),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!calls.is_empty()).then_some(calls),
                ..Default::default()
            });
            continue;
        }

        let mut parts = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::Text { text } => parts.push(ContentPart::text(text)),
                ContentBlock::Image { source } => {
                    let url = match (source.kind.as_str(), source.url, source.data) {
                        ("url", Some(url), _) => url,
                        (_, _, Some(data)) => {
                            format!("data:{};base64,{}", source.media_type.unwrap_or_else(|| "image/png".into()), data)
                        }
                        _ => continue,
                    };
                    parts.push(ContentPart::image(url));
                }
                ContentBlock::ToolResult { tool_use_id, content, .. } => messages.push(Message {
                    role: "tool".to_string(),
                    content: Some(MessageContent::Text(tool_result_text(&content))),
                    tool_call_id: Some(tool_use_id),
                    ..Default::default()
                }),
                _ => {}
            }
        }
        if parts.is_empty() {
            continue;
        }
        let content = match parts.as_slice() {
            [only] if only.kind == "text" => MessageContent::Text(only.text.clone().unwrap_or_default()),
            _ => MessageContent::Parts(parts),
        };
        messages.push(Message { role: message.role, content: Some(content), ..Default::default() });
    }

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .map(|t| Tool {
                kind: "function".to_string(),
                function: FunctionDefinition { name: t.name, description: t.description, parameters: Some(t.input_schema) },
            })
            .collect()
    });
    let tool_choice = req.tool_choice.as_ref().and_then(|choice| {
        match choice.get("type").and_then(Value::as_str)? {
            "auto" => Some(json!("auto")),
            "any" => Some(json!("required")),
            "none" => Some(json!("none")),
            "tool" => Some(json!({"type": "function", "function": {"name": choice.get("name")?}})),
            _ => None,
        }
    });
    let reasoning_effort = req
        .thinking
        .as_ref()
        .filter(|t| t.get("type").and_then(Value::as_str) == Some("enabled"))
        .map(|t| budget_to_effort(t.get("budget_tokens").and_then(Value::as_u64).unwrap_or(0)).to_string());
    let stream = req.stream.unwrap_or(false);

    ChatRequest {
        model: req.model,
        messages,
        stream: Some(stream),
        stream_options: stream.then_some(StreamOptions { include_usage: true }),
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop_sequences.map(|s| json!(s)),
        tools,
        tool_choice,
        reasoning_effort,
        user: req
            .metadata
            .as_ref()
            .and_then(|m| m.get("user_id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        ..Default::default()
    }
}

fn image_block(url: &str) -> ContentBlock {
    let source = match parse_data_url(url) {
        Some((mime, data)) => ImageSource { kind: "base64".into(), media_type: Some(mime), data: Some(data), url: None },
        None => ImageSource { kind: "url".into(), url: Some(url.to_string()), ..Default::default() },
    };
    ContentBlock::Image { source }
}

fn push_blocks(messages: &mut Vec<ClaudeMessage>, role: &str, blocks: Vec<ContentBlock>) {
    if blocks.is_empty() {
        return;
    }
    if let Some(last) = messages.last_mut().filter(|m| m.role == role) {
        let mut merged = last.content.blocks();
        merged.extend(blocks);
        last.content = ClaudeContent::Blocks(merged);
        return;
    }
    messages.push(ClaudeMessage { role: role.to_string(), content: ClaudeContent::Blocks(blocks) });
}

/// Chat hub request into an Anthropic Messages request.
pub fn chat_to_claude(req: ChatRequest) -> ClaudeRequest {
    let mut system = Vec::new();
    let mut messages: Vec<ClaudeMessage> = Vec::new();

    for message in &req.messages {
        match message.role.as_str() {
            "system" | "developer" => system.push(message.content_text()),
            "tool" => push_blocks(
                &mut messages,
                "user",
                vec![ContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: json!(message.content_text()),
                    is_error: None,
                }],
            ),
            "assistant" => {
                let mut blocks = Vec::new();
                let text = message.content_text();
                if !text.is_empty() {
                    blocks.push(ContentBlock::Text { text });
                }
                for call in message.tool_calls.iter().flatten() {
                    let input = serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
                    blocks.push(ContentBlock::ToolUse { id: call.id.clone(), name: call.function.name.clone(), input });
                }
                push_blocks(&mut messages, "assistant", blocks);
            }
            _ => {
                let blocks = message
                    .content
                    .as_ref()
                    .map(MessageContent::parts)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|part| match (part.text, part.image_url) {
                        (Some(text), _) if !text.is_empty() => Some(ContentBlock::Text { text }),
                        (_, Some(image)) => Some(image_block(&image.url)),
                        _ => None,
                    })
                    .collect();
                push_blocks(&mut messages, "user", blocks);
            }
        }
    }

    let mut max_tokens = req.max_output_tokens().unwrap_or(DEFAULT_MAX_TOKENS);
    let mut temperature = req.temperature;
    let thinking = req.reasoning_effort.as_deref().and_then(effort_to_budget).map(|budget| {
        if max_tokens <= budget {
            max_tokens = budget + DEFAULT_MAX_TOKENS;
        }
        temperature = None;
        json!({"type": "enabled", "budget_tokens": budget})
    });

    let tool_choice = req.tool_choice.as_ref().and_then(|choice| match choice {
        Value::String(s) if s == "auto" => Some(json!({"type": "auto"})),
        Value::String(s) if s == "required" => Some(json!({"type": "any"})),
        Value::String(s) if s == "none" => Some(json!({"type": "none"})),
        Value::Object(_) => {
            let name = choice.pointer("/function/name")?.as_str()?;
            Some(json!({"type": "tool", "name": name}))
        }
        _ => None,
    });
    let stop_sequences = match &req.stop {
        Some(Value::String(s)) => Some(vec![s.clone()]),
        Some(Value::Array(items)) => Some(items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()),
        _ => None,
    };

    ClaudeRequest {
        model: req.model.clone(),
        messages,
        system: (!system.is_empty()).then(|| json!(system.join("\n"))),
        max_tokens: Some(max_tokens),
        temperature,
        top_p: req.top_p,
        stop_sequences,
        stream: req.stream,
        tools: req.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| ClaudeTool {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    input_schema: t
                        .function
                        .parameters
                        .clone()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                })
                .collect()
        }),
        tool_choice,
        thinking,
        metadata: req.user.as_ref().map(|u| json!({"user_id": u})),
        ..Default::default()
    }
}

pub fn claude_response_to_chat(resp: ClaudeResponse) -> ChatResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut calls = Vec::new();
    for block in resp.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::Thinking { thinking, .. } => reasoning.push_str(&thinking),
            ContentBlock::ToolUse { id, name, input } => calls.push(ToolCall {
                index: None,
                id,
                kind: "function".to_string(),
                function: FunctionCall { name, arguments: input.to_string() },
            }),
            _ => {}
        }
    }
    let message = Message {
        role: "assistant".to_string(),
        content: Some(MessageContent::Text(text)),
        reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
        tool_calls: (!calls.is_empty()).then_some(calls),
        ..Default::default()
    };
    ChatResponse {
        id: resp.id,
        object: "chat.completion".to_string(),
        created: now_secs(),
        model: resp.model,
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: Some(anthropic_stop_to_openai(resp.stop_reason.as_deref().unwrap_or("end_turn"))),
        }],
        usage: Some(claude_usage_to_openai(&resp.usage)),
        system_fingerprint: None,
    }
}

pub fn chat_response_to_claude(resp: ChatResponse) -> ClaudeResponse {
    let mut content = Vec::new();
    let mut finish = None;
    if let Some(choice) = resp.choices.into_iter().next() {
        if let Some(reasoning) = choice.message.reasoning_content.clone().filter(|r| !r.is_empty()) {
            content.push(ContentBlock::Thinking { thinking: reasoning, signature: String::new() });
        }
        let text = choice.message.content_text();
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }
        for call in choice.message.tool_calls.into_iter().flatten() {
            let input = serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
            content.push(ContentBlock::ToolUse { id: call.id, name: call.function.name, input });
        }
        finish = choice.finish_reason;
    }
    ClaudeResponse {
        id: resp.id,
        kind: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: resp.model,
        stop_reason: Some(openai_finish_to_anthropic(finish.as_deref().unwrap_or("stop"))),
        stop_sequence: None,
        usage: resp.usage.as_ref().map(openai_usage_to_claude).unwrap_or_default(),
    }
}

/// Anthropic event stream into chat chunks.
#[derive(Debug, Default)]
pub struct ClaudeStreamDecoder {
    id: String,
    model: String,
    created: i64,
    input: ClaudeUsage,
    /// Content block index -> tool call index.
    tool_blocks: HashMap<u32, u32>,
}

impl ClaudeStreamDecoder {
    pub fn new() -> Self {
        Self { created: now_secs(), ..Default::default() }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatStreamChunk {
        ChatStreamChunk::new(&self.id, &self.model, self.created).with_delta(delta, finish_reason)
    }
}

impl StreamDecoder for ClaudeStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<ChatStreamChunk>, RelayError> {
        if event.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let parsed: StreamEvent = serde_json::from_str(&event.data)
            .map_err(|e| RelayError::upstream_transport(format!("bad stream frame: {e}")))?;
        let chunks = match parsed {
            StreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                self.input = message.usage;
                vec![self.chunk(Delta { role: Some("assistant".into()), content: Some(String::new()), ..Default::default() }, None)]
            }
            StreamEvent::ContentBlockStart { index, content_block: ContentBlock::ToolUse { id, name, .. } } => {
                let tool_index = self.tool_blocks.len() as u32;
                self.tool_blocks.insert(index, tool_index);
                let call = ToolCall {
                    index: Some(tool_index),
                    id,
                    kind: "function".to_string(),
                    function: FunctionCall { name, arguments: String::new() },
                };
                vec![self.chunk(Delta { tool_calls: Some(vec![call]), ..Default::default() }, None)]
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let delta = match delta {
                    BlockDelta::TextDelta { text } => Delta { content: Some(text), ..Default::default() },
                    BlockDelta::ThinkingDelta { thinking } => Delta { reasoning_content: Some(thinking), ..Default::default() },
                    BlockDelta::InputJsonDelta { partial_json } => {
                        let call = ToolCall {
                            index: Some(self.tool_blocks.get(&index).copied().unwrap_or(0)),
                            id: String::new(),
                            kind: "function".to_string(),
                            function: FunctionCall { name: String::new(), arguments: partial_json },
                        };
                        Delta { tool_calls: Some(vec![call]), ..Default::default() }
                    }
                    BlockDelta::SignatureDelta { .. } => return Ok(Vec::new()),
                };
                vec![self.chunk(delta, None)]
            }
            StreamEvent::MessageDelta { delta, usage } => {
                let mut merged = self.input.clone();
                if let Some(usage) = usage {
                    merged.output_tokens = usage.output_tokens;
                    if usage.input_tokens > 0 {
                        merged.input_tokens = usage.input_tokens;
                    }
                    if usage.cache_read_input_tokens.is_some() {
                        merged.cache_read_input_tokens = usage.cache_read_input_tokens;
                    }
                }
                let finish = delta.stop_reason.as_deref().map(anthropic_stop_to_openai);
                let mut chunk = self.chunk(Delta::default(), finish);
                chunk.usage = Some(claude_usage_to_openai(&merged));
                vec![chunk]
            }
            StreamEvent::Error { error } => {
                let message = error.get("message").and_then(Value::as_str).unwrap_or("upstream stream error");
                return Err(RelayError::upstream(500, message, error.get("type").and_then(Value::as_str).map(str::to_string)));
            }
            _ => Vec::new(),
        };
        Ok(chunks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OpenBlock {
    Thinking,
    Text,
    Tool(u32),
}

/// Chat chunks into Anthropic named events.
pub struct ClaudeStreamEncoder {
    model: String,
    id: String,
    started: bool,
    open: Option<OpenBlock>,
    next_block: u32,
    stop_reason: Option<String>,
}

impl ClaudeStreamEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            id: String::new(),
            started: false,
            open: None,
            next_block: 0,
            stop_reason: None,
        }
    }

    fn frame(event: &StreamEvent) -> Bytes {
        named_json_frame(event.name(), event)
    }

    fn start(&mut self, frames: &mut Vec<Bytes>) {
        if self.started {
            return;
        }
        self.started = true;
        let message = ClaudeResponse {
            id: format!("msg_{}", self.id),
            kind: "message".into(),
            role: "assistant".into(),
            model: self.model.clone(),
            ..Default::default()
        };
        frames.push(Self::frame(&StreamEvent::MessageStart { message }));
    }

    fn close(&mut self, frames: &mut Vec<Bytes>) {
        if self.open.take().is_some() {
            frames.push(Self::frame(&StreamEvent::ContentBlockStop { index: self.next_block - 1 }));
        }
    }

    fn open(&mut self, kind: OpenBlock, block: ContentBlock, frames: &mut Vec<Bytes>) -> u32 {
        if self.open == Some(kind) {
            return self.next_block - 1;
        }
        self.close(frames);
        let index = self.next_block;
        self.next_block += 1;
        self.open = Some(kind);
        frames.push(Self::frame(&StreamEvent::ContentBlockStart { index, content_block: block }));
        index
    }
}

impl ClientEncoder for ClaudeStreamEncoder {
    fn encode(&mut self, chunk: &ChatStreamChunk) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if self.id.is_empty() {
            self.id = chunk.id.clone();
        }
        if !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }
        let Some(choice) = chunk.choices.first() else {
            return frames;
        };
        self.start(&mut frames);
        let delta = &choice.delta;

        if let Some(thinking) = delta.reasoning_content.as_ref().filter(|t| !t.is_empty()) {
            let block = ContentBlock::Thinking { thinking: String::new(), signature: String::new() };
            let index = self.open(OpenBlock::Thinking, block, &mut frames);
            let delta = BlockDelta::ThinkingDelta { thinking: thinking.clone() };
            frames.push(Self::frame(&StreamEvent::ContentBlockDelta { index, delta }));
        }
        if let Some(text) = delta.content.as_ref().filter(|t| !t.is_empty()) {
            let index = self.open(OpenBlock::Text, ContentBlock::Text { text: String::new() }, &mut frames);
            let delta = BlockDelta::TextDelta { text: text.clone() };
            frames.push(Self::frame(&StreamEvent::ContentBlockDelta { index, delta }));
        }
        for call in delta.tool_calls.iter().flatten() {
            let tool_index = call.index.unwrap_or(0);
            let index = if !call.id.is_empty() || self.open != Some(OpenBlock::Tool(tool_index)) {
                let block = ContentBlock::ToolUse { id: call.id.clone(), name: call.function.name.clone(), input: json!({}) };
                self.close(&mut frames);
                self.open(OpenBlock::Tool(tool_index), block, &mut frames)
            } else {
                self.next_block - 1
            };
            if !call.function.arguments.is_empty() {
                let delta = BlockDelta::InputJsonDelta { partial_json: call.function.arguments.clone() };
                frames.push(Self::frame(&StreamEvent::ContentBlockDelta { index, delta }));
            }
        }
        if let Some(reason) = &choice.finish_reason {
            self.stop_reason = Some(openai_finish_to_anthropic(reason));
        }
        frames
    }

    fn finish(&mut self, usage: &Usage) -> Vec<Bytes> {
        let mut frames = Vec::new();
        self.start(&mut frames);
        self.close(&mut frames);
        let delta = MessageDeltaBody {
            stop_reason: Some(self.stop_reason.clone().unwrap_or_else(|| "end_turn".to_string())),
            stop_sequence: None,
        };
        frames.push(Self::frame(&StreamEvent::MessageDelta { delta, usage: Some(openai_usage_to_claude(usage)) }));
        frames.push(Self::frame(&StreamEvent::MessageStop));
        frames
    }

    fn error(&mut self, err: &RelayError) -> Vec<Bytes> {
        vec![Self::frame(&StreamEvent::Error { error: json!({"type": err.code, "message": err.message}) })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(frames: &[Bytes]) -> Vec<String> {
        let mut decoder = crate::utils::sse::SseDecoder::new();
        frames
            .iter()
            .flat_map(|f| decoder.feed(f))
            .map(|e| e.event.unwrap_or_default())
            .collect()
    }

    #[test]
    fn request_to_chat_and_back() {
        let req: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "system": [{"type": "text", "text": "be brief"}],
            "max_tokens": 100,
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [{"type": "tool_use", "id": "t1", "name": "get_weather", "input": {"city": "Paris"}}]},
                {"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "sunny"}]}
            ],
            "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}],
            "tool_choice": {"type": "any"}
        }))
        .unwrap();
        let chat = claude_to_chat(req);
        assert_eq!(chat.messages[0].role, "system");
        assert_eq!(chat.messages[2].tool_calls.as_ref().unwrap()[0].function.name, "get_weather");
        assert_eq!(chat.messages[3].role, "tool");
        assert_eq!(chat.messages[3].tool_call_id.as_deref(), Some("t1"));
        assert_eq!(chat.tool_choice, Some(json!("required")));

        let back = chat_to_claude(chat);
        assert_eq!(back.system, Some(json!("be brief")));
        assert_eq!(back.messages.len(), 3);
        assert!(matches!(back.messages[2].content.blocks()[0], ContentBlock::ToolResult { .. }));
        assert_eq!(back.tool_choice, Some(json!({"type": "any"})));
    }

    #[test]
    fn chat_to_claude_merges_roles_and_defaults_max_tokens() {
        let chat = ChatRequest {
            model: "claude".into(),
            messages: vec![
                Message::text("system", "s"),
                Message::text("user", "a"),
                Message::text("user", "b"),
                Message {
                    role: "user".into(),
                    content: Some(MessageContent::Parts(vec![ContentPart::image("data:image/png;base64,AAA")])),
                    ..Default::default()
                },
            ],
            reasoning_effort: Some("medium".into()),
            temperature: Some(0.3),
            ..Default::default()
        };
        let claude = chat_to_claude(chat);
        assert_eq!(claude.messages.len(), 1);
        assert_eq!(claude.messages[0].content.blocks().len(), 3);
        assert_eq!(claude.thinking, Some(json!({"type": "enabled", "budget_tokens": 8192})));
        assert_eq!(claude.max_tokens, Some(8192 + DEFAULT_MAX_TOKENS));
        assert!(claude.temperature.is_none());
        let chat = ChatRequest { messages: vec![Message::text("user", "x")], ..Default::default() };
        assert_eq!(chat_to_claude(chat).max_tokens, Some(DEFAULT_MAX_TOKENS));
    }

    #[test]
    fn response_usage_counts_cache() {
        let resp: ClaudeResponse = serde_json::from_value(json!({
            "id": "msg_1", "model": "claude", "stop_reason": "tool_use",
            "content": [{"type": "thinking", "thinking": "hm", "signature": "s"}, {"type": "text", "text": "ok"},
                        {"type": "tool_use", "id": "t", "name": "f", "input": {}}],
            "usage": {"input_tokens": 10, "output_tokens": 5, "cache_read_input_tokens": 20}
        }))
        .unwrap();
        let chat = claude_response_to_chat(resp);
        let usage = chat.usage.clone().unwrap();
        assert_eq!((usage.prompt_tokens, usage.cached_tokens(), usage.total_tokens), (30, 20, 35));
        assert_eq!(chat.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(chat.choices[0].message.reasoning_content.as_deref(), Some("hm"));

        let back = chat_response_to_claude(chat);
        assert_eq!(back.usage.input_tokens, 10);
        assert_eq!(back.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(back.content.len(), 3);
    }

    #[test]
    fn stream_decoder_tracks_tools_and_usage() {
        let mut decoder = ClaudeStreamDecoder::new();
        let frames = [
            r#"{"type":"message_start","message":{"id":"m1","model":"claude","content":[],"usage":{"input_tokens":12,"output_tokens":0}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t1","name":"f","input":{}}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a\":1}"}}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
            r#"{"type":"message_stop"}"#,
        ];
        let chunks: Vec<ChatStreamChunk> = frames
            .iter()
            .flat_map(|f| decoder.decode(&SseEvent::data(*f)).unwrap())
            .collect();
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("Hi"));
        let call = &chunks[3].choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!((call.index, call.function.arguments.as_str()), (Some(0), "{\"a\":1}"));
        let last = chunks.last().unwrap();
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(last.usage.as_ref().unwrap().total_tokens, 21);
        assert!(decoder.decode(&SseEvent::data(r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#)).is_err());
    }

    #[test]
    fn stream_encoder_emits_well_formed_sequence() {
        let mut encoder = ClaudeStreamEncoder::new("claude");
        let mut frames = Vec::new();
        let chunk = |delta: Delta, finish: Option<&str>| {
            ChatStreamChunk::new("c1", "claude", 0).with_delta(delta, finish.map(str::to_string))
        };
        frames.extend(encoder.encode(&chunk(Delta { reasoning_content: Some("think".into()), ..Default::default() }, None)));
        frames.extend(encoder.encode(&chunk(Delta { content: Some("answer".into()), ..Default::default() }, None)));
        frames.extend(encoder.encode(&chunk(Delta::default(), Some("stop"))));
        frames.extend(encoder.finish(&Usage::new(5, 6)));
        assert_eq!(
            events(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        let text = String::from_utf8(frames[7].to_vec()).unwrap();
        assert!(text.contains("\"output_tokens\":6"));
        assert!(text.contains("end_turn"));
    }

    #[test]
    fn cut_stream_ends_with_an_error_event() {
        let mut encoder = ClaudeStreamEncoder::new("claude-sonnet-4-5");
        let frames = encoder.error(&RelayError::stream_timeout());
        assert_eq!(events(&frames), ["error"]);
        let text = String::from_utf8(frames[0].to_vec()).unwrap();
        assert!(text.contains("\"type\":\"stream_timeout\""), "{text}");
    }
}
