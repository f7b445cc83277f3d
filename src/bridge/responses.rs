use std::collections::HashMap;

use bytes::Bytes;
use serde_json::{json, Map, Value};

use super::{ClientEncoder, StreamDecoder};
use crate::controller::error::RelayError;
use crate::dto::openai::{
    ChatRequest, ChatResponse, ChatStreamChunk, Choice, ContentPart, Delta, FunctionCall, FunctionDefinition,
    Message, MessageContent, StreamOptions, Tool, ToolCall, Usage,
};
use crate::dto::responses::{
    InputTokensDetails, OutputContent, OutputItem, OutputTokensDetails, Reasoning, ResponsesRequest,
    ResponsesResponse, ResponsesTool, ResponsesUsage,
};
use crate::utils::sse::{named_json_frame, SseEvent};
use crate::utils::{now_secs, ID_GENERATOR};

fn usage_from_responses(usage: &ResponsesUsage) -> Usage {
    let mut out = Usage::new(usage.input_tokens, usage.output_tokens);
    out.total_tokens = out.total_tokens.max(usage.total_tokens);
    if let Some(cached) = usage.input_tokens_details.as_ref().map(|d| d.cached_tokens).filter(|c| *c > 0) {
        out.set_cached_tokens(cached);
    }
    if let Some(reasoning) = usage.output_tokens_details.as_ref().map(|d| d.reasoning_tokens).filter(|r| *r > 0) {
        out.set_reasoning_tokens(reasoning);
    }
    out.normalize();
    out
}

fn responses_usage(usage: &Usage) -> ResponsesUsage {
    ResponsesUsage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        input_tokens_details: Some(InputTokensDetails { cached_tokens: usage.cached_tokens() }),
        output_tokens_details: Some(OutputTokensDetails { reasoning_tokens: usage.reasoning_tokens() }),
    }
}

fn item_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

fn input_parts(content: &Value) -> Option<MessageContent> {
    let parts = match content {
        Value::String(s) => return Some(MessageContent::Text(s.clone())),
        Value::Array(parts) => parts,
        _ => return None,
    };
    let parts: Vec<ContentPart> = parts
        .iter()
        .filter_map(|part| match part.get("type").and_then(Value::as_str)? {
            "input_text" | "output_text" | "text" => part.get("text").and_then(Value::as_str).map(ContentPart::text),
            "input_image" => {
                let url = part.get("image_url")?;
                let url = url.as_str().or_else(|| url.get("url").and_then(Value::as_str))?;
                Some(ContentPart::image(url))
            }
            _ => None,
        })
        .collect();
    match parts.as_slice() {
        [only] if only.kind == "text" => only.text.clone().map(MessageContent::Text),
        _ => Some(MessageContent::Parts(parts)),
    }
}

/// Responses API body into the chat hub.
pub fn responses_to_chat(req: ResponsesRequest) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(instructions) = req.instructions.as_ref().filter(|i| !i.is_empty()) {
        messages.push(Message::text("system", instructions.clone()));
    }
    match &req.input {
        Some(Value::String(text)) => messages.push(Message::text("user", text.clone())),
        Some(Value::Array(items)) => {
            for item in items {
                let kind = item.get("type").and_then(Value::as_str).unwrap_or("message");
                match kind {
                    "function_call" => {
                        let call = ToolCall {
                            index: None,
                            id: item.get("call_id").and_then(Value::as_str).unwrap_or_default().to_string(),
                            kind: "function".into(),
                            function: FunctionCall {
                                name: item.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                                arguments: item.get("arguments").and_then(Value::as_str).unwrap_or("{}").to_string(),
                            },
                        };
                        match messages.last_mut().filter(|m| m.role == "assistant") {
                            Some(last) => last.tool_calls.get_or_insert_with(Vec::new).push(call),
                            None => messages.push(Message {
                                role: "assistant".into(),
                                tool_calls: Some(vec![call]),
                                ..Default::default()
                            }),
                        }
                    }
                    "function_call_output" => {
                        let output = match item.get("output") {
                            Some(Value::String(s)) => s.clone(),
                            Some(other) => item_text(other),
                            None => String::new(),
                        };
                        messages.push(Message {
                            role: "tool".into(),
                            content: Some(MessageContent::Text(output)),
                            tool_call_id: item.get("call_id").and_then(Value::as_str).map(str::to_string),
                            ..Default::default()
                        });
                    }
                    "message" => {
                        let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
                        messages.push(Message {
                            role: role.to_string(),
                            content: item.get("content").and_then(input_parts),
                            ..Default::default()
                        });
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    let tools: Vec<Tool> = req
        .tools
        .iter()
        .flatten()
        .filter(|t| t.kind == "function")
        .map(|t| Tool {
            kind: "function".into(),
            function: FunctionDefinition {
                name: t.name.clone().unwrap_or_default(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect();
    let tool_choice = req.tool_choice.map(|choice| match choice.get("name") {
        Some(name) if choice.get("type").and_then(Value::as_str) == Some("function") => {
            json!({"type": "function", "function": {"name": name}})
        }
        _ => choice,
    });
    let response_format = req.text.as_ref().and_then(|t| t.get("format")).and_then(|format| {
        match format.get("type").and_then(Value::as_str)? {
            "json_object" => Some(json!({"type": "json_object"})),
            "json_schema" => {
                let mut schema = format.clone();
                if let Some(map) = schema.as_object_mut() {
                    map.remove("type");
                }
                Some(json!({"type": "json_schema", "json_schema": schema}))
            }
            _ => None,
        }
    });
    let stream = req.stream.unwrap_or(false);

    ChatRequest {
        model: req.model,
        messages,
        stream: req.stream,
        stream_options: stream.then_some(StreamOptions { include_usage: true }),
        max_completion_tokens: req.max_output_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice,
        parallel_tool_calls: req.parallel_tool_calls,
        reasoning_effort: req.reasoning.and_then(|r| r.effort),
        response_format,
        metadata: req.metadata,
        store: req.store,
        user: req.user,
        ..Default::default()
    }
}

fn chat_parts_to_input(content: &MessageContent, text_kind: &str) -> Value {
    let parts: Vec<Value> = content
        .parts()
        .into_iter()
        .filter_map(|part| match (part.text, part.image_url) {
            (Some(text), _) => Some(json!({"type": text_kind, "text": text})),
            (_, Some(image)) => Some(json!({"type": "input_image", "image_url": image.url})),
            _ => None,
        })
        .collect();
    Value::Array(parts)
}

/// Chat hub request into a Responses API body.
pub fn chat_to_responses(req: &ChatRequest) -> ResponsesRequest {
    let mut instructions = Vec::new();
    let mut input = Vec::new();
    for message in &req.messages {
        match message.role.as_str() {
            "system" | "developer" => instructions.push(message.content_text()),
            "tool" => input.push(json!({
                "type": "function_call_output",
                "call_id": message.tool_call_id.clone().unwrap_or_default(),
                "output": message.content_text(),
            })),
            "assistant" => {
                let text = message.content_text();
                if !text.is_empty() {
                    input.push(json!({
                        "type": "message",
                        "role": "assistant",
                        "content": [{"type": "output_text", "text": text}],
                    }));
                }
                for call in message.tool_calls.iter().flatten() {
                    input.push(json!({
                        "type": "function_call",
                        "call_id": call.id,
                        "name": call.function.name,
                        "arguments": call.function.arguments,
                    }));
                }
            }
            role => {
                let content = message
                    .content
                    .as_ref()
                    .map(|c| chat_parts_to_input(c, "input_text"))
                    .unwrap_or_else(|| json!([]));
                input.push(json!({"type": "message", "role": role, "content": content}));
            }
        }
    }

    let tools: Vec<ResponsesTool> = req
        .tools
        .iter()
        .flatten()
        .map(|t| ResponsesTool {
            kind: "function".into(),
            name: Some(t.function.name.clone()),
            description: t.function.description.clone(),
            parameters: t.function.parameters.clone(),
            ..Default::default()
        })
        .collect();
    let tool_choice = req.tool_choice.clone().map(|choice| match choice.pointer("/function/name") {
        Some(name) => json!({"type": "function", "name": name}),
        None => choice,
    });
    let text = req.response_format.as_ref().and_then(|format| {
        match format.get("type").and_then(Value::as_str)? {
            "json_object" => Some(json!({"format": {"type": "json_object"}})),
            "json_schema" => {
                let mut schema = format.get("json_schema").cloned().unwrap_or_else(|| json!({}));
                schema.as_object_mut()?.insert("type".into(), json!("json_schema"));
                Some(json!({"format": schema}))
            }
            _ => None,
        }
    });

    ResponsesRequest {
        model: req.model.clone(),
        input: Some(Value::Array(input)),
        instructions: (!instructions.is_empty()).then(|| instructions.join("\n")),
        max_output_tokens: req.max_output_tokens(),
        temperature: req.temperature,
        top_p: req.top_p,
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice,
        parallel_tool_calls: req.parallel_tool_calls,
        reasoning: req
            .reasoning_effort
            .clone()
            .map(|effort| Reasoning { effort: Some(effort), summary: Some("auto".into()) }),
        metadata: req.metadata.clone(),
        store: req.store,
        stream: req.stream,
        text,
        user: req.user.clone(),
        ..Default::default()
    }
}

fn summary_text(item: &OutputItem) -> String {
    item.summary
        .iter()
        .flatten()
        .filter_map(|s| s.text.as_deref())
        .collect()
}

pub fn responses_response_to_chat(resp: ResponsesResponse) -> ChatResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut calls = Vec::new();
    for item in &resp.output {
        match item.kind.as_str() {
            "message" => text.push_str(
                &item
                    .content
                    .iter()
                    .flatten()
                    .filter(|c| c.kind == "output_text")
                    .filter_map(|c| c.text.as_deref())
                    .collect::<String>(),
            ),
            "reasoning" => reasoning.push_str(&summary_text(item)),
            "function_call" => calls.push(ToolCall {
                index: None,
                id: item.call_id.clone().or_else(|| item.id.clone()).unwrap_or_default(),
                kind: "function".into(),
                function: FunctionCall {
                    name: item.name.clone().unwrap_or_default(),
                    arguments: item.arguments.clone().unwrap_or_default(),
                },
            }),
            _ => {}
        }
    }
    let finish_reason = if !calls.is_empty() {
        "tool_calls"
    } else if resp.status.as_deref() == Some("incomplete") {
        "length"
    } else {
        "stop"
    };
    ChatResponse {
        id: resp.id,
        object: "chat.completion".into(),
        created: resp.created_at,
        model: resp.model,
        choices: vec![Choice {
            index: 0,
            message: Message {
                role: "assistant".into(),
                content: Some(MessageContent::Text(text)),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!calls.is_empty()).then_some(calls),
                ..Default::default()
            },
            finish_reason: Some(finish_reason.into()),
        }],
        usage: resp.usage.as_ref().map(usage_from_responses),
        system_fingerprint: None,
    }
}

fn message_item(id: String, text: String) -> OutputItem {
    OutputItem {
        kind: "message".into(),
        id: Some(id),
        status: Some("completed".into()),
        role: Some("assistant".into()),
        content: Some(vec![OutputContent { kind: "output_text".into(), text: Some(text), annotations: Some(Vec::new()) }]),
        ..Default::default()
    }
}

fn reasoning_item(id: String, text: String) -> OutputItem {
    OutputItem {
        kind: "reasoning".into(),
        id: Some(id),
        summary: Some(vec![OutputContent { kind: "summary_text".into(), text: Some(text), annotations: None }]),
        ..Default::default()
    }
}

fn function_item(id: String, call_id: String, name: String, arguments: String) -> OutputItem {
    OutputItem {
        kind: "function_call".into(),
        id: Some(id),
        status: Some("completed".into()),
        call_id: Some(call_id),
        name: Some(name),
        arguments: Some(arguments),
        ..Default::default()
    }
}

pub fn chat_response_to_responses(resp: &ChatResponse) -> ResponsesResponse {
    let mut output = Vec::new();
    let mut status = "completed";
    if let Some(choice) = resp.choices.first() {
        if let Some(reasoning) = choice.message.reasoning_content.as_ref().filter(|r| !r.is_empty()) {
            output.push(reasoning_item(format!("rs_{}", ID_GENERATOR.generate_id()), reasoning.clone()));
        }
        let text = choice.message.content_text();
        if !text.is_empty() {
            output.push(message_item(format!("msg_{}", ID_GENERATOR.generate_id()), text));
        }
        for call in choice.message.tool_calls.iter().flatten() {
            output.push(function_item(
                format!("fc_{}", ID_GENERATOR.generate_id()),
                call.id.clone(),
                call.function.name.clone(),
                call.function.arguments.clone(),
            ));
        }
        if choice.finish_reason.as_deref() == Some("length") {
            status = "incomplete";
        }
    }
    ResponsesResponse {
        id: resp.id.clone(),
        object: "response".into(),
        created_at: resp.created,
        status: Some(status.into()),
        model: resp.model.clone(),
        output,
        usage: resp.usage.as_ref().map(responses_usage),
        ..Default::default()
    }
}

/// Responses event stream into chat chunks.
#[derive(Debug)]
pub struct ResponsesStreamDecoder {
    id: String,
    model: String,
    created: i64,
    /// output_index -> chat tool index
    tools: HashMap<u64, u32>,
}

impl ResponsesStreamDecoder {
    pub fn new(model: &str) -> Self {
        Self { id: String::new(), model: model.to_string(), created: now_secs(), tools: HashMap::new() }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatStreamChunk {
        ChatStreamChunk::new(&self.id, &self.model, self.created).with_delta(delta, finish_reason)
    }
}

impl StreamDecoder for ResponsesStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<ChatStreamChunk>, RelayError> {
        if event.data.trim().is_empty() || event.is_done() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(&event.data)
            .map_err(|e| RelayError::upstream_transport(format!("bad stream frame: {e}")))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .or(event.event.as_deref())
            .unwrap_or_default();
        let text = |key: &str| value.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

        let chunks = match kind {
            "response.created" => {
                if let Some(resp) = value.get("response") {
                    self.id = resp.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                    if let Some(model) = resp.get("model").and_then(Value::as_str) {
                        self.model = model.to_string();
                    }
                }
                vec![self.chunk(Delta { role: Some("assistant".into()), content: Some(String::new()), ..Default::default() }, None)]
            }
            "response.output_text.delta" => {
                vec![self.chunk(Delta { content: Some(text("delta")), ..Default::default() }, None)]
            }
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                vec![self.chunk(Delta { reasoning_content: Some(text("delta")), ..Default::default() }, None)]
            }
            "response.output_item.added" => {
                let item = value.get("item").cloned().unwrap_or_default();
                if item.get("type").and_then(Value::as_str) != Some("function_call") {
                    return Ok(Vec::new());
                }
                let output_index = value.get("output_index").and_then(Value::as_u64).unwrap_or_default();
                let index = self.tools.len() as u32;
                self.tools.insert(output_index, index);
                let call = ToolCall {
                    index: Some(index),
                    id: item.get("call_id").and_then(Value::as_str).unwrap_or_default().to_string(),
                    kind: "function".into(),
                    function: FunctionCall {
                        name: item.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                        arguments: item.get("arguments").and_then(Value::as_str).unwrap_or_default().to_string(),
                    },
                };
                vec![self.chunk(Delta { tool_calls: Some(vec![call]), ..Default::default() }, None)]
            }
            "response.function_call_arguments.delta" => {
                let output_index = value.get("output_index").and_then(Value::as_u64).unwrap_or_default();
                let Some(index) = self.tools.get(&output_index).copied() else {
                    return Ok(Vec::new());
                };
                let call = ToolCall {
                    index: Some(index),
                    function: FunctionCall { name: String::new(), arguments: text("delta") },
                    ..Default::default()
                };
                vec![self.chunk(Delta { tool_calls: Some(vec![call]), ..Default::default() }, None)]
            }
            "response.completed" | "response.incomplete" => {
                let resp: ResponsesResponse = value
                    .get("response")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| RelayError::upstream_transport(format!("bad stream frame: {e}")))?
                    .unwrap_or_default();
                let finish = if !self.tools.is_empty() {
                    "tool_calls"
                } else if kind == "response.incomplete" {
                    "length"
                } else {
                    "stop"
                };
                let mut chunk = self.chunk(Delta::default(), Some(finish.into()));
                chunk.usage = resp.usage.as_ref().map(usage_from_responses);
                vec![chunk]
            }
            "response.failed" | "error" => {
                let error = value
                    .pointer("/response/error")
                    .or_else(|| value.get("error"))
                    .unwrap_or(&value);
                let message = error.get("message").and_then(Value::as_str).unwrap_or("upstream stream error");
                let code = error.get("code").and_then(Value::as_str).map(str::to_string);
                return Err(RelayError::upstream(500, message, code));
            }
            _ => Vec::new(),
        };
        Ok(chunks)
    }
}

enum OpenItem {
    Reasoning { id: String, output_index: u32, text: String },
    Message { id: String, output_index: u32, text: String },
}

struct ToolItem {
    id: String,
    output_index: u32,
    call_id: String,
    name: String,
    arguments: String,
}

/// Chat chunks into the Responses event sequence: `response.created`, item and
/// part lifecycle events with their deltas, then `response.completed`.
pub struct ResponsesStreamEncoder {
    model: String,
    id: String,
    created_at: i64,
    sequence: u64,
    started: bool,
    next_output: u32,
    open: Option<OpenItem>,
    tools: Vec<ToolItem>,
    done: Vec<(u32, OutputItem)>,
    incomplete: bool,
}

impl ResponsesStreamEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            id: format!("resp_{}", ID_GENERATOR.generate_id()),
            created_at: now_secs(),
            sequence: 0,
            started: false,
            next_output: 0,
            open: None,
            tools: Vec::new(),
            done: Vec::new(),
            incomplete: false,
        }
    }

    fn emit(&mut self, kind: &str, body: Value) -> Bytes {
        let mut body = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        body.insert("type".into(), json!(kind));
        body.insert("sequence_number".into(), json!(self.sequence));
        self.sequence += 1;
        named_json_frame(kind, &Value::Object(body))
    }

    fn response(&self, status: &str, output: Vec<OutputItem>, usage: Option<&Usage>) -> ResponsesResponse {
        ResponsesResponse {
            id: self.id.clone(),
            object: "response".into(),
            created_at: self.created_at,
            status: Some(status.into()),
            model: self.model.clone(),
            output,
            usage: usage.map(responses_usage),
            ..Default::default()
        }
    }

    fn start(&mut self, frames: &mut Vec<Bytes>) {
        if self.started {
            return;
        }
        self.started = true;
        let response = self.response("in_progress", Vec::new(), None);
        frames.push(self.emit("response.created", json!({ "response": response })));
        frames.push(self.emit("response.in_progress", json!({ "response": response })));
    }

    fn close_open(&mut self, frames: &mut Vec<Bytes>) {
        match self.open.take() {
            Some(OpenItem::Reasoning { id, output_index, text }) => {
                frames.push(self.emit(
                    "response.reasoning_summary_text.done",
                    json!({"item_id": id, "output_index": output_index, "summary_index": 0, "text": text}),
                ));
                let item = reasoning_item(id, text);
                frames.push(self.emit("response.output_item.done", json!({"output_index": output_index, "item": item})));
                self.done.push((output_index, item));
            }
            Some(OpenItem::Message { id, output_index, text }) => {
                frames.push(self.emit(
                    "response.output_text.done",
                    json!({"item_id": id, "output_index": output_index, "content_index": 0, "text": text}),
                ));
                let part = OutputContent { kind: "output_text".into(), text: Some(text.clone()), annotations: Some(Vec::new()) };
                frames.push(self.emit(
                    "response.content_part.done",
                    json!({"item_id": id, "output_index": output_index, "content_index": 0, "part": part}),
                ));
                let item = message_item(id, text);
                frames.push(self.emit("response.output_item.done", json!({"output_index": output_index, "item": item})));
                self.done.push((output_index, item));
            }
            None => {}
        }
    }

    fn push_reasoning(&mut self, delta: &str, frames: &mut Vec<Bytes>) {
        if !matches!(self.open, Some(OpenItem::Reasoning { .. })) {
            self.close_open(frames);
            let id = format!("rs_{}", ID_GENERATOR.generate_id());
            let output_index = self.next_output;
            self.next_output += 1;
            frames.push(self.emit(
                "response.output_item.added",
                json!({"output_index": output_index, "item": {"type": "reasoning", "id": id, "summary": []}}),
            ));
            frames.push(self.emit(
                "response.reasoning_summary_part.added",
                json!({"item_id": id, "output_index": output_index, "summary_index": 0, "part": {"type": "summary_text", "text": ""}}),
            ));
            self.open = Some(OpenItem::Reasoning { id, output_index, text: String::new() });
        }
        if let Some(OpenItem::Reasoning { id, output_index, text }) = self.open.as_mut() {
            text.push_str(delta);
            let body = json!({"item_id": id, "output_index": output_index, "summary_index": 0, "delta": delta});
            frames.push(self.emit("response.reasoning_summary_text.delta", body));
        }
    }

    fn push_text(&mut self, delta: &str, frames: &mut Vec<Bytes>) {
        if !matches!(self.open, Some(OpenItem::Message { .. })) {
            self.close_open(frames);
            let id = format!("msg_{}", ID_GENERATOR.generate_id());
            let output_index = self.next_output;
            self.next_output += 1;
            frames.push(self.emit(
                "response.output_item.added",
                json!({"output_index": output_index, "item": {"type": "message", "id": id, "status": "in_progress", "role": "assistant", "content": []}}),
            ));
            frames.push(self.emit(
                "response.content_part.added",
                json!({"item_id": id, "output_index": output_index, "content_index": 0, "part": {"type": "output_text", "text": "", "annotations": []}}),
            ));
            self.open = Some(OpenItem::Message { id, output_index, text: String::new() });
        }
        if let Some(OpenItem::Message { id, output_index, text }) = self.open.as_mut() {
            text.push_str(delta);
            let body = json!({"item_id": id, "output_index": output_index, "content_index": 0, "delta": delta});
            frames.push(self.emit("response.output_text.delta", body));
        }
    }

    fn push_tool(&mut self, call: &ToolCall, frames: &mut Vec<Bytes>) {
        let index = call.index.unwrap_or(0) as usize;
        if index >= self.tools.len() {
            self.close_open(frames);
            let item = ToolItem {
                id: format!("fc_{}", ID_GENERATOR.generate_id()),
                output_index: self.next_output,
                call_id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: String::new(),
            };
            self.next_output += 1;
            let added = function_item(item.id.clone(), item.call_id.clone(), item.name.clone(), String::new());
            frames.push(self.emit("response.output_item.added", json!({"output_index": item.output_index, "item": added})));
            self.tools.push(item);
        }
        let Some(tool) = self.tools.get_mut(index) else {
            return;
        };
        if call.function.arguments.is_empty() {
            return;
        }
        tool.arguments.push_str(&call.function.arguments);
        let body = json!({"item_id": tool.id, "output_index": tool.output_index, "delta": call.function.arguments});
        frames.push(self.emit("response.function_call_arguments.delta", body));
    }
}

impl ClientEncoder for ResponsesStreamEncoder {
    fn encode(&mut self, chunk: &ChatStreamChunk) -> Vec<Bytes> {
        let mut frames = Vec::new();
        self.start(&mut frames);
        let Some(choice) = chunk.choices.first() else {
            return frames;
        };
        let delta = &choice.delta;
        if let Some(reasoning) = delta.reasoning_content.as_deref().filter(|r| !r.is_empty()) {
            self.push_reasoning(reasoning, &mut frames);
        }
        if let Some(text) = delta.content.as_deref().filter(|t| !t.is_empty()) {
            self.push_text(text, &mut frames);
        }
        for call in delta.tool_calls.iter().flatten() {
            self.push_tool(call, &mut frames);
        }
        if choice.finish_reason.as_deref() == Some("length") {
            self.incomplete = true;
        }
        frames
    }

    fn finish(&mut self, usage: &Usage) -> Vec<Bytes> {
        let mut frames = Vec::new();
        self.start(&mut frames);
        self.close_open(&mut frames);
        for tool in std::mem::take(&mut self.tools) {
            frames.push(self.emit(
                "response.function_call_arguments.done",
                json!({"item_id": tool.id, "output_index": tool.output_index, "arguments": tool.arguments}),
            ));
            let item = function_item(tool.id, tool.call_id, tool.name, tool.arguments);
            frames.push(self.emit("response.output_item.done", json!({"output_index": tool.output_index, "item": item})));
            self.done.push((tool.output_index, item));
        }
        let mut done = std::mem::take(&mut self.done);
        done.sort_by_key(|(index, _)| *index);
        let output = done.into_iter().map(|(_, item)| item).collect();
        let (kind, status) = if self.incomplete {
            ("response.incomplete", "incomplete")
        } else {
            ("response.completed", "completed")
        };
        let response = self.response(status, output, Some(usage));
        frames.push(self.emit(kind, json!({ "response": response })));
        frames
    }

    fn error(&mut self, err: &RelayError) -> Vec<Bytes> {
        vec![self.emit("error", json!({"code": err.code, "message": err.message, "param": err.param}))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_types(frames: &[Bytes]) -> Vec<String> {
        frames
            .iter()
            .map(|f| {
                let text = String::from_utf8(f.to_vec()).unwrap();
                let data = text.lines().find_map(|l| l.strip_prefix("data: ")).unwrap().to_string();
                let value: Value = serde_json::from_str(&data).unwrap();
                value["type"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[test]
    fn chat_round_trip_keeps_request_fields() {
        let chat: ChatRequest = serde_json::from_value(json!({
            "model": "gpt-5",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "20C"}
            ],
            "tools": [{"type": "function", "function": {"name": "get_weather", "parameters": {"type": "object"}}}],
            "tool_choice": {"type": "function", "function": {"name": "get_weather"}},
            "temperature": 0.2,
            "top_p": 0.9,
            "store": false,
            "metadata": {"k": "v"},
            "reasoning_effort": "high",
            "stream": true
        }))
        .unwrap();
        let responses = chat_to_responses(&chat);
        assert_eq!(responses.instructions.as_deref(), Some("be brief"));
        assert_eq!(responses.tool_choice, Some(json!({"type": "function", "name": "get_weather"})));

        let back = responses_to_chat(responses);
        assert_eq!(back.model, chat.model);
        assert_eq!(back.tools, chat.tools);
        assert_eq!(back.tool_choice, chat.tool_choice);
        assert_eq!(back.temperature, chat.temperature);
        assert_eq!(back.top_p, chat.top_p);
        assert_eq!(back.store, chat.store);
        assert_eq!(back.metadata, chat.metadata);
        assert_eq!(back.reasoning_effort, chat.reasoning_effort);
        assert_eq!(back.stream, chat.stream);
        assert_eq!(back.messages.len(), 4);
        assert_eq!(back.messages[2].tool_calls, chat.messages[2].tool_calls);
        assert_eq!(back.messages[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn response_round_trip_keeps_text_and_usage() {
        let mut usage = Usage::new(30, 12);
        usage.set_cached_tokens(10);
        usage.set_reasoning_tokens(4);
        let chat = ChatResponse {
            id: "resp_1".into(),
            object: "chat.completion".into(),
            created: 7,
            model: "gpt-5".into(),
            choices: vec![Choice {
                index: 0,
                message: Message::text("assistant", "hello"),
                finish_reason: Some("stop".into()),
            }],
            usage: Some(usage.clone()),
            system_fingerprint: None,
        };
        let responses = chat_response_to_responses(&chat);
        assert_eq!(responses.output_text(), "hello");
        let back = responses_response_to_chat(responses);
        assert_eq!(back.first_text(), "hello");
        assert_eq!(back.usage, Some(usage));
        assert_eq!(back.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn stream_decoder_maps_tool_items() {
        let mut decoder = ResponsesStreamDecoder::new("gpt-5");
        let events = [
            r#"{"type":"response.created","response":{"id":"resp_9","model":"gpt-5"}}"#,
            r#"{"type":"response.output_text.delta","delta":"Hi"}"#,
            r#"{"type":"response.output_item.added","output_index":1,"item":{"type":"function_call","call_id":"call_a","name":"f","arguments":""}}"#,
            r#"{"type":"response.function_call_arguments.delta","output_index":1,"delta":"{}"}"#,
            r#"{"type":"response.completed","response":{"usage":{"input_tokens":5,"output_tokens":3,"total_tokens":8}}}"#,
        ];
        let chunks: Vec<ChatStreamChunk> = events
            .iter()
            .flat_map(|data| decoder.decode(&SseEvent::data(*data)).unwrap())
            .collect();
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[1].id, "resp_9");
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("Hi"));
        let call = &chunks[2].choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!((call.index, call.id.as_str()), (Some(0), "call_a"));
        assert_eq!(chunks[3].choices[0].delta.tool_calls.as_ref().unwrap()[0].function.arguments, "{}");
        assert_eq!(chunks[4].choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(chunks[4].usage.as_ref().unwrap().total_tokens, 8);

        let failed = decoder.decode(&SseEvent::data(r#"{"type":"response.failed","response":{"error":{"message":"boom"}}}"#));
        assert!(failed.is_err());
    }

    #[test]
    fn stream_encoder_emits_item_lifecycle() {
        let mut encoder = ResponsesStreamEncoder::new("gpt-5");
        let mut frames = encoder.encode(&ChatStreamChunk::new("c", "gpt-5", 0).with_delta(
            Delta { reasoning_content: Some("think".into()), ..Default::default() },
            None,
        ));
        frames.extend(encoder.encode(&ChatStreamChunk::new("c", "gpt-5", 0).with_delta(
            Delta { content: Some("Hi".into()), ..Default::default() },
            Some("stop".into()),
        )));
        frames.extend(encoder.finish(&Usage::new(2, 3)));
        let types = frame_types(&frames);
        assert_eq!(
            types,
            vec![
                "response.created",
                "response.in_progress",
                "response.output_item.added",
                "response.reasoning_summary_part.added",
                "response.reasoning_summary_text.delta",
                "response.reasoning_summary_text.done",
                "response.output_item.done",
                "response.output_item.added",
                "response.content_part.added",
                "response.output_text.delta",
                "response.output_text.done",
                "response.content_part.done",
                "response.output_item.done",
                "response.completed",
            ]
        );
        let last = String::from_utf8(frames.last().unwrap().to_vec()).unwrap();
        assert!(last.contains("\"sequence_number\":13"));
        assert!(last.contains("\"total_tokens\":5"));
    }
}
