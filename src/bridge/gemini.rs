use std::collections::HashMap;

use bytes::Bytes;
use serde_json::{json, Value};

use super::{
    budget_to_effort, effort_to_budget, gemini_finish_to_openai, openai_finish_to_gemini, parse_data_url,
    ClientEncoder, StreamDecoder,
};
use crate::controller::error::RelayError;
use crate::dto::gemini::{
    Blob, Candidate, Content, FileData, FunctionCallPart, FunctionDeclaration, FunctionResponsePart, GeminiRequest,
    GeminiResponse, GeminiTool, GenerationConfig, Part, UsageMetadata,
};
use crate::dto::openai::{
    ChatRequest, ChatResponse, ChatStreamChunk, Choice, ContentPart, Delta, FunctionCall, FunctionDefinition,
    Message, MessageContent, StreamOptions, Tool, ToolCall, Usage,
};
use crate::utils::sse::{json_frame, SseEvent};
use crate::utils::{now_secs, ID_GENERATOR};

fn call_id() -> String {
    format!("call_{}", ID_GENERATOR.generate_id())
}

fn usage_from_metadata(meta: &UsageMetadata) -> Usage {
    let thoughts = meta.thoughts_token_count.unwrap_or(0);
    let mut usage = Usage {
        prompt_tokens: meta.prompt_token_count,
        completion_tokens: meta.candidates_token_count + thoughts,
        total_tokens: meta.total_token_count,
        ..Default::default()
    };
    if thoughts > 0 {
        usage.set_reasoning_tokens(thoughts);
    }
    if let Some(cached) = meta.cached_content_token_count.filter(|c| *c > 0) {
        usage.set_cached_tokens(cached);
    }
    usage.normalize();
    usage
}

fn metadata_from_usage(usage: &Usage) -> UsageMetadata {
    let thoughts = usage.reasoning_tokens();
    UsageMetadata {
        prompt_token_count: usage.prompt_tokens,
        candidates_token_count: usage.completion_tokens - thoughts,
        total_token_count: usage.total_tokens,
        thoughts_token_count: (thoughts > 0).then_some(thoughts),
        cached_content_token_count: (usage.cached_tokens() > 0).then(|| usage.cached_tokens()),
    }
}

fn content_text(content: &Content) -> String {
    content.parts.iter().filter_map(|p| p.text.as_deref()).collect()
}

/// Gemini `generateContent` body into the chat hub. The model comes from the path.
pub fn gemini_to_chat(req: GeminiRequest, model: &str, stream: bool) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = req.system_instruction.as_ref().map(content_text).filter(|s| !s.is_empty()) {
        messages.push(Message::text("system", system));
    }

    // function name -> ids of calls not yet answered, matched in order
    let mut pending: HashMap<String, Vec<String>> = HashMap::new();
    for content in req.contents {
        let is_model = content.role.as_deref() == Some("model");
        let mut parts = Vec::new();
        let mut reasoning = String::new();
        let mut calls = Vec::new();
        for part in content.parts {
            if let Some(call) = part.function_call {
                let id = call_id();
                pending.entry(call.name.clone()).or_default().push(id.clone());
                calls.push(ToolCall {
                    index: None,
                    id,
                    kind: "function".into(),
                    function: FunctionCall { name: call.name, arguments: call.args.to_string() },
                });
            } else if let Some(response) = part.function_response {
                let id = pending
                    .get_mut(&response.name)
                    .filter(|ids| !ids.is_empty())
                    .map(|ids| ids.remove(0))
                    .unwrap_or_else(|| response.name.clone());
                messages.push(Message {
                    role: "tool".into(),
                    content: Some(MessageContent::Text(response.response.to_string())),
                    tool_call_id: Some(id),
                    name: Some(response.name),
                    ..Default::default()
                });
            } else if let Some(text) = part.text {
                if is_model && part.thought.unwrap_or(false) {
                    reasoning.push_str(&text);
                } else {
                    parts.push(ContentPart::text(text));
                }
            } else if let Some(blob) = part.inline_data {
                parts.push(ContentPart::image(format!("data:{};base64,{}", blob.mime_type, blob.data)));
            } else if let Some(file) = part.file_data {
                parts.push(ContentPart::image(file.file_uri));
            }
        }
        if parts.is_empty() && calls.is_empty() && reasoning.is_empty() {
            continue;
        }
        let content = match parts.as_slice() {
            [] => None,
            [only] if only.kind == "text" => Some(MessageContent::Text(only.text.clone().unwrap_or_default())),
            _ => Some(MessageContent::Parts(parts)),
        };
        messages.push(Message {
            role: if is_model { "assistant" } else { "user" }.into(),
            content,
            reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
            tool_calls: (!calls.is_empty()).then_some(calls),
            ..Default::default()
        });
    }

    let config = req.generation_config.unwrap_or_default();
    let tools: Vec<Tool> = req
        .tools
        .iter()
        .flatten()
        .flat_map(|t| t.function_declarations.iter().flatten())
        .map(|d| Tool {
            kind: "function".into(),
            function: FunctionDefinition { name: d.name.clone(), description: d.description.clone(), parameters: d.parameters.clone() },
        })
        .collect();
    let tool_choice = req
        .tool_config
        .as_ref()
        .and_then(|c| c.pointer("/functionCallingConfig/mode").or_else(|| c.pointer("/function_calling_config/mode")))
        .and_then(Value::as_str)
        .and_then(|mode| match mode {
            "AUTO" => Some(json!("auto")),
            "ANY" => Some(json!("required")),
            "NONE" => Some(json!("none")),
            _ => None,
        });
    let reasoning_effort = config
        .thinking_config
        .as_ref()
        .and_then(|t| t.get("thinkingBudget").or_else(|| t.get("thinking_budget")))
        .and_then(Value::as_u64)
        .filter(|b| *b > 0)
        .map(|b| budget_to_effort(b).to_string());
    let response_format = config
        .response_mime_type
        .as_deref()
        .filter(|m| *m == "application/json")
        .map(|_| json!({"type": "json_object"}));

    ChatRequest {
        model: model.to_string(),
        messages,
        stream: Some(stream),
        stream_options: stream.then_some(StreamOptions { include_usage: true }),
        max_tokens: config.max_output_tokens,
        temperature: config.temperature,
        top_p: config.top_p,
        n: config.candidate_count,
        stop: config.stop_sequences.map(|s| json!(s)),
        seed: config.seed,
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice,
        reasoning_effort,
        response_format,
        ..Default::default()
    }
}

/// Drops JSON-schema keywords Gemini rejects.
fn clean_schema(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("$schema");
            map.remove("additionalProperties");
            map.remove("strict");
            map.values_mut().for_each(clean_schema);
        }
        Value::Array(items) => items.iter_mut().for_each(clean_schema),
        _ => {}
    }
}

fn push_content(contents: &mut Vec<Content>, role: &str, parts: Vec<Part>) {
    if parts.is_empty() {
        return;
    }
    if let Some(last) = contents.last_mut().filter(|c| c.role.as_deref() == Some(role)) {
        last.parts.extend(parts);
        return;
    }
    contents.push(Content { role: Some(role.to_string()), parts });
}

fn image_part(url: &str) -> Part {
    match parse_data_url(url) {
        Some((mime_type, data)) => Part { inline_data: Some(Blob { mime_type, data }), ..Default::default() },
        None => {
            let mime_type = match url.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
                Some("png") => "image/png",
                Some("webp") => "image/webp",
                Some("gif") => "image/gif",
                Some("pdf") => "application/pdf",
                _ => "image/jpeg",
            };
            Part { file_data: Some(FileData { mime_type: mime_type.into(), file_uri: url.to_string() }), ..Default::default() }
        }
    }
}

/// Chat hub request into a Gemini `generateContent` body.
pub fn chat_to_gemini(req: &ChatRequest) -> GeminiRequest {
    let mut system = Vec::new();
    let mut contents = Vec::new();
    let mut call_names: HashMap<String, String> = HashMap::new();

    for message in &req.messages {
        match message.role.as_str() {
            "system" | "developer" => system.push(message.content_text()),
            "assistant" => {
                let mut parts = Vec::new();
                let text = message.content_text();
                if !text.is_empty() {
                    parts.push(Part::text(text));
                }
                for call in message.tool_calls.iter().flatten() {
                    call_names.insert(call.id.clone(), call.function.name.clone());
                    let args = serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
                    parts.push(Part {
                        function_call: Some(FunctionCallPart { name: call.function.name.clone(), args }),
                        ..Default::default()
                    });
                }
                push_content(&mut contents, "model", parts);
            }
            "tool" => {
                let id = message.tool_call_id.clone().unwrap_or_default();
                let name = call_names.get(&id).cloned().or_else(|| message.name.clone()).unwrap_or(id);
                let text = message.content_text();
                let response = match serde_json::from_str::<Value>(&text) {
                    Ok(Value::Object(map)) => Value::Object(map),
                    _ => json!({ "content": text }),
                };
                let part = Part { function_response: Some(FunctionResponsePart { name, response }), ..Default::default() };
                push_content(&mut contents, "user", vec![part]);
            }
            _ => {
                let parts = message
                    .content
                    .as_ref()
                    .map(MessageContent::parts)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|part| match (part.text, part.image_url) {
                        (Some(text), _) if !text.is_empty() => Some(Part::text(text)),
                        (_, Some(image)) => Some(image_part(&image.url)),
                        _ => None,
                    })
                    .collect();
                push_content(&mut contents, "user", parts);
            }
        }
    }

    let declarations: Vec<FunctionDeclaration> = req
        .tools
        .iter()
        .flatten()
        .map(|t| {
            let mut parameters = t.function.parameters.clone();
            if let Some(p) = parameters.as_mut() {
                clean_schema(p);
            }
            FunctionDeclaration { name: t.function.name.clone(), description: t.function.description.clone(), parameters }
        })
        .collect();
    let tool_config = req.tool_choice.as_ref().and_then(|choice| {
        let (mode, names) = match choice {
            Value::String(s) if s == "auto" => ("AUTO", None),
            Value::String(s) if s == "required" => ("ANY", None),
            Value::String(s) if s == "none" => ("NONE", None),
            Value::Object(_) => ("ANY", Some(vec![choice.pointer("/function/name")?.clone()])),
            _ => return None,
        };
        let mut config = json!({"functionCallingConfig": {"mode": mode}});
        if let Some(names) = names {
            config["functionCallingConfig"]["allowedFunctionNames"] = json!(names);
        }
        Some(config)
    });
    let stop_sequences = match &req.stop {
        Some(Value::String(s)) => Some(vec![s.clone()]),
        Some(Value::Array(items)) => Some(items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()),
        _ => None,
    };
    let json_output = req
        .response_format
        .as_ref()
        .and_then(|f| f.get("type"))
        .and_then(Value::as_str)
        .is_some_and(|t| t == "json_object" || t == "json_schema");

    GeminiRequest {
        contents,
        system_instruction: (!system.is_empty())
            .then(|| Content { role: None, parts: vec![Part::text(system.join("\n"))] }),
        generation_config: Some(GenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            max_output_tokens: req.max_output_tokens(),
            stop_sequences,
            candidate_count: req.n,
            response_mime_type: json_output.then(|| "application/json".to_string()),
            thinking_config: req
                .reasoning_effort
                .as_deref()
                .and_then(effort_to_budget)
                .map(|budget| json!({"thinkingBudget": budget, "includeThoughts": true})),
            seed: req.seed,
            ..Default::default()
        }),
        tools: (!declarations.is_empty())
            .then(|| vec![GeminiTool { function_declarations: Some(declarations), ..Default::default() }]),
        tool_config,
        ..Default::default()
    }
}

fn candidate_to_message(candidate: &Candidate) -> (Message, usize) {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut calls = Vec::new();
    for part in candidate.content.iter().flat_map(|c| c.parts.iter()) {
        if let Some(call) = &part.function_call {
            calls.push(ToolCall {
                index: None,
                id: call_id(),
                kind: "function".into(),
                function: FunctionCall { name: call.name.clone(), arguments: call.args.to_string() },
            });
        } else if let Some(t) = &part.text {
            if part.is_thought() {
                reasoning.push_str(t);
            } else {
                text.push_str(t);
            }
        }
    }
    let count = calls.len();
    let message = Message {
        role: "assistant".into(),
        content: Some(MessageContent::Text(text)),
        reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
        tool_calls: (!calls.is_empty()).then_some(calls),
        ..Default::default()
    };
    (message, count)
}

pub fn gemini_response_to_chat(resp: GeminiResponse, model: &str) -> ChatResponse {
    let choices = resp
        .candidates
        .iter()
        .enumerate()
        .map(|(i, candidate)| {
            let (message, calls) = candidate_to_message(candidate);
            Choice {
                index: candidate.index.unwrap_or(i as u32),
                message,
                finish_reason: Some(gemini_finish_to_openai(candidate.finish_reason.as_deref().unwrap_or("STOP"), calls > 0)),
            }
        })
        .collect();
    ChatResponse {
        id: resp.response_id.unwrap_or_else(|| format!("chatcmpl-{}", ID_GENERATOR.generate_id())),
        object: "chat.completion".into(),
        created: now_secs(),
        model: resp.model_version.unwrap_or_else(|| model.to_string()),
        choices,
        usage: resp.usage_metadata.as_ref().map(usage_from_metadata),
        system_fingerprint: None,
    }
}

pub fn chat_response_to_gemini(resp: &ChatResponse) -> GeminiResponse {
    let candidates = resp
        .choices
        .iter()
        .map(|choice| {
            let mut parts = Vec::new();
            if let Some(reasoning) = choice.message.reasoning_content.as_ref().filter(|r| !r.is_empty()) {
                parts.push(Part { text: Some(reasoning.clone()), thought: Some(true), ..Default::default() });
            }
            let text = choice.message.content_text();
            if !text.is_empty() {
                parts.push(Part::text(text));
            }
            for call in choice.message.tool_calls.iter().flatten() {
                let args = serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
                parts.push(Part { function_call: Some(FunctionCallPart { name: call.function.name.clone(), args }), ..Default::default() });
            }
            Candidate {
                content: Some(Content { role: Some("model".into()), parts }),
                finish_reason: Some(openai_finish_to_gemini(choice.finish_reason.as_deref().unwrap_or("stop"))),
                index: Some(choice.index),
            }
        })
        .collect();
    GeminiResponse {
        candidates,
        usage_metadata: resp.usage.as_ref().map(metadata_from_usage),
        model_version: Some(resp.model.clone()),
        response_id: Some(resp.id.clone()),
    }
}

/// `alt=sse` frames, each a partial `GenerateContentResponse`.
#[derive(Debug)]
pub struct GeminiStreamDecoder {
    id: String,
    model: String,
    created: i64,
    next_tool: u32,
}

impl GeminiStreamDecoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", ID_GENERATOR.generate_id()),
            model: model.to_string(),
            created: now_secs(),
            next_tool: 0,
        }
    }
}

impl StreamDecoder for GeminiStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<ChatStreamChunk>, RelayError> {
        if event.data.trim().is_empty() || event.is_done() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(&event.data)
            .map_err(|e| RelayError::upstream_transport(format!("bad stream frame: {e}")))?;
        if let Some(error) = value.get("error") {
            let message = error.get("message").and_then(Value::as_str).unwrap_or("upstream stream error");
            let status = error.get("code").and_then(Value::as_u64).unwrap_or(500) as u16;
            return Err(RelayError::upstream(status, message, None));
        }
        let resp: GeminiResponse = serde_json::from_value(value)
            .map_err(|e| RelayError::upstream_transport(format!("bad stream frame: {e}")))?;
        if let Some(version) = resp.model_version.as_ref() {
            self.model = version.clone();
        }

        let mut chunk = ChatStreamChunk::new(&self.id, &self.model, self.created);
        if let Some(candidate) = resp.candidates.first() {
            let (message, calls) = candidate_to_message(candidate);
            let tool_calls = message.tool_calls.map(|calls| {
                calls
                    .into_iter()
                    .map(|mut call| {
                        call.index = Some(self.next_tool);
                        self.next_tool += 1;
                        call
                    })
                    .collect()
            });
            let delta = Delta {
                role: Some("assistant".into()),
                content: message.content.map(|c| c.text()).filter(|t| !t.is_empty()),
                reasoning_content: message.reasoning_content,
                tool_calls,
            };
            let finish = candidate
                .finish_reason
                .as_deref()
                .map(|r| gemini_finish_to_openai(r, calls > 0 || self.next_tool > 0));
            chunk = chunk.with_delta(delta, finish);
        }
        chunk.usage = resp.usage_metadata.as_ref().map(usage_from_metadata);
        if chunk.choices.is_empty() && chunk.usage.is_none() {
            return Ok(Vec::new());
        }
        Ok(vec![chunk])
    }
}

/// Chat chunks into Gemini `alt=sse` frames. Tool arguments arrive in pieces
/// on the chat side and are buffered until the call is complete.
pub struct GeminiStreamEncoder {
    model: String,
    id: String,
    tools: Vec<(String, String)>,
    finish: Option<String>,
}

impl GeminiStreamEncoder {
    pub fn new(model: &str) -> Self {
        Self { model: model.to_string(), id: String::new(), tools: Vec::new(), finish: None }
    }

    fn frame(&self, parts: Vec<Part>, finish: Option<String>, usage: Option<UsageMetadata>) -> Bytes {
        let candidates = if parts.is_empty() && finish.is_none() {
            Vec::new()
        } else {
            vec![Candidate { content: Some(Content { role: Some("model".into()), parts }), finish_reason: finish, index: Some(0) }]
        };
        json_frame(&GeminiResponse {
            candidates,
            usage_metadata: usage,
            model_version: Some(self.model.clone()),
            response_id: (!self.id.is_empty()).then(|| self.id.clone()),
        })
    }
}

impl ClientEncoder for GeminiStreamEncoder {
    fn encode(&mut self, chunk: &ChatStreamChunk) -> Vec<Bytes> {
        if self.id.is_empty() {
            self.id = chunk.id.clone();
        }
        let Some(choice) = chunk.choices.first() else {
            return Vec::new();
        };
        let delta = &choice.delta;
        let mut parts = Vec::new();
        if let Some(reasoning) = delta.reasoning_content.as_ref().filter(|r| !r.is_empty()) {
            parts.push(Part { text: Some(reasoning.clone()), thought: Some(true), ..Default::default() });
        }
        if let Some(text) = delta.content.as_ref().filter(|t| !t.is_empty()) {
            parts.push(Part::text(text.clone()));
        }
        for call in delta.tool_calls.iter().flatten() {
            let index = call.index.unwrap_or(0) as usize;
            if self.tools.len() <= index {
                self.tools.resize(index + 1, (String::new(), String::new()));
            }
            let slot = &mut self.tools[index];
            if !call.function.name.is_empty() {
                slot.0 = call.function.name.clone();
            }
            slot.1.push_str(&call.function.arguments);
        }
        if let Some(reason) = &choice.finish_reason {
            self.finish = Some(openai_finish_to_gemini(reason));
        }
        if parts.is_empty() {
            return Vec::new();
        }
        vec![self.frame(parts, None, None)]
    }

    fn finish(&mut self, usage: &Usage) -> Vec<Bytes> {
        let parts = std::mem::take(&mut self.tools)
            .into_iter()
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, args)| {
                let args = serde_json::from_str(&args).unwrap_or_else(|_| json!({}));
                Part { function_call: Some(FunctionCallPart { name, args }), ..Default::default() }
            })
            .collect();
        let finish = self.finish.clone().unwrap_or_else(|| "STOP".to_string());
        vec![self.frame(parts, Some(finish), Some(metadata_from_usage(usage)))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip_keeps_tool_pairing() {
        let req: GeminiRequest = serde_json::from_value(json!({
            "systemInstruction": {"parts": [{"text": "sys"}]},
            "contents": [
                {"role": "user", "parts": [{"text": "weather?"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "get_weather", "response": {"temp": 20}}}]}
            ],
            "generationConfig": {"maxOutputTokens": 64, "thinkingConfig": {"thinkingBudget": 2000}},
            "tools": [{"functionDeclarations": [{"name": "get_weather", "parameters": {"type": "object"}}]}],
            "toolConfig": {"functionCallingConfig": {"mode": "ANY"}}
        }))
        .unwrap();
        let chat = gemini_to_chat(req, "gemini-2.5-pro", false);
        assert_eq!(chat.model, "gemini-2.5-pro");
        assert_eq!(chat.messages.len(), 4);
        let call_id = chat.messages[2].tool_calls.as_ref().unwrap()[0].id.clone();
        assert_eq!(chat.messages[3].tool_call_id.as_deref(), Some(call_id.as_str()));
        assert_eq!(chat.reasoning_effort.as_deref(), Some("medium"));
        assert_eq!(chat.tool_choice, Some(json!("required")));
        assert_eq!(chat.max_tokens, Some(64));

        let back = chat_to_gemini(&chat);
        assert_eq!(back.contents.len(), 3);
        let response = back.contents[2].parts[0].function_response.as_ref().unwrap();
        assert_eq!(response.name, "get_weather");
        assert_eq!(response.response, json!({"temp": 20}));
        assert_eq!(back.system_instruction.unwrap().parts[0].text.as_deref(), Some("sys"));
    }

    #[test]
    fn schemas_are_cleaned_for_gemini() {
        let chat = ChatRequest {
            messages: vec![Message::text("user", "x")],
            tools: Some(vec![Tool {
                kind: "function".into(),
                function: FunctionDefinition {
                    name: "f".into(),
                    description: None,
                    parameters: Some(json!({"$schema": "x", "type": "object", "additionalProperties": false,
                        "properties": {"a": {"type": "object", "additionalProperties": true}}})),
                },
            }]),
            ..Default::default()
        };
        let gemini = chat_to_gemini(&chat);
        let params = gemini.tools.unwrap()[0].function_declarations.as_ref().unwrap()[0].parameters.clone().unwrap();
        assert_eq!(params, json!({"type": "object", "properties": {"a": {"type": "object"}}}));
    }

    #[test]
    fn response_usage_includes_thoughts() {
        let resp: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "plan", "thought": true}, {"text": "done"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5, "thoughtsTokenCount": 7, "totalTokenCount": 22}
        }))
        .unwrap();
        let chat = gemini_response_to_chat(resp, "gemini-2.5-pro");
        let usage = chat.usage.clone().unwrap();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens, usage.total_tokens), (10, 12, 22));
        assert_eq!(chat.first_text(), "done");
        assert_eq!(chat.choices[0].message.reasoning_content.as_deref(), Some("plan"));
        let back = chat_response_to_gemini(&chat);
        assert_eq!(back.usage_metadata.unwrap().candidates_token_count, 5);
    }

    #[test]
    fn stream_decoder_numbers_tool_calls() {
        let mut decoder = GeminiStreamDecoder::new("gemini");
        let first = decoder
            .decode(&SseEvent::data(r#"{"candidates":[{"content":{"parts":[{"text":"Hi"}]}}]}"#))
            .unwrap();
        assert_eq!(first[0].choices[0].delta.content.as_deref(), Some("Hi"));
        let second = decoder
            .decode(&SseEvent::data(
                r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"f","args":{}}}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":2,"totalTokenCount":5}}"#,
            ))
            .unwrap();
        let choice = &second[0].choices[0];
        assert_eq!(choice.delta.tool_calls.as_ref().unwrap()[0].index, Some(0));
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(second[0].usage.as_ref().unwrap().total_tokens, 5);
    }

    #[test]
    fn stream_encoder_buffers_tool_arguments() {
        let mut encoder = GeminiStreamEncoder::new("gemini");
        let call = |id: &str, name: &str, args: &str| ToolCall {
            index: Some(0),
            id: id.into(),
            kind: "function".into(),
            function: FunctionCall { name: name.into(), arguments: args.into() },
        };
        let chunk = |calls| ChatStreamChunk::new("c", "m", 0).with_delta(Delta { tool_calls: Some(calls), ..Default::default() }, None);
        assert!(encoder.encode(&chunk(vec![call("t", "f", "{\"a\"")])).is_empty());
        assert!(encoder.encode(&chunk(vec![call("", "", ":1}")])).is_empty());
        let frames = encoder.finish(&Usage::new(1, 2));
        let text = String::from_utf8(frames[0].to_vec()).unwrap();
        assert!(text.contains(r#""functionCall":{"name":"f","args":{"a":1}}"#));
        assert!(text.contains(r#""finishReason":"STOP""#));
    }
}
