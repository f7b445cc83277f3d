//! Streaming pumps. The pump runs in its own task so settlement happens even
//! when the client goes away mid-stream.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use cyder_tools::log::{debug, warn};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::tokenizer::estimate_completion;
use crate::bridge::thinking::ThinkingToContent;
use crate::bridge::{ClientEncoder, StreamDecoder};
use crate::controller::error::RelayError;
use crate::dto::openai::{
    ChatResponse, ChatStreamChunk, Choice, Delta, FunctionCall, Message, MessageContent, ToolCall, Usage,
};
use crate::utils::sse::{SseDecoder, SseEvent};

#[derive(Debug, Clone, Copy)]
pub struct StreamTiming {
    /// Longest gap between two upstream reads.
    pub idle: Duration,
    pub hard_cap: Duration,
}

/// How upstream frames reach the client.
pub enum Pipeline {
    /// Decode into chat chunks and re-encode in the client dialect.
    Transcode {
        decoder: Box<dyn StreamDecoder>,
        encoder: Box<dyn ClientEncoder>,
        thinking: Option<ThinkingToContent>,
    },
    /// Forward frames untouched; decode only to observe usage.
    Passthrough {
        decoder: Box<dyn StreamDecoder>,
        /// Drop usage-only frames the client did not ask for.
        strip_usage_frames: bool,
    },
}

/// What one stream produced, for settlement.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    /// Latest usage reported upstream. The terminal frame wins.
    pub usage: Option<Usage>,
    pub text: String,
    pub tool_calls: usize,
    pub frames: usize,
    pub first_frame_ms: Option<i64>,
    pub error: Option<RelayError>,
    pub client_gone: bool,
}

impl StreamOutcome {
    fn observe(&mut self, chunk: &ChatStreamChunk, tools: &mut BTreeMap<(u32, u32), ()>) {
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }
        for choice in &chunk.choices {
            let delta = &choice.delta;
            if let Some(content) = &delta.content {
                self.text.push_str(content);
            }
            if let Some(reasoning) = &delta.reasoning_content {
                self.text.push_str(reasoning);
            }
            for call in delta.tool_calls.iter().flatten() {
                tools.insert((choice.index, call.index.unwrap_or(0)), ());
                self.text.push_str(&call.function.name);
                self.text.push_str(&call.function.arguments);
            }
        }
        self.tool_calls = tools.len();
    }

    /// Usage to bill. Estimated from the observed text when the upstream sent none.
    pub fn final_usage(&self, prompt_tokens: i64) -> Usage {
        billable_usage(self.usage.as_ref(), prompt_tokens, &self.text, self.tool_calls)
    }

    pub fn is_estimated(&self) -> bool {
        self.usage.as_ref().map_or(true, Usage::is_empty)
    }
}

/// Reported usage with the prompt filled in, or an estimate when there is none.
pub fn billable_usage(reported: Option<&Usage>, prompt_tokens: i64, text: &str, tool_calls: usize) -> Usage {
    match reported {
        Some(usage) if !usage.is_empty() => {
            let mut usage = usage.clone();
            if usage.prompt_tokens == 0 {
                usage.prompt_tokens = prompt_tokens;
            }
            usage.normalize();
            usage
        }
        _ => Usage::new(prompt_tokens, estimate_completion(text, tool_calls)),
    }
}

/// Client body fed by the pump task.
pub fn receiver_body(mut rx: mpsc::Receiver<Bytes>) -> Body {
    let stream = async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            yield Ok::<_, std::io::Error>(frame);
        }
    };
    Body::from_stream(stream)
}

struct Sink<'a> {
    tx: &'a mpsc::Sender<Bytes>,
    gone: bool,
}

impl Sink<'_> {
    async fn send_all(&mut self, frames: Vec<Bytes>) {
        for frame in frames {
            if self.gone || frame.is_empty() {
                continue;
            }
            if self.tx.send(frame).await.is_err() {
                self.gone = true;
            }
        }
    }
}

/// Reads the upstream body as an event stream, applying the idle timer and the hard cap.
async fn next_events(
    body: &mut (impl futures::Stream<Item = reqwest::Result<Bytes>> + Unpin),
    sse: &mut SseDecoder,
    timing: StreamTiming,
    deadline: Instant,
) -> Result<Option<Vec<SseEvent>>, RelayError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(RelayError::stream_timeout());
    }
    let wait = timing.idle.min(deadline - now);
    match tokio::time::timeout(wait, body.next()).await {
        Err(_) => Err(RelayError::stream_timeout()),
        Ok(None) => Ok(None),
        Ok(Some(Err(e))) => Err(RelayError::upstream_transport(e.to_string())),
        Ok(Some(Ok(bytes))) => Ok(Some(sse.feed(&bytes))),
    }
}

/// Drives one upstream stream to the client. Returns once the upstream ends,
/// fails, times out, or the client disconnects.
pub async fn pump(
    response: reqwest::Response,
    mut pipeline: Pipeline,
    timing: StreamTiming,
    tx: mpsc::Sender<Bytes>,
    prompt_estimate: i64,
    started: std::time::Instant,
) -> StreamOutcome {
    let mut outcome = StreamOutcome::default();
    let mut tools = BTreeMap::new();
    let mut sink = Sink { tx: &tx, gone: false };
    let mut sse = SseDecoder::new();
    let mut body = Box::pin(response.bytes_stream());
    let deadline = Instant::now() + timing.hard_cap;

    let mut upstream_done = false;
    while !upstream_done && !sink.gone {
        let events = match next_events(&mut body, &mut sse, timing, deadline).await {
            Ok(Some(events)) => events,
            Ok(None) => {
                upstream_done = true;
                sse.finish().into_iter().collect()
            }
            Err(err) => {
                warn!("stream ended early: {}", err);
                outcome.error = Some(err);
                break;
            }
        };
        for event in events {
            if outcome.first_frame_ms.is_none() {
                outcome.first_frame_ms = Some(started.elapsed().as_millis() as i64);
            }
            outcome.frames += 1;
            match &mut pipeline {
                Pipeline::Transcode { decoder, encoder, thinking } => {
                    let chunks = match decoder.decode(&event) {
                        Ok(chunks) => chunks,
                        Err(err) => {
                            warn!("upstream stream error: {}", err);
                            outcome.error = Some(err);
                            upstream_done = true;
                            break;
                        }
                    };
                    for mut chunk in chunks {
                        outcome.observe(&chunk, &mut tools);
                        if let Some(thinking) = thinking.as_mut() {
                            thinking.apply(&mut chunk);
                        }
                        sink.send_all(encoder.encode(&chunk)).await;
                    }
                }
                Pipeline::Passthrough { decoder, strip_usage_frames } => {
                    let mut usage_only = false;
                    match decoder.decode(&event) {
                        Ok(chunks) => {
                            for chunk in &chunks {
                                outcome.observe(chunk, &mut tools);
                            }
                            usage_only = !chunks.is_empty()
                                && chunks.iter().all(|c| c.choices.is_empty() && c.usage.is_some());
                        }
                        Err(err) => debug!("unparsed passthrough frame: {}", err),
                    }
                    if !(usage_only && *strip_usage_frames) {
                        sink.send_all(vec![event.to_bytes()]).await;
                    }
                }
            }
        }
    }
    outcome.client_gone = sink.gone;

    if let Pipeline::Transcode { encoder, thinking, .. } = &mut pipeline {
        if let Some(closing) = thinking.as_mut().and_then(ThinkingToContent::finish) {
            let chunk = ChatStreamChunk::new("", "", 0)
                .with_delta(Delta { content: Some(closing), ..Default::default() }, None);
            sink.send_all(encoder.encode(&chunk)).await;
        }
        if let Some(err) = &outcome.error {
            sink.send_all(encoder.error(err)).await;
        }
        let usage = outcome.final_usage(prompt_estimate);
        sink.send_all(encoder.finish(&usage)).await;
    }
    outcome
}

/// Folds chat chunks back into one response.
#[derive(Debug, Default)]
pub struct ChunkAggregator {
    id: String,
    model: String,
    created: i64,
    text: String,
    reasoning: String,
    tools: BTreeMap<u32, ToolCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl ChunkAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &ChatStreamChunk) {
        if self.id.is_empty() {
            self.id = chunk.id.clone();
        }
        if !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }
        if self.created == 0 {
            self.created = chunk.created;
        }
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }
        for choice in chunk.choices.iter().filter(|c| c.index == 0) {
            let delta = &choice.delta;
            if let Some(content) = &delta.content {
                self.text.push_str(content);
            }
            if let Some(reasoning) = &delta.reasoning_content {
                self.reasoning.push_str(reasoning);
            }
            for call in delta.tool_calls.iter().flatten() {
                let slot = self.tools.entry(call.index.unwrap_or(0)).or_insert_with(|| ToolCall {
                    kind: "function".into(),
                    function: FunctionCall::default(),
                    ..Default::default()
                });
                if !call.id.is_empty() {
                    slot.id = call.id.clone();
                }
                if !call.function.name.is_empty() {
                    slot.function.name = call.function.name.clone();
                }
                slot.function.arguments.push_str(&call.function.arguments);
            }
            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }
    }

    pub fn into_response(self) -> ChatResponse {
        let tool_calls: Vec<ToolCall> = self.tools.into_values().collect();
        ChatResponse {
            id: self.id,
            object: "chat.completion".into(),
            created: self.created,
            model: self.model,
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: "assistant".into(),
                    content: Some(MessageContent::Text(self.text)),
                    reasoning_content: (!self.reasoning.is_empty()).then_some(self.reasoning),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    ..Default::default()
                },
                finish_reason: Some(self.finish_reason.unwrap_or_else(|| "stop".into())),
            }],
            usage: self.usage,
            system_fingerprint: None,
        }
    }
}

/// Buffers a stream the client did not ask for into one response.
pub async fn collect(
    response: reqwest::Response,
    mut decoder: Box<dyn StreamDecoder>,
    timing: StreamTiming,
) -> Result<ChatResponse, RelayError> {
    let mut aggregator = ChunkAggregator::new();
    let mut sse = SseDecoder::new();
    let mut body = Box::pin(response.bytes_stream());
    let deadline = Instant::now() + timing.hard_cap;
    loop {
        let events = match next_events(&mut body, &mut sse, timing, deadline).await? {
            Some(events) => events,
            None => {
                for event in sse.finish() {
                    decoder.decode(&event)?.iter().for_each(|c| aggregator.push(c));
                }
                break;
            }
        };
        for event in events {
            decoder.decode(&event)?.iter().for_each(|c| aggregator.push(c));
        }
    }
    let mut response = aggregator.into_response();
    if let Some(usage) = response.usage.as_mut() {
        usage.normalize();
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{OpenAiStreamDecoder, OpenAiStreamEncoder};

    fn delta_chunk(delta: Delta, finish: Option<&str>) -> ChatStreamChunk {
        ChatStreamChunk::new("c", "m", 1).with_delta(delta, finish.map(str::to_string))
    }

    #[test]
    fn aggregator_merges_tool_fragments() {
        let mut aggregator = ChunkAggregator::new();
        aggregator.push(&delta_chunk(Delta { content: Some("Hel".into()), ..Default::default() }, None));
        aggregator.push(&delta_chunk(Delta { content: Some("lo".into()), ..Default::default() }, None));
        let call = |id: &str, name: &str, args: &str| ToolCall {
            index: Some(0),
            id: id.into(),
            kind: "function".into(),
            function: FunctionCall { name: name.into(), arguments: args.into() },
        };
        aggregator.push(&delta_chunk(Delta { tool_calls: Some(vec![call("t1", "f", "{\"a\"")]), ..Default::default() }, None));
        aggregator.push(&delta_chunk(Delta { tool_calls: Some(vec![call("", "", ":1}")]), ..Default::default() }, Some("tool_calls")));
        aggregator.push(&ChatStreamChunk::usage_only("c", "m", 1, Usage::new(4, 6)));
        let response = aggregator.into_response();
        assert_eq!(response.first_text(), "Hello");
        let calls = response.choices[0].message.tool_calls.clone().unwrap();
        assert_eq!(calls[0].id, "t1");
        assert_eq!(calls[0].function.arguments, "{\"a\":1}");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(response.usage.unwrap().total_tokens, 10);
    }

    #[test]
    fn outcome_prefers_reported_usage() {
        let mut outcome = StreamOutcome::default();
        let mut tools = BTreeMap::new();
        outcome.observe(&delta_chunk(Delta { content: Some("abcdefgh".into()), ..Default::default() }, None), &mut tools);
        assert!(outcome.is_estimated());
        assert_eq!(outcome.final_usage(5), Usage::new(5, 2));

        let call = ToolCall { index: Some(0), function: FunctionCall { name: "f".into(), arguments: "{}".into() }, ..Default::default() };
        outcome.observe(&delta_chunk(Delta { tool_calls: Some(vec![call]), ..Default::default() }, None), &mut tools);
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(outcome.final_usage(5).completion_tokens, 3 + 7);

        outcome.observe(&ChatStreamChunk::usage_only("c", "m", 1, Usage::new(9, 3)), &mut tools);
        assert!(!outcome.is_estimated());
        assert_eq!(outcome.final_usage(5), Usage::new(9, 3));
    }

    /// Serves a canned event stream over a local socket.
    async fn upstream(body: &'static str, hang: bool) -> reqwest::Response {
        use axum::routing::get;
        let app = axum::Router::new().route(
            "/",
            get(move || async move {
                let stream = async_stream::stream! {
                    yield Ok::<_, std::io::Error>(Bytes::from_static(body.as_bytes()));
                    if hang {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                };
                Body::from_stream(stream)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        reqwest::get(format!("http://{addr}/")).await.unwrap()
    }

    fn timing(idle_ms: u64) -> StreamTiming {
        StreamTiming { idle: Duration::from_millis(idle_ms), hard_cap: Duration::from_secs(5) }
    }

    async fn drain(mut rx: mpsc::Receiver<Bytes>) -> String {
        let mut out = String::new();
        while let Some(frame) = rx.recv().await {
            out.push_str(&String::from_utf8_lossy(&frame));
        }
        out
    }

    #[tokio::test]
    async fn transcode_pump_appends_final_usage() {
        let body = "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\n\
                    data: {\"id\":\"c\",\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1,\"total_tokens\":4}}\n\n\
                    data: [DONE]\n\n";
        let response = upstream(body, false).await;
        let (tx, rx) = mpsc::channel(16);
        let pipeline = Pipeline::Transcode {
            decoder: Box::new(OpenAiStreamDecoder),
            encoder: Box::new(OpenAiStreamEncoder::new(true, "gpt-4o")),
            thinking: None,
        };
        let outcome = pump(response, pipeline, timing(2000), tx, 0, std::time::Instant::now()).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.final_usage(0).total_tokens, 4);
        let text = drain(rx).await;
        let frames: Vec<&str> = text.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[1].contains("\"total_tokens\":4"));
        assert_eq!(frames[2], "data: [DONE]");
    }

    #[tokio::test]
    async fn idle_upstream_times_out() {
        let body = "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"abcd\"}}]}\n\n";
        let response = upstream(body, true).await;
        let (tx, rx) = mpsc::channel(16);
        let pipeline = Pipeline::Passthrough { decoder: Box::new(OpenAiStreamDecoder), strip_usage_frames: false };
        let outcome = pump(response, pipeline, timing(200), tx, 2, std::time::Instant::now()).await;
        assert_eq!(outcome.error.as_ref().map(|e| e.code.clone()), Some("stream_timeout".to_string()));
        assert_eq!(outcome.final_usage(2), Usage::new(2, 1));
        assert!(drain(rx).await.contains("abcd"));
    }

    #[tokio::test]
    async fn truncated_transcode_reports_the_error_before_done() {
        let body = "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"abcd\"}}]}\n\n";
        let response = upstream(body, true).await;
        let (tx, rx) = mpsc::channel(16);
        let pipeline = Pipeline::Transcode {
            decoder: Box::new(OpenAiStreamDecoder),
            encoder: Box::new(OpenAiStreamEncoder::new(false, "gpt-4o")),
            thinking: None,
        };
        let outcome = pump(response, pipeline, timing(200), tx, 2, std::time::Instant::now()).await;
        assert_eq!(outcome.error.map(|e| e.code), Some("stream_timeout".to_string()));
        let text = drain(rx).await;
        let error_at = text.find("\"code\":\"stream_timeout\"").unwrap();
        let done_at = text.find("[DONE]").unwrap();
        assert!(text.find("abcd").unwrap() < error_at);
        assert!(error_at < done_at);
    }
}
