use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub stream: Option<bool>,
    pub stream_options: Option<StreamOptions>,
    pub max_tokens: Option<u64>,
    pub max_completion_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub n: Option<u32>,
    pub stop: Option<Value>,
    pub seed: Option<i64>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub tools: Option<Vec<Tool>>,
    pub tool_choice: Option<Value>,
    pub parallel_tool_calls: Option<bool>,
    pub reasoning_effort: Option<String>,
    pub response_format: Option<Value>,
    pub metadata: Option<Value>,
    pub store: Option<bool>,
    pub user: Option<String>,
    /// Fields this relay does not interpret, forwarded untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn max_output_tokens(&self) -> Option<u64> {
        self.max_completion_tokens.or(self.max_tokens)
    }

    pub fn include_usage(&self) -> bool {
        self.stream_options.as_ref().is_some_and(|o| o.include_usage)
    }

    /// All prompt text, used for estimation and word filtering.
    pub fn prompt_text(&self) -> String {
        let mut text = String::new();
        for message in &self.messages {
            if let Some(content) = &message.content {
                text.push_str(&content.text());
                text.push('\n');
            }
        }
        if let Some(tools) = &self.tools {
            for tool in tools {
                text.push_str(&tool.function.name);
                if let Some(description) = &tool.function.description {
                    text.push_str(description);
                }
            }
        }
        text
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: Option<MessageContent>,
    pub name: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(MessageContent::Text(text.into())),
            ..Default::default()
        }
    }

    pub fn content_text(&self) -> String {
        self.content.as_ref().map(MessageContent::text).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn parts(&self) -> Vec<ContentPart> {
        match self {
            MessageContent::Text(text) => vec![ContentPart::text(text.clone())],
            MessageContent::Parts(parts) => parts.clone(),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: Option<String>,
    pub image_url: Option<ImageUrl>,
    pub input_audio: Option<Value>,
    pub file: Option<Value>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self {
            kind: "image_url".to_string(),
            image_url: Some(ImageUrl { url: url.into(), detail: None }),
            ..Default::default()
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
    pub detail: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Present on stream deltas only.
    pub index: Option<u32>,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    #[serde(default)]
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Option<Value>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    pub prompt_tokens_details: Option<PromptTokensDetails>,
    pub completion_tokens_details: Option<CompletionTokensDetails>,
    /// DeepSeek reports cache hits here; folded into `prompt_tokens_details`.
    #[serde(default, skip_serializing_if = "always")]
    pub prompt_cache_hit_tokens: Option<i64>,
}

fn always<T>(_: &T) -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionTokensDetails {
    #[serde(default)]
    pub reasoning_tokens: i64,
}

impl Usage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            ..Default::default()
        }
    }

    pub fn cached_tokens(&self) -> i64 {
        self.prompt_tokens_details.as_ref().map_or(0, |d| d.cached_tokens)
    }

    pub fn reasoning_tokens(&self) -> i64 {
        self.completion_tokens_details.as_ref().map_or(0, |d| d.reasoning_tokens)
    }

    pub fn set_cached_tokens(&mut self, cached: i64) {
        self.prompt_tokens_details = Some(PromptTokensDetails { cached_tokens: cached });
    }

    pub fn set_reasoning_tokens(&mut self, reasoning: i64) {
        self.completion_tokens_details = Some(CompletionTokensDetails { reasoning_tokens: reasoning });
    }

    /// Folds vendor cache counters into the standard field and repairs totals.
    /// When the total exceeds `prompt + completion`, reasoning tokens were
    /// reported outside the completion count and are added to it.
    pub fn normalize(&mut self) {
        if let Some(hit) = self.prompt_cache_hit_tokens.take() {
            if hit > 0 && self.cached_tokens() == 0 {
                self.set_cached_tokens(hit);
            }
        }
        let reasoning = self.reasoning_tokens();
        // Gemini-style upstreams count thoughts in the total but not in completion_tokens.
        if reasoning > 0 && self.prompt_tokens + self.completion_tokens < self.total_tokens {
            self.completion_tokens += reasoning;
        }
        if self.total_tokens < self.prompt_tokens + self.completion_tokens {
            self.total_tokens = self.prompt_tokens + self.completion_tokens;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default = "chat_completion_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
    pub system_fingerprint: Option<String>,
}

fn chat_completion_object() -> String {
    "chat.completion".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl ChatResponse {
    pub fn first_text(&self) -> String {
        self.choices.first().map(|c| c.message.content_text()).unwrap_or_default()
    }

    pub fn completion_text(&self) -> String {
        let mut text = String::new();
        for choice in &self.choices {
            text.push_str(&choice.message.content_text());
            if let Some(reasoning) = &choice.message.reasoning_content {
                text.push_str(reasoning);
            }
            for call in choice.message.tool_calls.iter().flatten() {
                text.push_str(&call.function.name);
                text.push_str(&call.function.arguments);
            }
        }
        text
    }

    pub fn tool_call_count(&self) -> usize {
        self.choices
            .iter()
            .map(|c| c.message.tool_calls.as_ref().map_or(0, Vec::len))
            .sum()
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatStreamChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default = "chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    pub usage: Option<Usage>,
}

fn chunk_object() -> String {
    "chat.completion.chunk".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Delta {
    pub role: Option<String>,
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatStreamChunk {
    pub fn new(id: &str, model: &str, created: i64) -> Self {
        Self {
            id: id.to_string(),
            object: chunk_object(),
            created,
            model: model.to_string(),
            choices: Vec::new(),
            usage: None,
        }
    }

    pub fn with_delta(mut self, delta: Delta, finish_reason: Option<String>) -> Self {
        self.choices.push(ChunkChoice { index: 0, delta, finish_reason });
        self
    }

    pub fn usage_only(id: &str, model: &str, created: i64, usage: Usage) -> Self {
        let mut chunk = Self::new(id, model, created);
        chunk.usage = Some(usage);
        chunk
    }
}

/// Legacy `/v1/completions` body, only inspected for validation and estimation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: Value,
    pub max_tokens: Option<u64>,
    pub stream: Option<bool>,
}

/// Shared by embeddings and moderations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input: Value,
}
