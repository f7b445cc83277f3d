//! Token estimates for pre-consume and for streams that end without usage.

use crate::dto::openai::ChatRequest;

/// Extra tokens charged per tool call when completion usage is estimated.
pub const TOOL_CALL_TOKENS: i64 = 7;
const PER_MESSAGE_TOKENS: i64 = 3;
const PER_IMAGE_TOKENS: i64 = 85;

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xAC00..=0xD7AF | 0xF900..=0xFAFF)
}

/// Roughly one token per CJK character and per four other characters.
pub fn estimate_tokens(text: &str) -> i64 {
    let mut cjk = 0i64;
    let mut other = 0i64;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    cjk + (other + 3) / 4
}

pub fn estimate_chat_prompt(req: &ChatRequest) -> i64 {
    let mut tokens = PER_MESSAGE_TOKENS;
    for message in &req.messages {
        tokens += PER_MESSAGE_TOKENS + estimate_tokens(&message.role);
        if let Some(content) = &message.content {
            tokens += estimate_tokens(&content.text());
            let images = content.parts().iter().filter(|p| p.image_url.is_some()).count() as i64;
            tokens += images * PER_IMAGE_TOKENS;
        }
        for call in message.tool_calls.iter().flatten() {
            tokens += estimate_tokens(&call.function.name) + estimate_tokens(&call.function.arguments);
        }
    }
    if let Some(tools) = &req.tools {
        for tool in tools {
            tokens += estimate_tokens(&tool.function.name);
            if let Some(description) = &tool.function.description {
                tokens += estimate_tokens(description);
            }
            if let Some(parameters) = &tool.function.parameters {
                tokens += estimate_tokens(&parameters.to_string());
            }
        }
    }
    tokens
}

pub fn estimate_completion(text: &str, tool_calls: usize) -> i64 {
    estimate_tokens(text) + TOOL_CALL_TOKENS * tool_calls as i64
}
