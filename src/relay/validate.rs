//! Request checks that run before routing. None of them is retried.

use serde_json::Value;

use crate::controller::error::RelayError;
use crate::database::token::Token;
use crate::dto::openai::ChatRequest;
use crate::schema::enum_def::RelayMode;
use crate::utils::i18n::Msg;

const MAX_TOKENS_LIMIT: u64 = (i32::MAX / 2) as u64;

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

pub fn check_max_tokens(max_tokens: Option<u64>) -> Result<(), RelayError> {
    match max_tokens {
        Some(n) if n > MAX_TOKENS_LIMIT => {
            Err(RelayError::invalid_request_msg(Msg::MaxTokensTooLarge).with_param("max_tokens"))
        }
        _ => Ok(()),
    }
}

pub fn validate_chat(req: &ChatRequest) -> Result<(), RelayError> {
    if req.model.is_empty() {
        return Err(RelayError::invalid_request_msg(Msg::ModelRequired).with_param("model"));
    }
    if req.messages.is_empty() {
        return Err(RelayError::invalid_request_msg(Msg::MessagesRequired).with_param("messages"));
    }
    check_max_tokens(req.max_output_tokens())
}

/// Field checks for the JSON bodies of the directive routes.
pub fn validate_body(mode: RelayMode, body: &Value) -> Result<(), RelayError> {
    match mode {
        RelayMode::Completions if is_blank(body.get("prompt")) => {
            Err(RelayError::invalid_request_msg(Msg::PromptRequired).with_param("prompt"))
        }
        RelayMode::Embeddings | RelayMode::Moderations if is_blank(body.get("input")) => {
            Err(RelayError::invalid_request_msg(Msg::InputRequired).with_param("input"))
        }
        _ => check_max_tokens(body.get("max_tokens").and_then(Value::as_u64)),
    }
}

/// First configured word found in `text`, compared case-insensitively.
pub fn find_sensitive<'a>(words: &'a [String], text: &str) -> Option<&'a str> {
    if words.is_empty() {
        return None;
    }
    let haystack = text.to_lowercase();
    words
        .iter()
        .filter(|w| !w.is_empty())
        .find(|w| haystack.contains(&w.to_lowercase()))
        .map(String::as_str)
}

pub fn check_sensitive(words: &[String], text: &str) -> Result<(), RelayError> {
    match find_sensitive(words, text) {
        Some(word) => Err(RelayError::sensitive_words(word)),
        None => Ok(()),
    }
}

pub fn authorize_model(token: &Token, model: &str) -> Result<(), RelayError> {
    if token.allows_model(model) {
        Ok(())
    } else {
        Err(RelayError::forbidden_model(model))
    }
}
