use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{base_url, bearer, header, Adaptor, Dialect};
use crate::bridge::responses::chat_to_responses;
use crate::controller::error::RelayError;
use crate::dto::openai::ChatRequest;
use crate::relay::info::RelayInfo;
use crate::schema::enum_def::{ApiType, ChannelType, RelayFormat, RelayMode};

const MODELS: &[&str] = &["gpt-5", "gpt-5-codex"];
/// Fields the Codex backend rejects.
const UNSUPPORTED_FIELDS: &[&str] = &["max_output_tokens", "temperature", "top_p"];

/// ChatGPT Codex backend. A Responses-compatible upstream that only streams.
pub struct CodexAdaptor;

/// Structured channel key.
#[derive(Debug, Deserialize)]
struct CodexCredential {
    access_token: String,
    #[serde(default)]
    account_id: Option<String>,
}

fn parse_credential(key: &str) -> CodexCredential {
    serde_json::from_str(key).unwrap_or_else(|_| CodexCredential { access_token: key.to_string(), account_id: None })
}

fn prepare_body(body: &mut Value) {
    let Value::Object(map) = body else {
        return;
    };
    map.insert("stream".into(), json!(true));
    map.insert("store".into(), json!(false));
    let has_instructions = map.get("instructions").is_some_and(|v| v.is_string());
    if !has_instructions {
        map.insert("instructions".into(), json!(""));
    }
    for field in UNSUPPORTED_FIELDS {
        map.remove(*field);
    }
}

impl Adaptor for CodexAdaptor {
    fn api_type(&self) -> ApiType {
        ApiType::Codex
    }

    fn channel_name(&self) -> &'static str {
        "codex"
    }

    fn model_list(&self) -> &'static [&'static str] {
        MODELS
    }

    fn supports(&self, mode: RelayMode) -> bool {
        matches!(
            mode,
            RelayMode::ChatCompletions | RelayMode::Responses | RelayMode::ResponsesCompact | RelayMode::Passthrough
        )
    }

    fn default_base_url(&self, _channel_type: ChannelType) -> &'static str {
        "https://chatgpt.com/backend-api/codex"
    }

    fn dialect(&self, _format: RelayFormat, _mode: RelayMode) -> Dialect {
        Dialect::Responses
    }

    fn request_url(&self, info: &RelayInfo, _dialect: Dialect) -> Result<String, RelayError> {
        let base = base_url(self, info);
        Ok(match info.mode {
            RelayMode::Passthrough => format!("{}/{}", base, info.action.trim_start_matches('/')),
            RelayMode::ResponsesCompact => format!("{base}/responses/compact"),
            _ => format!("{base}/responses"),
        })
    }

    fn setup_headers(&self, headers: &mut HeaderMap, info: &RelayInfo) -> Result<(), RelayError> {
        let credential = parse_credential(&info.api_key);
        bearer(headers, &credential.access_token)?;
        if let Some(account) = credential.account_id.as_deref().filter(|a| !a.is_empty()) {
            let (name, value) = header("chatgpt-account-id", account)?;
            headers.insert(name, value);
        }
        for (name, value) in [("openai-beta", "responses=experimental"), ("originator", "codex_cli_rs")] {
            let (name, value) = header(name, value)?;
            headers.insert(name, value);
        }
        Ok(())
    }

    fn convert_chat(&self, mut req: ChatRequest, info: &RelayInfo) -> Result<Value, RelayError> {
        req.model = info.upstream_model.clone();
        let mut body = serde_json::to_value(chat_to_responses(&req))?;
        prepare_body(&mut body);
        Ok(body)
    }

    fn finalize_native(&self, body: &mut Value, info: &RelayInfo) -> Result<(), RelayError> {
        if let Value::Object(map) = body {
            map.insert("model".into(), Value::String(info.upstream_model.clone()));
        }
        if info.mode != RelayMode::Passthrough && info.mode != RelayMode::ResponsesCompact {
            prepare_body(body);
        }
        Ok(())
    }

    fn forces_stream(&self, dialect: Dialect) -> bool {
        dialect == Dialect::Responses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::channel::Channel;
    use crate::database::token::Token;
    use crate::database::user::User;
    use crate::relay::info::AuthContext;
    use std::sync::Arc;

    fn info(key: &str) -> RelayInfo {
        let auth = AuthContext { user: User::default(), token: Arc::new(Token::default()), using_group: "default".into() };
        let mut info = RelayInfo::new(&auth, RelayMode::Responses, RelayFormat::Responses, "gpt-5");
        info.bind_channel(&Channel { channel_type: ChannelType::Codex, key: key.into(), ..Default::default() });
        info
    }

    #[test]
    fn structured_key_sets_account_header() {
        let info = info(r#"{"access_token":"at-1","account_id":"acc-9"}"#);
        let mut headers = HeaderMap::new();
        CodexAdaptor.setup_headers(&mut headers, &info).unwrap();
        assert_eq!(headers["authorization"], "Bearer at-1");
        assert_eq!(headers["chatgpt-account-id"], "acc-9");
        assert_eq!(headers["originator"], "codex_cli_rs");

        let mut headers = HeaderMap::new();
        CodexAdaptor.setup_headers(&mut headers, &self::info("plain-token")).unwrap();
        assert_eq!(headers["authorization"], "Bearer plain-token");
        assert!(headers.get("chatgpt-account-id").is_none());
    }

    #[test]
    fn native_body_is_forced_to_stream_without_store() {
        let info = info("k");
        let mut body = json!({"model": "gpt-5", "input": "hi", "stream": false, "store": true, "max_output_tokens": 10});
        CodexAdaptor.finalize_native(&mut body, &info).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["store"], false);
        assert_eq!(body["instructions"], "");
        assert!(body.get("max_output_tokens").is_none());
        assert_eq!(CodexAdaptor.request_url(&info, Dialect::Responses).unwrap(), "https://chatgpt.com/backend-api/codex/responses");
        assert!(CodexAdaptor.forces_stream(Dialect::Responses));
    }
}
