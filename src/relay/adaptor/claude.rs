use reqwest::header::HeaderMap;
use serde_json::Value;

use super::{base_url, header, Adaptor, Dialect};
use crate::bridge::claude::chat_to_claude;
use crate::controller::error::RelayError;
use crate::dto::openai::ChatRequest;
use crate::relay::info::RelayInfo;
use crate::schema::enum_def::{ApiType, ChannelType, RelayFormat, RelayMode};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MODELS: &[&str] = &["claude-sonnet-4-5", "claude-opus-4-1", "claude-3-5-haiku-latest"];

/// Anthropic Messages API.
pub struct ClaudeAdaptor;

impl Adaptor for ClaudeAdaptor {
    fn api_type(&self) -> ApiType {
        ApiType::Claude
    }

    fn channel_name(&self) -> &'static str {
        "anthropic"
    }

    fn model_list(&self) -> &'static [&'static str] {
        MODELS
    }

    fn supports(&self, mode: RelayMode) -> bool {
        matches!(mode, RelayMode::ChatCompletions | RelayMode::Responses | RelayMode::Passthrough)
    }

    fn default_base_url(&self, _channel_type: ChannelType) -> &'static str {
        "https://api.anthropic.com"
    }

    fn dialect(&self, _format: RelayFormat, _mode: RelayMode) -> Dialect {
        Dialect::Claude
    }

    fn request_url(&self, info: &RelayInfo, _dialect: Dialect) -> Result<String, RelayError> {
        let base = base_url(self, info);
        if info.mode == RelayMode::Passthrough {
            return Ok(format!("{}/{}", base, info.action.trim_start_matches('/')));
        }
        Ok(format!("{base}/v1/messages"))
    }

    fn setup_headers(&self, headers: &mut HeaderMap, info: &RelayInfo) -> Result<(), RelayError> {
        let (name, value) = header("x-api-key", &info.api_key)?;
        headers.insert(name, value);
        let version = info.settings.api_version.as_deref().unwrap_or(ANTHROPIC_VERSION);
        let (name, value) = header("anthropic-version", version)?;
        headers.insert(name, value);
        Ok(())
    }

    fn convert_chat(&self, mut req: ChatRequest, info: &RelayInfo) -> Result<Value, RelayError> {
        req.model = info.upstream_model.clone();
        Ok(serde_json::to_value(chat_to_claude(req))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::channel::Channel;
    use crate::database::token::Token;
    use crate::database::user::User;
    use crate::dto::openai::Message;
    use crate::relay::info::AuthContext;
    use std::sync::Arc;

    #[test]
    fn messages_endpoint_and_headers() {
        let auth = AuthContext { user: User::default(), token: Arc::new(Token::default()), using_group: "default".into() };
        let mut info = RelayInfo::new(&auth, RelayMode::ChatCompletions, RelayFormat::OpenAi, "claude-sonnet-4-5");
        info.bind_channel(&Channel { channel_type: ChannelType::Anthropic, key: "ak".into(), ..Default::default() });
        let adaptor = ClaudeAdaptor;
        assert_eq!(adaptor.request_url(&info, Dialect::Claude).unwrap(), "https://api.anthropic.com/v1/messages");

        let mut headers = HeaderMap::new();
        adaptor.setup_headers(&mut headers, &info).unwrap();
        assert_eq!(headers["x-api-key"], "ak");
        assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);

        let req = ChatRequest { messages: vec![Message::text("system", "s"), Message::text("user", "hi")], ..Default::default() };
        let body = adaptor.convert_chat(req, &info).unwrap();
        assert_eq!(body["model"], "claude-sonnet-4-5");
        assert_eq!(body["system"], "s");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }
}
