use reqwest::header::HeaderMap;
use serde_json::Value;

use super::{base_url, header, Adaptor, Dialect};
use crate::bridge::gemini::chat_to_gemini;
use crate::controller::error::RelayError;
use crate::dto::openai::ChatRequest;
use crate::relay::info::RelayInfo;
use crate::schema::enum_def::{ApiType, ChannelType, RelayFormat, RelayMode};

const DEFAULT_VERSION: &str = "v1beta";
const MODELS: &[&str] = &["gemini-2.5-pro", "gemini-2.5-flash", "gemini-2.0-flash"];

/// Google Generative Language API.
pub struct GeminiAdaptor;

impl Adaptor for GeminiAdaptor {
    fn api_type(&self) -> ApiType {
        ApiType::Gemini
    }

    fn channel_name(&self) -> &'static str {
        "gemini"
    }

    fn model_list(&self) -> &'static [&'static str] {
        MODELS
    }

    fn supports(&self, mode: RelayMode) -> bool {
        matches!(mode, RelayMode::ChatCompletions | RelayMode::Responses | RelayMode::Passthrough)
    }

    fn default_base_url(&self, _channel_type: ChannelType) -> &'static str {
        "https://generativelanguage.googleapis.com"
    }

    fn dialect(&self, _format: RelayFormat, _mode: RelayMode) -> Dialect {
        Dialect::Gemini
    }

    fn request_url(&self, info: &RelayInfo, _dialect: Dialect) -> Result<String, RelayError> {
        let base = base_url(self, info);
        if info.mode == RelayMode::Passthrough {
            return Ok(format!("{}/{}", base, info.action.trim_start_matches('/')));
        }
        let version = info.settings.api_version.as_deref().unwrap_or(DEFAULT_VERSION);
        let action = if info.is_stream { "streamGenerateContent?alt=sse" } else { "generateContent" };
        Ok(format!("{base}/{version}/models/{}:{action}", info.upstream_model))
    }

    fn setup_headers(&self, headers: &mut HeaderMap, info: &RelayInfo) -> Result<(), RelayError> {
        let (name, value) = header("x-goog-api-key", &info.api_key)?;
        headers.insert(name, value);
        Ok(())
    }

    fn convert_chat(&self, req: ChatRequest, _info: &RelayInfo) -> Result<Value, RelayError> {
        Ok(serde_json::to_value(chat_to_gemini(&req))?)
    }

    /// The model travels in the URL.
    fn finalize_native(&self, _body: &mut Value, _info: &RelayInfo) -> Result<(), RelayError> {
        Ok(())
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

    #[test]
    fn url_carries_model_and_stream_action() {
        let auth = AuthContext { user: User::default(), token: Arc::new(Token::default()), using_group: "default".into() };
        let mut info = RelayInfo::new(&auth, RelayMode::ChatCompletions, RelayFormat::Gemini, "gemini-2.5-pro");
        info.bind_channel(&Channel { channel_type: ChannelType::Gemini, key: "gk".into(), ..Default::default() });
        let adaptor = GeminiAdaptor;
        assert_eq!(
            adaptor.request_url(&info, Dialect::Gemini).unwrap(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:generateContent"
        );
        info.is_stream = true;
        info.upstream_model = "gemini-2.5-flash".into();
        assert!(adaptor
            .request_url(&info, Dialect::Gemini)
            .unwrap()
            .ends_with("/models/gemini-2.5-flash:streamGenerateContent?alt=sse"));

        let mut body = serde_json::json!({"contents": []});
        adaptor.finalize_native(&mut body, &info).unwrap();
        assert!(body.get("model").is_none());
    }
}
