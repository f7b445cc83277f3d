use reqwest::header::HeaderMap;
use serde_json::Value;

use super::{base_url, bearer, Adaptor, Dialect};
use crate::controller::error::RelayError;
use crate::dto::openai::{ChatRequest, StreamOptions};
use crate::relay::info::RelayInfo;
use crate::schema::enum_def::{ApiType, ChannelType, RelayFormat, RelayMode};

/// OpenAI and the compatible vendors (DeepSeek, SiliconFlow).
pub struct OpenAiAdaptor;

const MODELS: &[&str] = &["gpt-4o", "gpt-4o-mini", "gpt-5", "o3-mini", "text-embedding-3-small", "dall-e-3"];

fn mode_path(mode: RelayMode) -> Option<&'static str> {
    Some(match mode {
        RelayMode::ChatCompletions => "/v1/chat/completions",
        RelayMode::Completions => "/v1/completions",
        RelayMode::Embeddings => "/v1/embeddings",
        RelayMode::Moderations => "/v1/moderations",
        RelayMode::Responses => "/v1/responses",
        RelayMode::ResponsesCompact => "/v1/responses/compact",
        RelayMode::AudioSpeech => "/v1/audio/speech",
        RelayMode::AudioTranscription => "/v1/audio/transcriptions",
        RelayMode::ImagesGenerations => "/v1/images/generations",
        RelayMode::ImagesEdits => "/v1/images/edits",
        RelayMode::Rerank => "/v1/rerank",
        RelayMode::Passthrough | RelayMode::TaskSubmit | RelayMode::TaskFetch => return None,
    })
}

impl Adaptor for OpenAiAdaptor {
    fn api_type(&self) -> ApiType {
        ApiType::OpenAi
    }

    fn channel_name(&self) -> &'static str {
        "openai"
    }

    fn model_list(&self) -> &'static [&'static str] {
        MODELS
    }

    fn supports(&self, mode: RelayMode) -> bool {
        !mode.is_task()
    }

    fn default_base_url(&self, channel_type: ChannelType) -> &'static str {
        match channel_type {
            ChannelType::DeepSeek => "https://api.deepseek.com",
            ChannelType::SiliconFlow => "https://api.siliconflow.cn",
            _ => "https://api.openai.com",
        }
    }

    fn dialect(&self, format: RelayFormat, mode: RelayMode) -> Dialect {
        match (format, mode) {
            (RelayFormat::Responses, _) | (_, RelayMode::Responses | RelayMode::ResponsesCompact) => Dialect::Responses,
            _ => Dialect::Chat,
        }
    }

    fn request_url(&self, info: &RelayInfo, dialect: Dialect) -> Result<String, RelayError> {
        let base = base_url(self, info);
        if info.mode == RelayMode::Passthrough {
            return Ok(format!("{}/{}", base, info.action.trim_start_matches('/')));
        }
        let path = match (info.mode, dialect) {
            (RelayMode::ResponsesCompact, _) => "/v1/responses/compact",
            (_, Dialect::Responses) => "/v1/responses",
            (mode, _) => mode_path(mode).ok_or_else(|| RelayError::not_supported(&info.mode.to_string()))?,
        };
        Ok(format!("{base}{path}"))
    }

    fn setup_headers(&self, headers: &mut HeaderMap, info: &RelayInfo) -> Result<(), RelayError> {
        bearer(headers, &info.api_key)
    }

    fn convert_chat(&self, mut req: ChatRequest, info: &RelayInfo) -> Result<Value, RelayError> {
        req.model = info.upstream_model.clone();
        if req.is_stream() {
            req.stream_options = Some(StreamOptions { include_usage: true });
        }
        Ok(serde_json::to_value(req)?)
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

    fn info(mode: RelayMode, channel_type: ChannelType, base_url: &str) -> RelayInfo {
        let auth = AuthContext { user: User::default(), token: Arc::new(Token::default()), using_group: "default".into() };
        let mut info = RelayInfo::new(&auth, mode, RelayFormat::OpenAi, "gpt-4o");
        info.bind_channel(&Channel { channel_type, base_url: base_url.into(), key: "sk-up".into(), ..Default::default() });
        info
    }

    #[test]
    fn urls_follow_mode_and_vendor() {
        let adaptor = OpenAiAdaptor;
        let chat = info(RelayMode::ChatCompletions, ChannelType::DeepSeek, "");
        assert_eq!(adaptor.request_url(&chat, Dialect::Chat).unwrap(), "https://api.deepseek.com/v1/chat/completions");
        let embed = info(RelayMode::Embeddings, ChannelType::OpenAi, "https://proxy.local/");
        assert_eq!(adaptor.request_url(&embed, Dialect::Chat).unwrap(), "https://proxy.local/v1/embeddings");
        let mut pass = info(RelayMode::Passthrough, ChannelType::OpenAi, "https://up");
        pass.action = "v1/files".into();
        assert_eq!(adaptor.request_url(&pass, Dialect::Chat).unwrap(), "https://up/v1/files");
        assert_eq!(adaptor.dialect(RelayFormat::Responses, RelayMode::Responses), Dialect::Responses);
        assert_eq!(adaptor.dialect(RelayFormat::Claude, RelayMode::ChatCompletions), Dialect::Chat);
    }

    #[test]
    fn streaming_chat_always_asks_for_usage() {
        let adaptor = OpenAiAdaptor;
        let mut info = info(RelayMode::ChatCompletions, ChannelType::OpenAi, "");
        info.upstream_model = "gpt-4o-2024-08-06".into();
        let req = ChatRequest { model: "gpt-4o".into(), stream: Some(true), ..Default::default() };
        let body = adaptor.convert_chat(req, &info).unwrap();
        assert_eq!(body["model"], "gpt-4o-2024-08-06");
        assert_eq!(body["stream_options"]["include_usage"], true);
    }
}
