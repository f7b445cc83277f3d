use std::sync::Arc;
use std::time::Instant;

use crate::database::channel::{Channel, ChannelSettings};
use crate::database::token::Token;
use crate::database::user::User;
use crate::relay::quota::QuotaSource;
use crate::schema::enum_def::{ChannelType, RelayFormat, RelayMode};
use crate::utils::{now_secs, ID_GENERATOR};

/// Identity resolved by the token middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: User,
    pub token: Arc<Token>,
    /// Group the request is billed under: the token's group if set, else the user's.
    pub using_group: String,
}

/// Everything an adaptor needs to know about one attempt of one request.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub request_id: String,
    pub mode: RelayMode,
    pub format: RelayFormat,
    pub origin_model: String,
    pub upstream_model: String,

    pub user_id: i64,
    pub username: String,
    pub user_group: String,
    pub using_group: String,
    pub token_id: i64,
    pub token_name: String,
    pub token_unlimited: bool,

    pub is_stream: bool,
    pub include_usage: bool,
    pub start: Instant,
    pub start_ts: i64,
    pub prompt_tokens: i64,

    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub channel_name: String,
    pub base_url: String,
    pub api_key: String,
    pub settings: ChannelSettings,

    /// Body is forwarded in the client's own dialect.
    pub native: bool,
    pub pre_consumed: i64,
    pub quota_source: QuotaSource,
    /// Trailing path of passthrough and task routes.
    pub action: String,
}

impl RelayInfo {
    pub fn new(auth: &AuthContext, mode: RelayMode, format: RelayFormat, model: &str) -> Self {
        Self {
            request_id: ID_GENERATOR.generate_id().to_string(),
            mode,
            format,
            origin_model: model.to_string(),
            upstream_model: model.to_string(),
            user_id: auth.user.id,
            username: auth.user.username.clone(),
            user_group: auth.user.group.clone(),
            using_group: auth.using_group.clone(),
            token_id: auth.token.id,
            token_name: auth.token.name.clone(),
            token_unlimited: auth.token.unlimited_quota,
            is_stream: false,
            include_usage: false,
            start: Instant::now(),
            start_ts: now_secs(),
            prompt_tokens: 0,
            channel_id: 0,
            channel_type: ChannelType::default(),
            channel_name: String::new(),
            base_url: String::new(),
            api_key: String::new(),
            settings: ChannelSettings::default(),
            native: false,
            pre_consumed: 0,
            quota_source: QuotaSource::Wallet,
            action: String::new(),
        }
    }

    /// Rebinds the attempt to `channel`. The upstream model is set by the caller after mapping.
    pub fn bind_channel(&mut self, channel: &Channel) {
        self.channel_id = channel.id;
        self.channel_type = channel.channel_type;
        self.channel_name = channel.name.clone();
        self.base_url = channel.base_url.trim_end_matches('/').to_string();
        self.api_key = channel.key.clone();
        self.settings = channel.settings.clone();
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }
}
