use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelType {
    #[default]
    #[serde(rename = "openai")]
    #[strum(serialize = "openai")]
    OpenAi,
    #[serde(rename = "deepseek")]
    #[strum(serialize = "deepseek")]
    DeepSeek,
    #[serde(rename = "siliconflow")]
    #[strum(serialize = "siliconflow")]
    SiliconFlow,
    Anthropic,
    Gemini,
    Codex,
    Ali,
    TaskRelay,
}

impl ChannelType {
    pub fn api_type(&self) -> ApiType {
        match self {
            ChannelType::OpenAi | ChannelType::DeepSeek | ChannelType::SiliconFlow => ApiType::OpenAi,
            ChannelType::Anthropic => ApiType::Claude,
            ChannelType::Gemini => ApiType::Gemini,
            ChannelType::Codex => ApiType::Codex,
            ChannelType::Ali => ApiType::AliTask,
            ChannelType::TaskRelay => ApiType::RelayTask,
        }
    }
}

/// Upstream protocol family. One adaptor is registered per variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    OpenAi,
    Claude,
    Gemini,
    Codex,
    AliTask,
    RelayTask,
}

impl ApiType {
    pub fn is_task(&self) -> bool {
        matches!(self, ApiType::AliTask | ApiType::RelayTask)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub fn as_i32(&self) -> i32 {
        match self {
            ChannelStatus::Enabled => 1,
            ChannelStatus::ManuallyDisabled => 2,
            ChannelStatus::AutoDisabled => 3,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => ChannelStatus::Enabled,
            3 => ChannelStatus::AutoDisabled,
            _ => ChannelStatus::ManuallyDisabled,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    #[default]
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

impl TokenStatus {
    pub fn as_i32(&self) -> i32 {
        match self {
            TokenStatus::Enabled => 1,
            TokenStatus::Disabled => 2,
            TokenStatus::Expired => 3,
            TokenStatus::Exhausted => 4,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => TokenStatus::Enabled,
            3 => TokenStatus::Expired,
            4 => TokenStatus::Exhausted,
            _ => TokenStatus::Disabled,
        }
    }
}

/// The route family a request arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    Responses,
    ResponsesCompact,
    AudioSpeech,
    AudioTranscription,
    ImagesGenerations,
    ImagesEdits,
    Rerank,
    Passthrough,
    TaskSubmit,
    TaskFetch,
}

impl RelayMode {
    pub fn is_task(&self) -> bool {
        matches!(self, RelayMode::TaskSubmit | RelayMode::TaskFetch)
    }
}

/// Wire dialect spoken by the client, chosen independently of the upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RelayFormat {
    #[default]
    OpenAi,
    Claude,
    Gemini,
    Responses,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    NotStart,
    Submitted,
    InProgress,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    #[default]
    Unknown,
    Topup,
    Consume,
    Manage,
    System,
    Error,
    Refund,
}

impl LogType {
    pub fn as_i32(&self) -> i32 {
        match self {
            LogType::Unknown => 0,
            LogType::Topup => 1,
            LogType::Consume => 2,
            LogType::Manage => 3,
            LogType::System => 4,
            LogType::Error => 5,
            LogType::Refund => 6,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => LogType::Topup,
            2 => LogType::Consume,
            3 => LogType::Manage,
            4 => LogType::System,
            5 => LogType::Error,
            6 => LogType::Refund,
            _ => LogType::Unknown,
        }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QuotaType {
    #[default]
    ByQuota,
    ByCount,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionStatus {
    #[default]
    Enabled,
    Disabled,
    Used,
}

impl RedemptionStatus {
    pub fn as_i32(&self) -> i32 {
        match self {
            RedemptionStatus::Enabled => 1,
            RedemptionStatus::Disabled => 2,
            RedemptionStatus::Used => 3,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => RedemptionStatus::Enabled,
            3 => RedemptionStatus::Used,
            _ => RedemptionStatus::Disabled,
        }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    Active,
    Expired,
    Cancelled,
}
