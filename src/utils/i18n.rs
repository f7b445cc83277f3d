use once_cell::sync::OnceCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lang {
    #[default]
    En,
    Zh,
}

impl Lang {
    pub fn parse(code: &str) -> Self {
        let code = code.to_ascii_lowercase();
        if code.starts_with("zh") { Lang::Zh } else { Lang::En }
    }
}

static LANG: OnceCell<Lang> = OnceCell::new();

/// First call wins; later calls are ignored.
pub fn init(code: &str) {
    let _ = LANG.set(Lang::parse(code));
}

pub fn current() -> Lang {
    LANG.get().copied().unwrap_or_default()
}

/// Keys for every user-visible message produced by the relay itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Msg {
    InvalidBody,
    ModelRequired,
    MessagesRequired,
    PromptRequired,
    InputRequired,
    MaxTokensTooLarge,
    TokenMissing,
    TokenInvalid,
    TokenDisabled,
    TokenExpired,
    TokenExhausted,
    UserDisabled,
    ModelNotAllowed,
    GroupNotAllowed,
    UserQuotaInsufficient,
    TokenQuotaInsufficient,
    NoAvailableChannel,
    ModelMappingCycle,
    BlockedByPolicy,
    SensitiveWords,
    UpstreamError,
    UpstreamTimeout,
    StreamTimeout,
    BatchRateLimited,
    BatchTimeout,
    BatchInternal,
    NotSupported,
    InternalError,
    TaskNotFound,
    RedemptionNotFound,
    RedemptionUsed,
    RedemptionDisabled,
    RedemptionExpired,
    AdminRequired,
}

pub fn tr(msg: Msg) -> &'static str {
    tr_in(current(), msg)
}

pub fn tr_in(lang: Lang, msg: Msg) -> &'static str {
    match lang {
        Lang::En => en(msg),
        Lang::Zh => zh(msg),
    }
}

fn en(msg: Msg) -> &'static str {
    match msg {
        Msg::InvalidBody => "invalid request body",
        Msg::ModelRequired => "model is required",
        Msg::MessagesRequired => "messages must not be empty",
        Msg::PromptRequired => "prompt must not be empty",
        Msg::InputRequired => "input must not be empty",
        Msg::MaxTokensTooLarge => "max_tokens is too large",
        Msg::TokenMissing => "no api key provided",
        Msg::TokenInvalid => "invalid api key",
        Msg::TokenDisabled => "api key is disabled",
        Msg::TokenExpired => "api key has expired",
        Msg::TokenExhausted => "api key quota is exhausted",
        Msg::UserDisabled => "user is disabled",
        Msg::ModelNotAllowed => "this api key is not allowed to use the model",
        Msg::GroupNotAllowed => "this api key is not allowed to use the group",
        Msg::UserQuotaInsufficient => "user quota is insufficient",
        Msg::TokenQuotaInsufficient => "api key quota is insufficient",
        Msg::NoAvailableChannel => "no available channel for model",
        Msg::ModelMappingCycle => "model mapping contains a cycle",
        Msg::BlockedByPolicy => "request blocked by channel policy",
        Msg::SensitiveWords => "request contains sensitive words",
        Msg::UpstreamError => "upstream request failed",
        Msg::UpstreamTimeout => "upstream request timed out",
        Msg::StreamTimeout => "upstream stream timed out",
        Msg::BatchRateLimited => "too many items in one batch request",
        Msg::BatchTimeout => "batch request timed out",
        Msg::BatchInternal => "batch request failed",
        Msg::NotSupported => "operation not supported by this channel",
        Msg::InternalError => "internal server error",
        Msg::TaskNotFound => "task not found",
        Msg::RedemptionNotFound => "redemption code not found",
        Msg::RedemptionUsed => "redemption code has already been used",
        Msg::RedemptionDisabled => "redemption code is disabled",
        Msg::RedemptionExpired => "redemption code has expired",
        Msg::AdminRequired => "admin authorization required",
    }
}

fn zh(msg: Msg) -> &'static str {
    match msg {
        Msg::InvalidBody => "请求体格式错误",
        Msg::ModelRequired => "未指定模型",
        Msg::MessagesRequired => "messages 不能为空",
        Msg::PromptRequired => "prompt 不能为空",
        Msg::InputRequired => "input 不能为空",
        Msg::MaxTokensTooLarge => "max_tokens 过大",
        Msg::TokenMissing => "未提供令牌",
        Msg::TokenInvalid => "无效的令牌",
        Msg::TokenDisabled => "令牌已被禁用",
        Msg::TokenExpired => "令牌已过期",
        Msg::TokenExhausted => "令牌额度已用尽",
        Msg::UserDisabled => "用户已被封禁",
        Msg::ModelNotAllowed => "该令牌无权使用此模型",
        Msg::GroupNotAllowed => "该令牌无权使用此分组",
        Msg::UserQuotaInsufficient => "用户额度不足",
        Msg::TokenQuotaInsufficient => "令牌额度不足",
        Msg::NoAvailableChannel => "当前分组下没有可用渠道",
        Msg::ModelMappingCycle => "模型映射存在循环",
        Msg::BlockedByPolicy => "请求被渠道策略拦截",
        Msg::SensitiveWords => "请求包含敏感词",
        Msg::UpstreamError => "上游请求失败",
        Msg::UpstreamTimeout => "上游请求超时",
        Msg::StreamTimeout => "上游流式响应超时",
        Msg::BatchRateLimited => "单次批量请求的条目过多",
        Msg::BatchTimeout => "批量请求超时",
        Msg::BatchInternal => "批量请求失败",
        Msg::NotSupported => "该渠道不支持此操作",
        Msg::InternalError => "服务器内部错误",
        Msg::TaskNotFound => "任务不存在",
        Msg::RedemptionNotFound => "兑换码不存在",
        Msg::RedemptionUsed => "兑换码已被使用",
        Msg::RedemptionDisabled => "兑换码已被禁用",
        Msg::RedemptionExpired => "兑换码已过期",
        Msg::AdminRequired => "需要管理员授权",
    }
}
