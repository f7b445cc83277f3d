use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::database::redemption::RedeemError;
use crate::database::DbError;
use crate::utils::i18n::{tr, Msg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Client,
    Quota,
    Routing,
    Upstream,
    Policy,
    Internal,
}

impl ErrorKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ErrorKind::Client => "invalid_request_error",
            ErrorKind::Quota => "insufficient_quota",
            ErrorKind::Routing => "no_available_channel",
            ErrorKind::Upstream => "upstream_error",
            ErrorKind::Policy => "policy_violation",
            ErrorKind::Internal => "server_error",
        }
    }
}

/// Non-standard statuses used by batch calls.
fn batch_status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Every error a relay request can end with. Rendered as the OpenAI error envelope.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct RelayError {
    pub kind: ErrorKind,
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub param: Option<String>,
    pub skip_retry: bool,
    /// Status the upstream answered with, when the error came from one.
    pub upstream_status: Option<u16>,
    /// Upstream error code, e.g. `invalid_api_key`.
    pub upstream_code: Option<String>,
}

impl RelayError {
    pub fn new(kind: ErrorKind, status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            code: code.to_string(),
            message: message.into(),
            param: None,
            skip_retry: !matches!(kind, ErrorKind::Routing | ErrorKind::Upstream),
            upstream_status: None,
            upstream_code: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Client, StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn invalid_request_msg(msg: Msg) -> Self {
        Self::invalid_request(tr(msg))
    }

    pub fn invalid_credential(msg: Msg) -> Self {
        Self::new(ErrorKind::Client, StatusCode::UNAUTHORIZED, "invalid_credential", tr(msg))
    }

    pub fn forbidden_model(model: &str) -> Self {
        Self::invalid_request(format!("{}: {}", tr(Msg::ModelNotAllowed), model)).with_param("model")
    }

    pub fn insufficient_quota(msg: Msg) -> Self {
        Self::new(ErrorKind::Quota, StatusCode::PAYMENT_REQUIRED, "insufficient_quota", tr(msg))
    }

    pub fn no_channel(model: &str, group: &str) -> Self {
        Self::new(
            ErrorKind::Routing,
            StatusCode::NOT_FOUND,
            "no_channel",
            format!("{} {} (group {})", tr(Msg::NoAvailableChannel), model, group),
        )
    }

    pub fn mapping_cycle(model: &str) -> Self {
        Self::new(
            ErrorKind::Client,
            StatusCode::BAD_REQUEST,
            "model_mapping_cycle",
            format!("{}: {}", tr(Msg::ModelMappingCycle), model),
        )
    }

    pub fn blocked_by_policy() -> Self {
        Self::new(ErrorKind::Policy, StatusCode::BAD_REQUEST, "blocked_by_policy", tr(Msg::BlockedByPolicy))
    }

    pub fn sensitive_words(word: &str) -> Self {
        Self::new(
            ErrorKind::Policy,
            StatusCode::BAD_REQUEST,
            "sensitive_words_detected",
            format!("{}: {}", tr(Msg::SensitiveWords), word),
        )
    }

    pub fn concurrent_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, StatusCode::CONFLICT, "concurrent_conflict", message)
    }

    /// An upstream answered with a non-success status.
    pub fn upstream(status: u16, message: impl Into<String>, upstream_code: Option<String>) -> Self {
        let mut err = Self::new(ErrorKind::Upstream, StatusCode::BAD_GATEWAY, "upstream_error", message);
        err.upstream_status = Some(status);
        err.upstream_code = upstream_code;
        err
    }

    pub fn upstream_transport(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Upstream,
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            format!("{}: {}", tr(Msg::UpstreamError), message.into()),
        )
    }

    pub fn upstream_timeout() -> Self {
        Self::new(ErrorKind::Upstream, StatusCode::GATEWAY_TIMEOUT, "upstream_timeout", tr(Msg::UpstreamTimeout))
    }

    pub fn stream_timeout() -> Self {
        Self::new(ErrorKind::Upstream, StatusCode::GATEWAY_TIMEOUT, "stream_timeout", tr(Msg::StreamTimeout))
    }

    /// A batch asked for more items than one call may carry. Answered with 499.
    pub fn rate_limit_batch(limit: usize) -> Self {
        Self::new(
            ErrorKind::Client,
            batch_status(499),
            "rate_limit_batch",
            format!("{} (max {})", tr(Msg::BatchRateLimited), limit),
        )
    }

    /// A batch call ran past its overall deadline. Answered with 598.
    pub fn batch_timeout() -> Self {
        Self::new(ErrorKind::Upstream, batch_status(598), "batch_timeout", tr(Msg::BatchTimeout))
    }

    /// A batch call failed inside the relay. Answered with 599.
    pub fn batch_internal(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Internal,
            batch_status(599),
            "batch_internal",
            format!("{}: {}", tr(Msg::BatchInternal), message.into()),
        )
    }

    pub fn not_supported(what: &str) -> Self {
        Self::new(
            ErrorKind::Client,
            StatusCode::BAD_REQUEST,
            "not_supported",
            format!("{}: {}", tr(Msg::NotSupported), what),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn with_param(mut self, param: &str) -> Self {
        self.param = Some(param.to_string());
        self
    }

    pub fn with_skip_retry(mut self) -> Self {
        self.skip_retry = true;
        self
    }

    pub fn is_retriable(&self) -> bool {
        !self.skip_retry && matches!(self.kind, ErrorKind::Routing | ErrorKind::Upstream)
    }

    /// Upstream failures that should take the channel out of rotation for a while.
    pub fn should_cooldown(&self) -> bool {
        match (self.kind, self.upstream_status) {
            (ErrorKind::Upstream, Some(status)) => status == 429 || status >= 500,
            (ErrorKind::Upstream, None) => true,
            _ => false,
        }
    }

    /// Credential problems that justify disabling the channel.
    pub fn should_disable_channel(&self) -> bool {
        if self.kind != ErrorKind::Upstream {
            return false;
        }
        if self.upstream_status == Some(401) {
            return true;
        }
        matches!(
            self.upstream_code.as_deref(),
            Some("invalid_api_key") | Some("insufficient_quota") | Some("account_deactivated")
        )
    }

    /// Forwards the upstream status instead of the mapped one.
    pub fn pass_through_status(mut self) -> Self {
        if let Some(status) = self.upstream_status.and_then(|s| StatusCode::from_u16(s).ok()) {
            self.status = status;
        }
        self
    }

    pub fn to_body(&self) -> Value {
        json!({
            "error": {
                "message": self.message,
                "type": self.kind.type_name(),
                "param": self.param,
                "code": self.code,
            }
        })
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status, Json(self.to_body())).into_response()
    }
}

impl From<DbError> for RelayError {
    fn from(err: DbError) -> Self {
        RelayError::internal(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::invalid_request(format!("{}: {}", tr(Msg::InvalidBody), err))
    }
}

impl From<RedeemError> for RelayError {
    fn from(err: RedeemError) -> Self {
        let (code, msg) = match err {
            RedeemError::NotFound => ("redemption.not_found", Msg::RedemptionNotFound),
            RedeemError::Used => ("redemption.used", Msg::RedemptionUsed),
            RedeemError::Disabled => ("redemption.disabled", Msg::RedemptionDisabled),
            RedeemError::Expired => ("redemption.expired", Msg::RedemptionExpired),
            RedeemError::Db(db) => return db.into(),
        };
        RelayError::new(ErrorKind::Client, StatusCode::BAD_REQUEST, code, tr(msg))
    }
}

/// Task endpoints answer `{code, message, data}` instead of the OpenAI envelope.
#[derive(Debug)]
pub struct TaskApiError(pub RelayError);

impl From<RelayError> for TaskApiError {
    fn from(err: RelayError) -> Self {
        TaskApiError(err)
    }
}

impl From<DbError> for TaskApiError {
    fn from(err: DbError) -> Self {
        TaskApiError(err.into())
    }
}

impl IntoResponse for TaskApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let body = json!({
            "code": err.code,
            "message": err.message,
            "data": Value::Null,
        });
        (err.status, Json(body)).into_response()
    }
}
