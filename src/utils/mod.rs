use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use cyder_tools::snow_flake::Snowflake;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{json, Value};

pub mod auth;
pub mod i18n;
pub mod sse;

#[derive(Debug, Serialize)]
pub struct HttpResult<T> {
    pub code: usize,
    pub data: T,
}

impl<T> HttpResult<T> {
    pub fn new(data: T) -> HttpResult<T> {
        HttpResult { code: 0, data }
    }
}

impl<T> IntoResponse for HttpResult<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Turns on `stream_options.include_usage` for a streaming body and reports
/// whether the client had asked for it itself.
pub fn force_stream_usage(data: &mut Value) -> bool {
    let is_stream = data.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if !is_stream {
        return false;
    }
    let requested = data
        .pointer("/stream_options/include_usage")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    match data.get_mut("stream_options") {
        Some(Value::Object(options)) => {
            options.insert("include_usage".to_string(), Value::Bool(true));
        }
        _ => data["stream_options"] = json!({ "include_usage": true }),
    }
    requested
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub static ID_GENERATOR: Lazy<Snowflake> = Lazy::new(|| Snowflake::new(1));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_usage_is_forced_on() {
        let mut body = json!({"model": "gpt-4o", "stream": true});
        assert!(!force_stream_usage(&mut body));
        assert_eq!(body["stream_options"]["include_usage"], json!(true));

        let mut body = json!({"stream": true, "stream_options": {"include_usage": true}});
        assert!(force_stream_usage(&mut body));

        let mut body = json!({"stream": false});
        assert!(!force_stream_usage(&mut body));
        assert!(body.get("stream_options").is_none());
    }
}
