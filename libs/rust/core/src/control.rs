//! Reply envelope shared by the aggregator and node control APIs. Handlers
//! turn every outcome into one of these; nothing propagates past the API.
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::FlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiReply {
    pub status: ReplyStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiReply {
    pub fn ok(message: impl Into<String>) -> (StatusCode, Self) {
        (StatusCode::OK, Self { status: ReplyStatus::Success, message: message.into(), data: None })
    }

    /// Success carrying `data`; a value that fails to serialize is reported as an error.
    pub fn ok_with<T: Serialize>(message: impl Into<String>, data: &T) -> (StatusCode, Self) {
        match serde_json::to_value(data) {
            Ok(value) => (StatusCode::OK, Self { status: ReplyStatus::Success, message: message.into(), data: Some(value) }),
            Err(e) => Self::error(StatusCode::INTERNAL_SERVER_ERROR, format!("encode reply: {e}")),
        }
    }

    pub fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Self) {
        (status, Self { status: ReplyStatus::Error, message: message.into(), data: None })
    }

    pub fn from_error(err: &FlError) -> (StatusCode, Self) {
        let status = err.http_status();
        if status.is_server_error() {
            warn!(error = %err, "control call failed");
        }
        Self::error(status, err.to_string())
    }
}

/// Maps a control result to a reply: `Ok` becomes a success carrying the
/// value, `Err` an error with the status the error calls for.
pub fn reply<T: Serialize>(message: &str, result: Result<T, FlError>) -> (StatusCode, Json<ApiReply>) {
    let (code, body) = match result {
        Ok(value) => ApiReply::ok_with(message, &value),
        Err(e) => ApiReply::from_error(&e),
    };
    (code, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;

    #[test]
    fn success_carries_data() {
        let (code, Json(body)) = reply("registered", Ok::<_, FlError>(vec!["node1"]));
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.status, ReplyStatus::Success);
        assert_eq!(body.data, Some(serde_json::json!(["node1"])));
    }

    #[test]
    fn errors_keep_their_status() {
        let (code, Json(body)) = reply::<()>("registered", Err(RegistryError::AlreadyRegistered("demo".into()).into()));
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body.status, ReplyStatus::Error);
        assert!(body.message.contains("demo"));
        let wire = serde_json::to_value(&body).unwrap();
        assert_eq!(wire["status"], "error");
        assert!(wire.get("data").is_none());
    }
}
