//! Error taxonomy shared by the HTTP surface, the orchestrator and adapters.
//!
//! Every user-visible failure is an [`ApiError`]. Module-local errors
//! (`GuacdError`, `SshError`, ...) convert into it at the orchestrator
//! boundary so the control loop only ever deals with one type.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced to clients and written as farewell lines on session end.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Bad Request: You do not have {perm} permission")]
    NoPerm { perm: String },
    #[error("Bad Request: Argument is invalid, {err}")]
    InvalidArgument { err: String },
    #[error("Bad Request: Invalid session id {session_id}")]
    InvalidSessionId { session_id: String },
    #[error("Connect Server Error: {err}")]
    ConnectServer { err: String },
    #[error("Bad Request: current time is not allowed to access")]
    AccessTime,
    #[error("Bad Request: idle timeout more than {seconds} seconds")]
    IdleTimeout { seconds: u64 },
    #[error("Session has been closed by admin {admin}")]
    AdminClose { admin: String },
    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn no_perm(perm: impl Into<String>) -> Self {
        Self::NoPerm { perm: perm.into() }
    }

    pub fn invalid_argument(err: impl ToString) -> Self {
        Self::InvalidArgument {
            err: err.to_string(),
        }
    }

    pub fn connect_server(err: impl ToString) -> Self {
        Self::ConnectServer {
            err: err.to_string(),
        }
    }

    /// Stable numeric code, also used as the guacd `error` status.
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidArgument { .. } => 4001,
            Self::NoPerm { .. } => 4003,
            Self::InvalidSessionId { .. } => 4005,
            Self::AccessTime => 4009,
            Self::IdleTimeout { .. } => 4011,
            Self::AdminClose { .. } => 4012,
            Self::Unauthorized => 4401,
            Self::Internal(_) => 5000,
            Self::ConnectServer { .. } => 5002,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NoPerm { .. } => StatusCode::FORBIDDEN,
            Self::Internal(_) | Self::ConnectServer { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// User-facing text for `lang` (an `Accept-Language` value). Only
    /// English is shipped; other languages fall back to it.
    pub fn localized(&self, lang: &str) -> String {
        let _ = lang;
        self.to_string()
    }

    /// Message encoded for a guacd `error` instruction body.
    pub fn message_base64(&self, lang: &str) -> String {
        STANDARD.encode(self.localized(lang))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({"code": self.code(), "message": self.to_string()})),
        )
            .into_response()
    }
}

/// Banner written to monitors when the watched session ends.
pub fn session_end_message(session_id: &str) -> String {
    format!("\n----------Session {session_id} has been ended----------\n")
}

/// Red farewell line written to terminal clients.
pub fn farewell_line(msg: &str) -> String {
    format!("\r\n \x1b[31m {msg} \x1b[0m")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            ApiError::IdleTimeout { seconds: 5 }.to_string(),
            "Bad Request: idle timeout more than 5 seconds"
        );
        assert_eq!(
            ApiError::AdminClose {
                admin: "alice".into()
            }
            .to_string(),
            "Session has been closed by admin alice"
        );
        assert_eq!(
            ApiError::no_perm("monitor session").to_string(),
            "Bad Request: You do not have monitor session permission"
        );
    }

    #[test]
    fn test_codes_and_status() {
        assert_eq!(ApiError::AccessTime.code(), 4009);
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::connect_server("dial").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_farewell_is_red() {
        let line = farewell_line("rm -rf / is forbidden\n");
        assert!(line.starts_with("\r\n \x1b[31m rm -rf / is forbidden\n"));
        assert!(line.ends_with("\x1b[0m"));
    }

    #[test]
    fn test_message_base64_roundtrip() {
        let err = ApiError::AccessTime;
        let decoded = STANDARD.decode(err.message_base64("zh-CN,zh;q=0.9")).unwrap();
        assert_eq!(decoded, err.to_string().as_bytes());
    }
}
