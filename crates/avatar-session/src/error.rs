//! Error types for avatar session orchestration

use crate::session::SessionState;
use thiserror::Error;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while starting or running an avatar session
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Avatar initialization failed: {0}")]
    AvatarInit(String),

    #[error("Conversation connect failed: {0}")]
    ConversationConnect(String),

    #[error("Unexpected runtime error: {0}")]
    UnexpectedRuntime(String),

    #[error("Session already running (state: {0})")]
    AlreadyRunning(SessionState),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl SessionError {
    /// Message shown to the user when a start attempt fails.
    pub fn user_message(&self) -> String {
        format!("Error starting interaction: {}", self)
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::Http(err.to_string())
    }
}

impl From<config::ConfigError> for SessionError {
    fn from(err: config::ConfigError) -> Self {
        SessionError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::UnexpectedRuntime(err.to_string())
    }
}
