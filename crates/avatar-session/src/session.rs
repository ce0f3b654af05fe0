//! Session lifecycle state and the status snapshot published to the UI layer.
//!
//! ```text
//! Idle → Initializing → AwaitingMedia → ConnectingAvatar
//!      → ConnectingConversation → Active → Stopping → Idle
//! ```
//!
//! `Error` is reachable from every non-terminal state and only `stop()` leaves it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of the single session owned by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    /// Clients constructed, render surfaces being bound.
    Initializing,
    /// Waiting on microphone permission.
    AwaitingMedia,
    /// Renderer started; waiting for its `connected` event.
    ConnectingAvatar,
    /// Renderer connected and primed; conversation backend connecting.
    ConnectingConversation,
    /// Conversation ready and audio bridged into the renderer.
    Active,
    Stopping,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::AwaitingMedia => "awaiting_media",
            SessionState::ConnectingAvatar => "connecting_avatar",
            SessionState::ConnectingConversation => "connecting_conversation",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Error => "error",
        }
    }

    /// True while a start attempt is still in flight.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            SessionState::Initializing
                | SessionState::AwaitingMedia
                | SessionState::ConnectingAvatar
                | SessionState::ConnectingConversation
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier for one start..stop session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of the controller published on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Human-readable error; `None` when there is nothing to show.
    pub error: Option<String>,
    /// Whether the avatar video should be shown.
    pub avatar_visible: bool,
    pub session_id: Option<SessionId>,
    /// When the current session's `start()` was accepted.
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            error: None,
            avatar_visible: false,
            session_id: None,
            started_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Error text for display, empty when none.
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }

    /// Start button spinner: a start attempt is in flight.
    pub fn is_loading(&self) -> bool {
        self.state.is_connecting()
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::idle()
    }
}
