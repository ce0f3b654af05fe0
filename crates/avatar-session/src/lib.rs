//! # Avatar Session - Talking-Avatar Session Orchestration
//!
//! Connects a real-time avatar renderer to a conversational voice backend and
//! drives one session through its lifecycle: microphone permission, renderer
//! connection, backend connection, audio bridging, barge-in and teardown.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       SessionController                          │
//! │   Idle → Initializing → AwaitingMedia → ConnectingAvatar         │
//! │        → ConnectingConversation → Active → Stopping → Idle       │
//! │                                                                  │
//! │  ┌────────────────────┐              ┌────────────────────────┐  │
//! │  │ ConversationClient │   user       │     AvatarRenderer     │  │
//! │  │ (pipeline | agent) │── speech ───→│   clear_buffer (SKIP)  │  │
//! │  └─────────┬──────────┘              └───────────▲────────────┘  │
//! │            │ audio output                        │ media track   │
//! │            ↓                                     │               │
//! │  ┌──────────────────────────────────────────────┴─────────────┐  │
//! │  │ AudioBridge: find backend output, mute, capture, forward   │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Media planes (WebRTC peers, call rooms, audio elements) are supplied by the
//! host through [`RenderTransport`], [`CallTransport`] and [`SessionEnvironment`].

pub mod avatar;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod conversation;
pub mod error;
pub mod events;
pub mod media;
pub mod session;

#[cfg(test)]
mod testing;

pub use avatar::{
    AvatarEvent, AvatarRenderClient, AvatarRenderer, RenderCommand, RenderSession, RenderTransport,
};
pub use bridge::AudioBridge;
pub use config::{
    AgentConfig, ApiKey, AvatarConfig, BridgeConfig, ConfigOption, ConversationConfig,
    PipelineConfig, PipelineEndpoints, RenderSurfaces, ServiceConfig, ServiceSelection,
    SessionSettings,
};
pub use controller::{SessionController, SessionEnvironment};
pub use conversation::{
    build_client, ActionRequest, AgentConversation, CallRoom, CallTransport, ConversationClient,
    ConversationEvent, ConversationMessage, PipelineConversation, SpeechActivity, SpeechRole,
    SpeechStatus, TransportMessage,
};
pub use error::{SessionError, SessionResult};
pub use events::EventBus;
pub use media::{AudioFrame, AudioOutput, AudioOutputHandle, AudioOutputRegistry, MediaTrack};
pub use session::{SessionId, SessionState, SessionStatus};
