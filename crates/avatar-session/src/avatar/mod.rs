//! Avatar renderer capability.
//!
//! The controller only talks to [`AvatarRenderer`]. [`AvatarRenderClient`] is the
//! stock adapter: it negotiates a session over HTTP and drives an injected
//! [`RenderTransport`] for the media plane.

mod client;

pub use client::{AvatarRenderClient, RenderCommand, RenderSession, RenderTransport};

use crate::config::AvatarConfig;
use crate::error::SessionResult;
use crate::media::{AudioFrame, MediaTrack};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Lifecycle events emitted by a renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvatarEvent {
    /// Backend session ready to accept audio.
    Connected,
    Disconnected { reason: Option<String> },
}

/// Contract required from an avatar-rendering service.
#[async_trait]
pub trait AvatarRenderer: Send + Sync {
    /// Bind output surfaces. Only the first call with surfaces takes effect;
    /// a config without surfaces is a no-op the caller retries later.
    fn initialize(&self, config: &AvatarConfig) -> SessionResult<()>;

    /// Open the network session to the rendering backend.
    async fn start(&self) -> SessionResult<()>;

    /// Push a raw audio frame to be lip-synced. Valid only after `Connected`.
    async fn send_audio_data(&self, frame: &AudioFrame) -> SessionResult<()>;

    /// Use `track` as the ongoing lip-sync source, replacing any previous one.
    async fn listen_to_media_stream_track(&self, track: MediaTrack) -> SessionResult<()>;

    /// Discard queued audio and animation (barge-in).
    async fn clear_buffer(&self) -> SessionResult<()>;

    /// Tear down the session; safe even if never started.
    async fn close(&self);

    /// Subscribe to lifecycle events.
    fn events(&self) -> broadcast::Receiver<AvatarEvent>;
}
