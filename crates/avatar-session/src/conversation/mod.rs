//! Conversation backends: speech-to-text → LLM → text-to-speech, as a service.
//!
//! Two interchangeable variants implement [`ConversationClient`]:
//!
//! - [`PipelineConversation`]: separately named STT/LLM/TTS services behind
//!   `connect` and `action` HTTP endpoints.
//! - [`AgentConversation`]: one hosted agent addressed by its identifier.
//!
//! [`build_client`] picks the variant from [`ConversationConfig`]; the controller
//! never branches on the backend kind.

mod agent;
mod pipeline;
mod transport;

pub use agent::AgentConversation;
pub use pipeline::{ActionRequest, PipelineConversation};
pub use transport::{CallRoom, CallTransport, TransportMessage};

use crate::config::ConversationConfig;
use crate::error::SessionResult;
use crate::media::AudioOutputHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Who a speech or transcript event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechRole {
    User,
    #[serde(alias = "bot")]
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechStatus {
    Started,
    Stopped,
}

/// Voice activity reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechActivity {
    pub role: SpeechRole,
    pub status: SpeechStatus,
}

impl SpeechActivity {
    pub fn new(role: SpeechRole, status: SpeechStatus) -> Self {
        Self { role, status }
    }

    pub fn user_started() -> Self {
        Self::new(SpeechRole::User, SpeechStatus::Started)
    }
}

/// Content traffic from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationMessage {
    SpeechUpdate(SpeechActivity),
    Transcript {
        role: SpeechRole,
        text: String,
        is_final: bool,
    },
    Other {
        kind: String,
        payload: Value,
    },
}

/// Events published by a [`ConversationClient`].
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    /// Pipeline backend began producing audio.
    Ready,
    /// Agent call established.
    CallStarted,
    /// The backend's audio output exists; hand it to the bridge.
    OutputReady(AudioOutputHandle),
    Message(ConversationMessage),
    CallEnded { reason: Option<String> },
    Error(String),
}

impl ConversationEvent {
    /// Either readiness signal, regardless of backend.
    pub fn is_readiness(&self) -> bool {
        matches!(self, ConversationEvent::Ready | ConversationEvent::CallStarted)
    }

    /// The barge-in trigger: the user started speaking.
    pub fn is_user_speech_start(&self) -> bool {
        matches!(
            self,
            ConversationEvent::Message(ConversationMessage::SpeechUpdate(SpeechActivity {
                role: SpeechRole::User,
                status: SpeechStatus::Started,
            }))
        )
    }
}

/// Capability set shared by every conversation backend.
#[async_trait]
pub trait ConversationClient: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Open the session. Idempotent per instance; transport failures become
    /// `ConversationConnect` carrying the backend's error text.
    async fn connect(&self) -> SessionResult<()>;

    /// Close the session. Safe to call repeatedly and before `connect`.
    async fn disconnect(&self);

    fn events(&self) -> broadcast::Receiver<ConversationEvent>;
}

/// Construct the client variant selected by `config`.
pub fn build_client(
    config: &ConversationConfig,
    transport: Arc<dyn CallTransport>,
) -> SessionResult<Arc<dyn ConversationClient>> {
    let client: Arc<dyn ConversationClient> = match config {
        ConversationConfig::Pipeline(pipeline) => {
            Arc::new(PipelineConversation::new(pipeline.clone(), transport)?)
        }
        ConversationConfig::Agent(agent) => {
            Arc::new(AgentConversation::new(agent.clone(), transport)?)
        }
    };
    Ok(client)
}
