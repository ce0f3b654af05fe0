//! **PipelineConversation**: a bot assembled from named STT, TTS and LLM services.
//!
//! `connect()` posts the service selection and the ordered per-service options to
//! `{base_url}{endpoints.connect}`; the response names the call room the bot joins.
//! Bot messages arrive over the transport's data channel, labelled `rtvi-ai`.

use super::transport::{CallLink, CallRoom, CallTransport, MessageTranslator, TransportMessage};
use super::{
    ConversationClient, ConversationEvent, ConversationMessage, SpeechActivity, SpeechRole,
    SpeechStatus,
};
use crate::config::{
    ConfigOption, PipelineConfig, ServiceConfig, ServiceSelection, HTTP_TIMEOUT,
};
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const MESSAGE_LABEL: &str = "rtvi-ai";

#[derive(Serialize)]
struct ConnectRequest<'a> {
    services: &'a ServiceSelection,
    config: &'a [ServiceConfig],
}

#[derive(Serialize)]
struct ActionEnvelope<'a> {
    action: &'a ActionRequest,
}

#[derive(Deserialize)]
struct ConnectResponse {
    #[serde(alias = "roomUrl", alias = "url")]
    room_url: String,
    #[serde(default)]
    token: Option<String>,
}

/// One runtime action addressed to a pipeline service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRequest {
    pub service: String,
    pub action: String,
    pub arguments: Vec<ConfigOption>,
}

impl ActionRequest {
    pub fn new(service: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            action: action.into(),
            arguments: Vec::new(),
        }
    }

    pub fn argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.push(ConfigOption {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

pub struct PipelineConversation {
    config: PipelineConfig,
    http: reqwest::Client,
    link: CallLink,
}

impl PipelineConversation {
    pub fn new(config: PipelineConfig, transport: Arc<dyn CallTransport>) -> SessionResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| SessionError::ConversationConnect(e.to_string()))?;
        Ok(Self {
            config,
            http,
            link: CallLink::new(transport),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn request_room(&self) -> SessionResult<CallRoom> {
        let url = self.endpoint(&self.config.endpoints.connect);
        let body = ConnectRequest {
            services: &self.config.services,
            config: &self.config.config,
        };
        let res = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::ConversationConnect(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(SessionError::ConversationConnect(format!(
                "pipeline connect rejected {}: {}",
                status, text
            )));
        }
        let parsed: ConnectResponse = res.json().await.map_err(|e| {
            SessionError::ConversationConnect(format!("invalid connect response: {}", e))
        })?;
        Ok(CallRoom {
            url: parsed.room_url,
            token: parsed.token,
        })
    }

    /// Post a runtime action (e.g. change TTS voice mid-call). Requires a live connection.
    pub async fn send_action(&self, request: &ActionRequest) -> SessionResult<Value> {
        if !self.link.is_connected() {
            return Err(SessionError::Transport(
                "pipeline is not connected".to_string(),
            ));
        }
        let url = self.endpoint(&self.config.endpoints.action);
        let res = self
            .http
            .post(&url)
            .json(&ActionEnvelope { action: request })
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(SessionError::Http(format!(
                "action {}:{} failed {}: {}",
                request.service, request.action, status, text
            )));
        }
        let text = res.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// The bot answers `bot-ready` only after it hears `client-ready`.
    async fn send_client_ready(&self) -> SessionResult<()> {
        let message = json!({"label": MESSAGE_LABEL, "type": "client-ready", "data": {}});
        self.link
            .transport()
            .send_app_message(message)
            .await
            .map_err(|e| {
                SessionError::ConversationConnect(format!("client-ready not sent: {}", e))
            })?;
        debug!(target: "avatar::conversation", "client-ready sent");
        Ok(())
    }
}

#[async_trait]
impl ConversationClient for PipelineConversation {
    fn backend(&self) -> &'static str {
        "pipeline"
    }

    async fn connect(&self) -> SessionResult<()> {
        if !self.link.begin_connect()? {
            debug!(target: "avatar::conversation", "pipeline connect already in progress");
            return Ok(());
        }
        info!(
            target: "avatar::conversation",
            base_url = %self.config.base_url,
            stt = %self.config.services.stt,
            tts = %self.config.services.tts,
            llm = %self.config.services.llm,
            "connecting pipeline"
        );
        let result = async {
            let room = self.request_room().await?;
            self.link.join(&room, PipelineTranslator).await?;
            self.send_client_ready().await
        }
        .await;
        if let Err(e) = &result {
            warn!(target: "avatar::conversation", error = %e, "pipeline connect failed");
            self.link.close().await;
        }
        result
    }

    async fn disconnect(&self) {
        self.link.close().await;
    }

    fn events(&self) -> broadcast::Receiver<ConversationEvent> {
        self.link.events()
    }
}

struct PipelineTranslator;

impl PipelineTranslator {
    fn speech(role: SpeechRole, status: SpeechStatus) -> Vec<ConversationEvent> {
        vec![ConversationEvent::Message(ConversationMessage::SpeechUpdate(
            SpeechActivity::new(role, status),
        ))]
    }

    fn app_message(value: Value) -> Vec<ConversationEvent> {
        if value.get("label").and_then(Value::as_str) != Some(MESSAGE_LABEL) {
            return vec![ConversationEvent::Message(ConversationMessage::Other {
                kind: "app-message".to_string(),
                payload: value,
            })];
        }
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        match kind.as_str() {
            "bot-ready" => vec![ConversationEvent::Ready],
            "user-started-speaking" => Self::speech(SpeechRole::User, SpeechStatus::Started),
            "user-stopped-speaking" => Self::speech(SpeechRole::User, SpeechStatus::Stopped),
            "bot-started-speaking" => Self::speech(SpeechRole::Assistant, SpeechStatus::Started),
            "bot-stopped-speaking" => Self::speech(SpeechRole::Assistant, SpeechStatus::Stopped),
            "user-transcription" => {
                vec![ConversationEvent::Message(ConversationMessage::Transcript {
                    role: SpeechRole::User,
                    text: text_field(&data),
                    is_final: data.get("final").and_then(Value::as_bool).unwrap_or(false),
                })]
            }
            "bot-transcription" | "bot-tts-text" => {
                vec![ConversationEvent::Message(ConversationMessage::Transcript {
                    role: SpeechRole::Assistant,
                    text: text_field(&data),
                    is_final: true,
                })]
            }
            "error" | "error-response" => {
                let message = data
                    .get("error")
                    .or_else(|| data.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("pipeline error")
                    .to_string();
                vec![ConversationEvent::Error(message)]
            }
            _ => vec![ConversationEvent::Message(ConversationMessage::Other {
                kind,
                payload: data,
            })],
        }
    }
}

fn text_field(data: &Value) -> String {
    data.get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl MessageTranslator for PipelineTranslator {
    fn translate(&mut self, message: TransportMessage) -> Vec<ConversationEvent> {
        match message {
            TransportMessage::Joined => {
                debug!(target: "avatar::conversation", "pipeline room joined");
                Vec::new()
            }
            TransportMessage::TrackStarted { local: true, .. } => Vec::new(),
            TransportMessage::TrackStarted { output, .. } => {
                vec![ConversationEvent::OutputReady(output)]
            }
            TransportMessage::AppMessage(value) => Self::app_message(value),
            TransportMessage::Left { reason } => vec![ConversationEvent::CallEnded { reason }],
            TransportMessage::Error(message) => vec![ConversationEvent::Error(message)],
        }
    }
}
