//! **AgentConversation**: a hosted conversational agent addressed by identifier.
//!
//! `connect()` creates a web call for the agent, then joins the call room the
//! backend hands back. The call counts as started once the agent's audio track
//! begins playing.

use super::transport::{CallLink, CallRoom, CallTransport, MessageTranslator, TransportMessage};
use super::{
    ConversationClient, ConversationEvent, ConversationMessage, SpeechActivity, SpeechRole,
};
use crate::config::{AgentConfig, HTTP_TIMEOUT};
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const WEB_CALL_PATH: &str = "/call/web";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebCallRequest<'a> {
    assistant_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebCallResponse {
    id: String,
    web_call_url: String,
}

pub struct AgentConversation {
    config: AgentConfig,
    http: reqwest::Client,
    link: CallLink,
    call_id: Mutex<Option<String>>,
}

impl AgentConversation {
    pub fn new(config: AgentConfig, transport: Arc<dyn CallTransport>) -> SessionResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| SessionError::ConversationConnect(e.to_string()))?;
        Ok(Self {
            config,
            http,
            link: CallLink::new(transport),
            call_id: Mutex::new(None),
        })
    }

    /// Backend identifier of the current call, once created.
    pub fn call_id(&self) -> Option<String> {
        self.call_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    async fn create_call(&self) -> SessionResult<CallRoom> {
        let url = format!("{}{}", self.config.api_url.trim_end_matches('/'), WEB_CALL_PATH);
        let res = self
            .http
            .post(&url)
            .bearer_auth(self.config.api_key.expose())
            .json(&WebCallRequest {
                assistant_id: &self.config.agent_id,
            })
            .send()
            .await
            .map_err(|e| SessionError::ConversationConnect(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(SessionError::ConversationConnect(format!(
                "agent call rejected {}: {}",
                status, text
            )));
        }
        let parsed: WebCallResponse = res.json().await.map_err(|e| {
            SessionError::ConversationConnect(format!("invalid call response: {}", e))
        })?;
        debug!(target: "avatar::conversation", call_id = %parsed.id, "agent call created");
        *self.call_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(parsed.id);
        Ok(CallRoom {
            url: parsed.web_call_url,
            token: None,
        })
    }
}

#[async_trait]
impl ConversationClient for AgentConversation {
    fn backend(&self) -> &'static str {
        "agent"
    }

    async fn connect(&self) -> SessionResult<()> {
        if !self.link.begin_connect()? {
            debug!(target: "avatar::conversation", "agent connect already in progress");
            return Ok(());
        }
        info!(target: "avatar::conversation", agent_id = %self.config.agent_id, "starting agent call");
        let result = match self.create_call().await {
            Ok(room) => self.link.join(&room, AgentTranslator::default()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!(target: "avatar::conversation", error = %e, "agent connect failed");
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

#[derive(Default)]
struct AgentTranslator {
    call_started: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscriptPayload {
    role: SpeechRole,
    transcript: String,
    #[serde(default)]
    transcript_type: Option<String>,
}

impl AgentTranslator {
    fn app_message(&mut self, value: Value) -> Vec<ConversationEvent> {
        // the agent sends bare strings ("listening") as well as JSON, sometimes JSON-in-a-string
        let value = match value {
            Value::String(text) => match serde_json::from_str::<Value>(&text) {
                Ok(parsed) if parsed.is_object() => parsed,
                _ => {
                    debug!(target: "avatar::conversation", message = %text, "agent signal");
                    return Vec::new();
                }
            },
            other => other,
        };
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message = match kind.as_str() {
            "speech-update" => serde_json::from_value::<SpeechActivity>(value.clone())
                .map(ConversationMessage::SpeechUpdate)
                .ok(),
            "transcript" => serde_json::from_value::<TranscriptPayload>(value.clone())
                .map(|t| ConversationMessage::Transcript {
                    role: t.role,
                    text: t.transcript,
                    is_final: t.transcript_type.as_deref() == Some("final"),
                })
                .ok(),
            "status-update" if value.get("status").and_then(Value::as_str) == Some("ended") => {
                let reason = value
                    .get("endedReason")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                return vec![ConversationEvent::CallEnded { reason }];
            }
            _ => None,
        };
        let message = message.unwrap_or(ConversationMessage::Other {
            kind,
            payload: value,
        });
        vec![ConversationEvent::Message(message)]
    }
}

impl MessageTranslator for AgentTranslator {
    fn translate(&mut self, message: TransportMessage) -> Vec<ConversationEvent> {
        match message {
            TransportMessage::Joined => Vec::new(),
            TransportMessage::TrackStarted { local: true, .. } => Vec::new(),
            TransportMessage::TrackStarted { output, .. } => {
                let mut events = vec![ConversationEvent::OutputReady(output)];
                if !self.call_started {
                    self.call_started = true;
                    events.push(ConversationEvent::CallStarted);
                }
                events
            }
            TransportMessage::AppMessage(value) => self.app_message(value),
            TransportMessage::Left { reason } => vec![ConversationEvent::CallEnded { reason }],
            TransportMessage::Error(message) => vec![ConversationEvent::Error(message)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKey;
    use crate::testing::{FakeCallTransport, FakeOutput};
    use mockito::Matcher;
    use serde_json::json;
    use std::time::Duration;

    fn config(url: &str) -> AgentConfig {
        AgentConfig::new("agent-42", ApiKey::new("secret")).with_api_url(url)
    }

    async fn next_event(rx: &mut broadcast::Receiver<ConversationEvent>) -> ConversationEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timeout")
            .expect("event bus closed")
    }

    #[tokio::test]
    async fn connect_creates_web_call_and_joins() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/call/web")
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::Json(json!({"assistantId": "agent-42"})))
            .with_status(201)
            .with_body(r#"{"id":"call-7","webCallUrl":"https://calls.test/room-7"}"#)
            .create_async()
            .await;

        let transport = Arc::new(FakeCallTransport::default());
        let client = AgentConversation::new(config(&server.url()), transport.clone()).unwrap();
        client.connect().await.unwrap();

        mock.assert_async().await;
        assert_eq!(client.call_id().as_deref(), Some("call-7"));
        assert_eq!(transport.log(), vec!["join:https://calls.test/room-7:-".to_string()]);
    }

    #[tokio::test]
    async fn rejected_call_reports_backend_text() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/call/web")
            .with_status(400)
            .with_body("assistant not found")
            .create_async()
            .await;

        let client =
            AgentConversation::new(config(&server.url()), Arc::new(FakeCallTransport::default()))
                .unwrap();
        match client.connect().await.unwrap_err() {
            SessionError::ConversationConnect(msg) => assert!(msg.contains("assistant not found")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!client.is_connected());
    }

    #[test]
    fn first_remote_track_starts_the_call_once() {
        let mut translator = AgentTranslator::default();
        assert!(translator
            .translate(TransportMessage::TrackStarted {
                output: FakeOutput::handle(None, "mic"),
                local: true,
            })
            .is_empty());

        let first = translator.translate(TransportMessage::TrackStarted {
            output: FakeOutput::handle(None, "agent"),
            local: false,
        });
        assert_eq!(first.len(), 2);
        assert!(matches!(first[0], ConversationEvent::OutputReady(_)));
        assert!(matches!(first[1], ConversationEvent::CallStarted));

        let again = translator.translate(TransportMessage::TrackStarted {
            output: FakeOutput::handle(None, "agent"),
            local: false,
        });
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn agent_messages_are_translated() {
        let mut translator = AgentTranslator::default();

        let speech = translator.translate(TransportMessage::AppMessage(json!({
            "type": "speech-update", "role": "user", "status": "started"
        })));
        assert!(speech[0].is_user_speech_start());

        // JSON delivered as a string
        let transcript = translator.translate(TransportMessage::AppMessage(Value::String(
            r#"{"type":"transcript","role":"assistant","transcript":"hello","transcriptType":"final"}"#
                .to_string(),
        )));
        match &transcript[0] {
            ConversationEvent::Message(ConversationMessage::Transcript { role, text, is_final }) => {
                assert_eq!(*role, SpeechRole::Assistant);
                assert_eq!(text, "hello");
                assert!(*is_final);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(translator
            .translate(TransportMessage::AppMessage(json!("listening")))
            .is_empty());

        let ended = translator.translate(TransportMessage::AppMessage(json!({
            "type": "status-update", "status": "ended", "endedReason": "customer-ended-call"
        })));
        assert!(matches!(
            &ended[0],
            ConversationEvent::CallEnded { reason: Some(r) } if r == "customer-ended-call"
        ));

        let other = translator.translate(TransportMessage::AppMessage(json!({"type": "hang"})));
        assert!(matches!(
            &other[0],
            ConversationEvent::Message(ConversationMessage::Other { kind, .. }) if kind == "hang"
        ));
    }

    #[tokio::test]
    async fn call_end_is_published() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/call/web")
            .with_status(201)
            .with_body(r#"{"id":"call-8","webCallUrl":"https://calls.test/room-8"}"#)
            .create_async()
            .await;

        let transport = Arc::new(FakeCallTransport::default());
        let client = AgentConversation::new(config(&server.url()), transport.clone()).unwrap();
        let mut events = client.events();
        client.connect().await.unwrap();

        transport.bus.emit(TransportMessage::Left {
            reason: Some("hangup".into()),
        });
        assert!(matches!(
            next_event(&mut events).await,
            ConversationEvent::CallEnded { reason: Some(_) }
        ));

        client.disconnect().await;
        assert_eq!(transport.log().last().map(String::as_str), Some("leave"));
    }
}
