//! Call media plane and the connection bookkeeping shared by both backends.

use super::ConversationEvent;
use crate::error::{SessionError, SessionResult};
use crate::events::EventBus;
use crate::media::AudioOutputHandle;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where the call transport should join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRoom {
    pub url: String,
    pub token: Option<String>,
}

/// Raw traffic from the call transport.
#[derive(Debug, Clone)]
pub enum TransportMessage {
    Joined,
    /// An audio track began playing into `output`. `local` is our own microphone.
    TrackStarted {
        output: AudioOutputHandle,
        local: bool,
    },
    /// Data-channel message from the remote participant.
    AppMessage(Value),
    Left {
        reason: Option<String>,
    },
    Error(String),
}

/// Media plane of a conversation (e.g. a WebRTC room), supplied by the host.
#[async_trait]
pub trait CallTransport: Send + Sync {
    async fn join(&self, room: &CallRoom) -> SessionResult<()>;

    async fn leave(&self);

    async fn send_app_message(&self, message: Value) -> SessionResult<()>;

    fn messages(&self) -> broadcast::Receiver<TransportMessage>;
}

/// Turns transport traffic into conversation events. Owned by the relay task.
pub(crate) trait MessageTranslator: Send + 'static {
    fn translate(&mut self, message: TransportMessage) -> Vec<ConversationEvent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// Connection state, relay task and event bus of one conversation client.
pub(crate) struct CallLink {
    transport: Arc<dyn CallTransport>,
    state: Mutex<LinkState>,
    relay: Mutex<Option<JoinHandle<()>>>,
    events: Arc<EventBus<ConversationEvent>>,
}

impl CallLink {
    pub(crate) fn new(transport: Arc<dyn CallTransport>) -> Self {
        Self {
            transport,
            state: Mutex::new(LinkState::Idle),
            relay: Mutex::new(None),
            events: Arc::new(EventBus::new()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn CallTransport> {
        &self.transport
    }

    pub(crate) fn events(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// Claim the connect slot. `Ok(false)` means a connect already happened or is running.
    pub(crate) fn begin_connect(&self) -> SessionResult<bool> {
        let mut state = self.lock_state();
        match *state {
            LinkState::Idle => {
                *state = LinkState::Connecting;
                Ok(true)
            }
            LinkState::Connecting | LinkState::Connected => Ok(false),
            LinkState::Closed => Err(SessionError::ConversationConnect(
                "client was disconnected".to_string(),
            )),
        }
    }

    /// Start relaying transport traffic, then join the room.
    pub(crate) async fn join<T: MessageTranslator>(
        &self,
        room: &CallRoom,
        translator: T,
    ) -> SessionResult<()> {
        if *self.lock_state() != LinkState::Connecting {
            return Err(SessionError::ConversationConnect(
                "disconnected while connecting".to_string(),
            ));
        }
        self.spawn_relay(translator);
        self.transport
            .join(room)
            .await
            .map_err(|e| SessionError::ConversationConnect(e.to_string()))?;

        let mut state = self.lock_state();
        if *state != LinkState::Connecting {
            return Err(SessionError::ConversationConnect(
                "disconnected while connecting".to_string(),
            ));
        }
        *state = LinkState::Connected;
        Ok(())
    }

    pub(crate) fn is_connected(&self) -> bool {
        *self.lock_state() == LinkState::Connected
    }

    /// Stop relaying and leave the room if a join was attempted. Idempotent.
    pub(crate) async fn close(&self) {
        *self.lock_state() = LinkState::Closed;
        let relay = self
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(relay) = relay {
            relay.abort();
            self.transport.leave().await;
        }
    }

    fn spawn_relay<T: MessageTranslator>(&self, mut translator: T) {
        let mut rx = self.transport.messages();
        let events = Arc::clone(&self.events);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        for event in translator.translate(message) {
                            events.emit(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "avatar::conversation", skipped = n, "transport messages lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(target: "avatar::conversation", "transport message stream closed");
                        break;
                    }
                }
            }
        });
        let mut relay = self.relay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = relay.replace(handle) {
            old.abort();
        }
    }
}

impl Drop for CallLink {
    fn drop(&mut self) {
        if let Some(relay) = self
            .relay
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            relay.abort();
        }
    }
}
