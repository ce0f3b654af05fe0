//! Test doubles shared by unit tests.

use crate::conversation::{CallRoom, CallTransport, TransportMessage};
use crate::error::{SessionError, SessionResult};
use crate::events::EventBus;
use crate::media::{AudioOutput, AudioOutputHandle, MediaTrack};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub(crate) struct FakeOutput {
    id: Option<String>,
    track: String,
    muted: AtomicBool,
}

impl FakeOutput {
    pub(crate) fn handle(id: Option<&str>, track: &str) -> AudioOutputHandle {
        AudioOutputHandle::new(Arc::new(FakeOutput {
            id: id.map(str::to_string),
            track: track.to_string(),
            muted: AtomicBool::new(false),
        }))
    }
}

impl AudioOutput for FakeOutput {
    fn id(&self) -> Option<String> {
        self.id.clone()
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn capture_track(&self) -> SessionResult<MediaTrack> {
        Ok(MediaTrack::new(self.track.clone()))
    }
}

#[derive(Default)]
pub(crate) struct FakeCallTransport {
    pub(crate) bus: EventBus<TransportMessage>,
    pub(crate) fail_join: bool,
    log: Mutex<Vec<String>>,
}

impl FakeCallTransport {
    pub(crate) fn failing() -> Self {
        Self {
            fail_join: true,
            ..Self::default()
        }
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl CallTransport for FakeCallTransport {
    async fn join(&self, room: &CallRoom) -> SessionResult<()> {
        self.record(format!(
            "join:{}:{}",
            room.url,
            room.token.as_deref().unwrap_or("-")
        ));
        if self.fail_join {
            return Err(SessionError::Transport("room unavailable".into()));
        }
        Ok(())
    }

    async fn leave(&self) {
        self.record("leave".into());
    }

    async fn send_app_message(&self, message: Value) -> SessionResult<()> {
        self.record(format!("app:{}", message));
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<TransportMessage> {
        self.bus.subscribe()
    }
}
