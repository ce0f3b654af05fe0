//! **AudioBridge**: routes the conversation backend's audio into the renderer.
//!
//! The backend plays its synthesized speech into an audio output of its own. The
//! bridge finds that output, mutes it so the user only hears the avatar, captures
//! the live track and hands it to the renderer for lip-sync. The renderer's own
//! output is never a candidate.

use crate::avatar::AvatarRenderer;
use crate::config::BridgeConfig;
use crate::error::{SessionError, SessionResult};
use crate::media::{AudioOutputHandle, AudioOutputRegistry, MediaTrack};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

pub struct AudioBridge {
    config: BridgeConfig,
    /// Identifier of the renderer's own audio output.
    excluded_id: Option<String>,
    forwarded: Mutex<Option<MediaTrack>>,
}

impl AudioBridge {
    pub fn new(config: BridgeConfig, excluded_id: Option<String>) -> Self {
        Self {
            config,
            excluded_id,
            forwarded: Mutex::new(None),
        }
    }

    /// Track currently handed to the renderer. The bridge never owns it.
    pub fn forwarded_track(&self) -> Option<MediaTrack> {
        self.forwarded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_candidate(&self, output: &AudioOutputHandle) -> bool {
        match &self.excluded_id {
            Some(id) => !output.has_id(id),
            None => true,
        }
    }

    /// First candidate in creation order.
    pub fn select(&self, outputs: Vec<AudioOutputHandle>) -> Option<AudioOutputHandle> {
        let mut candidates = outputs.into_iter().filter(|o| self.is_candidate(o));
        let first = candidates.next()?;
        let extra = candidates.count();
        if extra > 0 {
            warn!(
                target: "avatar::bridge",
                extra,
                chosen = ?first.id(),
                "multiple audio outputs found; using the first"
            );
        }
        Some(first)
    }

    /// Poll `registry` until a candidate appears or the attempt budget runs out.
    pub async fn discover<R>(&self, registry: &R) -> SessionResult<AudioOutputHandle>
    where
        R: AudioOutputRegistry + ?Sized,
    {
        let interval = self.config.poll_interval();
        for attempt in 1..=self.config.max_attempts {
            if let Some(output) = self.select(registry.audio_outputs()) {
                debug!(target: "avatar::bridge", attempt, "conversation audio output found");
                return Ok(output);
            }
            tokio::time::sleep(interval).await;
        }
        Err(SessionError::AvatarInit(format!(
            "conversation audio output not found after {} attempts",
            self.config.max_attempts
        )))
    }

    /// Mute the conversation output and forward its track to `renderer`.
    ///
    /// `announced` is the handle the backend reported, if any; it is used
    /// directly unless it is the renderer's own output.
    pub async fn connect<R>(
        &self,
        announced: Option<AudioOutputHandle>,
        registry: &R,
        renderer: &dyn AvatarRenderer,
    ) -> SessionResult<MediaTrack>
    where
        R: AudioOutputRegistry + ?Sized,
    {
        let output = match announced.filter(|o| self.is_candidate(o)) {
            Some(output) => output,
            None => self.discover(registry).await?,
        };
        output.set_muted(true);
        let track = output.capture_track()?;
        renderer.listen_to_media_stream_track(track.clone()).await?;
        info!(
            target: "avatar::bridge",
            output = ?output.id(),
            track = %track.id,
            "conversation audio bridged to renderer"
        );
        *self.forwarded.lock().unwrap_or_else(PoisonError::into_inner) = Some(track.clone());
        Ok(track)
    }

    /// Forget the forwarded track.
    pub fn release(&self) {
        self.forwarded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
