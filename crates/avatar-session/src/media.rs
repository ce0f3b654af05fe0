//! Media-plane handles shared by the renderer, the conversation backends and the bridge.
//!
//! The crate never touches audio devices or playback elements directly. The host
//! environment implements [`AudioOutput`] and [`AudioOutputRegistry`] over whatever
//! it renders into (browser audio elements, native sinks, test doubles).

use crate::error::SessionResult;
use std::fmt;
use std::sync::Arc;

/// Size of the silence buffer sent to warm up the renderer's audio pipeline.
pub const WARMUP_SILENCE_BYTES: usize = 6000;

/// Raw PCM bytes pushed to the renderer for lip-sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
}

impl AudioFrame {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// A block of zero-valued samples.
    pub fn silence(len: usize) -> Self {
        Self { data: vec![0u8; len] }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Handle naming a live audio track. Relaying a handle never transfers
/// ownership of the underlying track.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaTrack {
    pub id: String,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// An audio output produced by some component (e.g. an `<audio>` element).
pub trait AudioOutput: Send + Sync {
    /// Element identifier, if the output carries one.
    fn id(&self) -> Option<String>;

    /// Mute at the output layer; the track keeps flowing.
    fn set_muted(&self, muted: bool);

    fn is_muted(&self) -> bool;

    /// Capture the live track currently feeding this output.
    fn capture_track(&self) -> SessionResult<MediaTrack>;
}

/// Cloneable, debuggable wrapper so outputs can travel inside events.
#[derive(Clone)]
pub struct AudioOutputHandle(pub Arc<dyn AudioOutput>);

impl AudioOutputHandle {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self(output)
    }

    pub fn id(&self) -> Option<String> {
        self.0.id()
    }

    /// True when this output carries the given identifier.
    pub fn has_id(&self, id: &str) -> bool {
        self.0.id().as_deref() == Some(id)
    }
}

impl std::ops::Deref for AudioOutputHandle {
    type Target = dyn AudioOutput;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for AudioOutputHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioOutputHandle")
            .field("id", &self.0.id())
            .field("muted", &self.0.is_muted())
            .finish()
    }
}

/// Enumerates the audio outputs currently present in the host environment.
pub trait AudioOutputRegistry: Send + Sync {
    /// Outputs in creation order.
    fn audio_outputs(&self) -> Vec<AudioOutputHandle>;
}
