//! **SessionController**: owns one avatar session from `start()` to `stop()`.
//!
//! `start()` walks `Initializing → AwaitingMedia → ConnectingAvatar` inline, then
//! hands the session to a spawned driver task which waits for the renderer,
//! primes it with silence, connects the conversation backend and, on readiness,
//! bridges the backend's audio into the renderer. The driver also handles
//! barge-in and call teardown for as long as the session lives.
//!
//! Every session carries a generation number. `stop()` bumps it, so a
//! continuation that resumes after a stop sees a stale generation and discards
//! its result instead of touching the new session.

use crate::avatar::{AvatarEvent, AvatarRenderer};
use crate::bridge::AudioBridge;
use crate::config::{AvatarConfig, BridgeConfig, ConversationConfig, SessionSettings};
use crate::conversation::{ConversationClient, ConversationEvent, ConversationMessage};
use crate::error::{SessionError, SessionResult};
use crate::media::{
    AudioFrame, AudioOutputHandle, AudioOutputRegistry, MediaTrack, WARMUP_SILENCE_BYTES,
};
use crate::session::{SessionId, SessionState, SessionStatus};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Host services the controller needs but does not own: microphone access,
/// client construction and the list of live audio outputs.
#[async_trait]
pub trait SessionEnvironment: AudioOutputRegistry {
    /// Ask for microphone access. Refusal is `PermissionDenied`.
    async fn request_microphone(&self) -> SessionResult<()>;

    /// A fresh renderer for one session.
    fn create_avatar(&self) -> SessionResult<Arc<dyn AvatarRenderer>>;

    /// A fresh conversation client for one session, usually via
    /// [`crate::conversation::build_client`].
    fn create_conversation(
        &self,
        config: &ConversationConfig,
    ) -> SessionResult<Arc<dyn ConversationClient>>;
}

/// Per-session resources. Dropped (after closing) on stop or failure.
struct LiveSession {
    generation: u64,
    avatar: Arc<dyn AvatarRenderer>,
    conversation: Arc<dyn ConversationClient>,
    bridge: Arc<AudioBridge>,
    driver: Option<JoinHandle<()>>,
}

impl LiveSession {
    /// Close both clients concurrently. Order is irrelevant.
    async fn close(self) {
        let LiveSession {
            avatar,
            conversation,
            bridge,
            ..
        } = self;
        futures::join!(avatar.close(), conversation.disconnect());
        bridge.release();
    }
}

struct Shared {
    env: Arc<dyn SessionEnvironment>,
    bridge_config: BridgeConfig,
    status: watch::Sender<SessionStatus>,
    generation: AtomicU64,
    session: Mutex<Option<LiveSession>>,
}

fn superseded() -> SessionError {
    SessionError::UnexpectedRuntime("session superseded by stop".to_string())
}

impl Shared {
    fn lock_session(&self) -> MutexGuard<'_, Option<LiveSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current_generation() == generation
    }

    fn publish(&self, update: impl FnOnce(&mut SessionStatus)) {
        self.status.send_modify(|status| {
            update(status);
            status.updated_at = Utc::now();
        });
    }

    fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Reserve the controller for a new session. Only valid from `Idle`.
    fn claim(&self) -> SessionResult<(u64, SessionId)> {
        let _guard = self.lock_session();
        let state = self.state();
        if state != SessionState::Idle {
            return Err(SessionError::AlreadyRunning(state));
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let id = SessionId::new();
        self.publish(|s| {
            s.state = SessionState::Initializing;
            s.error = None;
            s.avatar_visible = false;
            s.session_id = Some(id.clone());
            s.started_at = Some(Utc::now());
        });
        Ok((generation, id))
    }

    /// Move to `state` if `generation` is still the live session.
    fn advance(&self, generation: u64, state: SessionState) -> SessionResult<()> {
        let _guard = self.lock_session();
        if !self.is_current(generation) {
            return Err(superseded());
        }
        info!(target: "avatar::session", %state, "session state");
        self.publish(|s| {
            s.state = state;
            if state == SessionState::Active {
                s.avatar_visible = true;
            }
        });
        Ok(())
    }

    fn install(&self, live: LiveSession) -> SessionResult<()> {
        let mut guard = self.lock_session();
        if !self.is_current(live.generation) {
            return Err(superseded());
        }
        *guard = Some(live);
        Ok(())
    }

    fn attach_driver(&self, generation: u64, driver: JoinHandle<()>) {
        let mut guard = self.lock_session();
        match guard.as_mut() {
            Some(live) if live.generation == generation => live.driver = Some(driver),
            _ => driver.abort(),
        }
    }

    /// Record a start or runtime failure, then close both clients.
    /// A stale generation is ignored.
    async fn fail(&self, generation: u64, error: &SessionError) {
        let live = {
            let mut guard = self.lock_session();
            if !self.is_current(generation) {
                debug!(target: "avatar::session", error = %error, "discarding failure of a stopped session");
                return;
            }
            warn!(target: "avatar::session", error = %error, "session failed");
            let message = error.user_message();
            self.publish(|s| {
                s.state = SessionState::Error;
                s.error = Some(message);
                s.avatar_visible = false;
            });
            guard.take()
        };
        // the driver may be the caller, so its handle is dropped rather than aborted
        if let Some(live) = live {
            live.close().await;
        }
    }

    /// Tear the session down to `Idle`. With `abort_driver` unset the caller is
    /// the driver itself. A stale generation is ignored.
    async fn teardown(&self, expected: Option<u64>, abort_driver: bool) {
        let (live, generation) = {
            let mut guard = self.lock_session();
            if let Some(expected) = expected {
                if !self.is_current(expected) {
                    return;
                }
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let live = guard.take();
            if live.is_some() {
                info!(target: "avatar::session", "stopping session");
                self.publish(|s| {
                    s.state = SessionState::Stopping;
                    s.avatar_visible = false;
                });
            }
            (live, generation)
        };

        if let Some(mut live) = live {
            if let Some(driver) = live.driver.take() {
                if abort_driver {
                    driver.abort();
                }
            }
            live.close().await;
        }

        let _guard = self.lock_session();
        if !self.is_current(generation) {
            return;
        }
        self.status.send_if_modified(|s| {
            let idle = s.state == SessionState::Idle
                && s.error.is_none()
                && !s.avatar_visible
                && s.session_id.is_none()
                && s.started_at.is_none();
            if idle {
                return false;
            }
            s.state = SessionState::Idle;
            s.error = None;
            s.avatar_visible = false;
            s.session_id = None;
            s.started_at = None;
            s.updated_at = Utc::now();
            true
        });
    }
}

/// Orchestrates one avatar session at a time.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(env: Arc<dyn SessionEnvironment>, bridge_config: BridgeConfig) -> Self {
        let (status, _) = watch::channel(SessionStatus::idle());
        Self {
            shared: Arc::new(Shared {
                env,
                bridge_config,
                status,
                generation: AtomicU64::new(0),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn from_settings(env: Arc<dyn SessionEnvironment>, settings: &SessionSettings) -> Self {
        Self::new(env, settings.bridge.clone())
    }

    /// Current status snapshot.
    pub fn status(&self) -> SessionStatus {
        self.shared.status.borrow().clone()
    }

    /// Receive every status change.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Error text for display, empty when none.
    pub fn error_message(&self) -> String {
        self.shared.status.borrow().error_message().to_string()
    }

    pub fn is_avatar_visible(&self) -> bool {
        self.shared.status.borrow().avatar_visible
    }

    /// Start a session with the configs from `settings`.
    pub async fn start_with(&self, settings: &SessionSettings) -> SessionResult<()> {
        self.start(settings.avatar.clone(), settings.conversation.clone())
            .await
    }

    /// Start a session. Rejected with `AlreadyRunning` unless the controller is
    /// `Idle`. Returns once the renderer has been started; the rest of the
    /// startup continues in the background and is reported through `subscribe()`.
    pub async fn start(
        &self,
        avatar_config: AvatarConfig,
        conversation_config: ConversationConfig,
    ) -> SessionResult<()> {
        let (generation, id) = self.shared.claim()?;
        info!(
            target: "avatar::session",
            session_id = %id,
            backend = conversation_config.backend_name(),
            "starting session"
        );
        match self
            .launch(generation, &avatar_config, &conversation_config)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if self.shared.is_current(generation) => {
                self.shared.fail(generation, &e).await;
                Err(e)
            }
            Err(e) => {
                debug!(target: "avatar::session", error = %e, "start abandoned after stop");
                Ok(())
            }
        }
    }

    async fn launch(
        &self,
        generation: u64,
        avatar_config: &AvatarConfig,
        conversation_config: &ConversationConfig,
    ) -> SessionResult<()> {
        let shared = &self.shared;

        let avatar = shared.env.create_avatar()?;
        let conversation = match shared.env.create_conversation(conversation_config) {
            Ok(conversation) => conversation,
            Err(e) => {
                avatar.close().await;
                return Err(e);
            }
        };
        let bridge = Arc::new(AudioBridge::new(
            shared.bridge_config.clone(),
            avatar_config.render_audio_id().map(str::to_string),
        ));
        shared.install(LiveSession {
            generation,
            avatar: Arc::clone(&avatar),
            conversation: Arc::clone(&conversation),
            bridge: Arc::clone(&bridge),
            driver: None,
        })?;
        avatar.initialize(avatar_config)?;

        shared.advance(generation, SessionState::AwaitingMedia)?;
        shared.env.request_microphone().await?;

        shared.advance(generation, SessionState::ConnectingAvatar)?;
        if avatar_config.surfaces.is_none() {
            return Err(SessionError::AvatarInit(
                "render surfaces are not available".to_string(),
            ));
        }
        let avatar_events = avatar.events();
        let conversation_events = conversation.events();
        avatar.start().await?;
        if !shared.is_current(generation) {
            return Err(superseded());
        }

        let driver = SessionDriver {
            shared: Arc::clone(shared),
            generation,
            avatar,
            conversation,
            bridge,
        };
        let handle = tokio::spawn(driver.run(avatar_events, conversation_events));
        shared.attach_driver(generation, handle);
        Ok(())
    }

    /// End the session from any state. Idempotent and infallible.
    pub async fn stop(&self) {
        self.shared.teardown(None, true).await;
    }
}

/// Background half of a session: everything after the renderer has started.
struct SessionDriver {
    shared: Arc<Shared>,
    generation: u64,
    avatar: Arc<dyn AvatarRenderer>,
    conversation: Arc<dyn ConversationClient>,
    bridge: Arc<AudioBridge>,
}

enum Outcome {
    /// The conversation ended on its own; return to `Idle`.
    CallEnded,
    /// Both event streams are gone; nothing left to drive.
    Detached,
}

impl SessionDriver {
    async fn run(
        self,
        avatar_events: broadcast::Receiver<AvatarEvent>,
        conversation_events: broadcast::Receiver<ConversationEvent>,
    ) {
        match self.drive(avatar_events, conversation_events).await {
            Ok(Outcome::CallEnded) => {
                info!(target: "avatar::session", "conversation ended");
                self.shared.teardown(Some(self.generation), false).await;
            }
            Ok(Outcome::Detached) => {}
            Err(e) => self.shared.fail(self.generation, &e).await,
        }
    }

    async fn drive(
        &self,
        mut avatar_events: broadcast::Receiver<AvatarEvent>,
        mut conversation_events: broadcast::Receiver<ConversationEvent>,
    ) -> SessionResult<Outcome> {
        self.await_renderer(&mut avatar_events).await?;
        self.avatar
            .send_audio_data(&AudioFrame::silence(WARMUP_SILENCE_BYTES))
            .await?;

        self.shared
            .advance(self.generation, SessionState::ConnectingConversation)?;
        self.conversation.connect().await?;
        if !self.shared.is_current(self.generation) {
            return Err(superseded());
        }
        info!(
            target: "avatar::session",
            backend = self.conversation.backend(),
            "conversation connected; waiting for readiness"
        );

        let mut active = false;
        let mut announced: Option<AudioOutputHandle> = None;
        // Discovery may poll for seconds; it runs beside the event arms so
        // barge-in and disconnects are still handled meanwhile.
        let mut bridging: Option<BoxFuture<'static, SessionResult<MediaTrack>>> = None;
        loop {
            enum Event {
                Avatar(AvatarEvent),
                AvatarClosed,
                Conversation(ConversationEvent),
                ConversationClosed,
                Bridged(SessionResult<MediaTrack>),
            }

            let event = tokio::select! {
                res = async {
                    match bridging.as_mut() {
                        Some(fut) => fut.await,
                        None => std::future::pending().await,
                    }
                }, if bridging.is_some() => Event::Bridged(res),
                ev = avatar_events.recv() => match ev {
                    Ok(ev) => Event::Avatar(ev),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => Event::AvatarClosed,
                },
                ev = conversation_events.recv() => match ev {
                    Ok(ev) => Event::Conversation(ev),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "avatar::session", skipped = n, "conversation events lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => Event::ConversationClosed,
                },
            };

            match event {
                Event::Bridged(res) => {
                    bridging = None;
                    res?;
                }
                Event::Avatar(AvatarEvent::Connected) => {}
                Event::Avatar(AvatarEvent::Disconnected { reason }) => {
                    return Err(SessionError::UnexpectedRuntime(format!(
                        "avatar disconnected: {}",
                        reason.as_deref().unwrap_or("no reason given")
                    )));
                }
                Event::AvatarClosed => {
                    return Err(SessionError::UnexpectedRuntime(
                        "avatar event stream closed".to_string(),
                    ));
                }
                Event::ConversationClosed => return Ok(Outcome::CallEnded),
                Event::Conversation(event) => {
                    if event.is_readiness() {
                        if active {
                            continue;
                        }
                        active = true;
                        self.shared.advance(self.generation, SessionState::Active)?;
                        bridging = Some(self.bridge_audio(announced.take()));
                        continue;
                    }
                    if event.is_user_speech_start() {
                        if active {
                            debug!(target: "avatar::session", "user speech; clearing avatar buffer");
                            if let Err(e) = self.avatar.clear_buffer().await {
                                warn!(target: "avatar::session", error = %e, "clear_buffer failed");
                            }
                        }
                        continue;
                    }
                    match event {
                        ConversationEvent::OutputReady(output) => {
                            debug!(target: "avatar::session", output = ?output.id(), "conversation output announced");
                            announced = Some(output);
                        }
                        ConversationEvent::CallEnded { reason } => {
                            debug!(target: "avatar::session", reason = ?reason, "call ended");
                            return Ok(Outcome::CallEnded);
                        }
                        ConversationEvent::Error(message) if active => {
                            return Err(SessionError::UnexpectedRuntime(message));
                        }
                        ConversationEvent::Error(message) => {
                            return Err(SessionError::ConversationConnect(message));
                        }
                        ConversationEvent::Message(ConversationMessage::Transcript {
                            role,
                            text,
                            is_final,
                        }) => {
                            debug!(target: "avatar::session", ?role, is_final, len = text.len(), "transcript");
                        }
                        ConversationEvent::Message(message) => {
                            debug!(target: "avatar::session", ?message, "conversation message");
                        }
                        ConversationEvent::Ready | ConversationEvent::CallStarted => {}
                    }
                }
            }

            if !self.shared.is_current(self.generation) {
                return Ok(Outcome::Detached);
            }
        }
    }

    fn bridge_audio(
        &self,
        announced: Option<AudioOutputHandle>,
    ) -> BoxFuture<'static, SessionResult<MediaTrack>> {
        let bridge = Arc::clone(&self.bridge);
        let env = Arc::clone(&self.shared.env);
        let avatar = Arc::clone(&self.avatar);
        Box::pin(async move {
            bridge
                .connect(announced, env.as_ref(), avatar.as_ref())
                .await
        })
    }

    /// Wait for the renderer's `Connected`. Conversation connect must not begin earlier.
    async fn await_renderer(
        &self,
        avatar_events: &mut broadcast::Receiver<AvatarEvent>,
    ) -> SessionResult<()> {
        loop {
            match avatar_events.recv().await {
                Ok(AvatarEvent::Connected) => {
                    info!(target: "avatar::session", "avatar connected");
                    return Ok(());
                }
                Ok(AvatarEvent::Disconnected { reason }) => {
                    return Err(SessionError::AvatarInit(format!(
                        "avatar disconnected before connecting: {}",
                        reason.as_deref().unwrap_or("no reason given")
                    )));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SessionError::AvatarInit(
                        "avatar event stream closed".to_string(),
                    ));
                }
            }
        }
    }
}
