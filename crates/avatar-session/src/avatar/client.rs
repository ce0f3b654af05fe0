//! **AvatarRenderClient**: HTTP session negotiation plus an injected media plane.
//!
//! `start()` exchanges the credential and face selector for a session token, then
//! hands the token to the [`RenderTransport`], which owns the actual audio/video
//! connection. Transport events are re-published on the client's own bus so the
//! client can track whether audio may be sent.

use super::{AvatarEvent, AvatarRenderer};
use crate::config::{AvatarConfig, RenderSurfaces, HTTP_TIMEOUT};
use crate::error::{SessionError, SessionResult};
use crate::events::EventBus;
use crate::media::{AudioFrame, MediaTrack};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SESSION_PATH: &str = "/startAudioToVideoSession";

/// Token identifying one negotiated render session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSession {
    pub session_token: String,
}

/// Control messages understood by the render backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderCommand {
    /// Drop all queued audio and animation.
    Skip,
}

impl RenderCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderCommand::Skip => "SKIP",
        }
    }
}

/// Media plane of the renderer (e.g. a WebRTC peer connection), supplied by the host.
#[async_trait]
pub trait RenderTransport: Send + Sync {
    /// Open the media connection for a negotiated session and render into `surfaces`.
    async fn open(&self, session: &RenderSession, surfaces: &RenderSurfaces) -> SessionResult<()>;

    async fn send_audio(&self, data: &[u8]) -> SessionResult<()>;

    /// Consume `track` as the lip-sync source, replacing any previous one.
    async fn attach_track(&self, track: &MediaTrack) -> SessionResult<()>;

    async fn send_command(&self, command: RenderCommand) -> SessionResult<()>;

    async fn close(&self);

    fn events(&self) -> broadcast::Receiver<AvatarEvent>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest<'a> {
    face_id: &'a str,
    api_key: &'a str,
    handle_silence: bool,
    max_session_length: u64,
    max_idle_time: u64,
}

#[derive(Deserialize)]
struct SessionResponse {
    session_token: String,
}

#[derive(Default)]
struct ClientState {
    config: Option<AvatarConfig>,
    started: bool,
    connected: bool,
    current_track: Option<MediaTrack>,
}

/// Stock [`AvatarRenderer`] implementation.
pub struct AvatarRenderClient {
    transport: Arc<dyn RenderTransport>,
    http: reqwest::Client,
    state: Arc<Mutex<ClientState>>,
    events: Arc<EventBus<AvatarEvent>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl AvatarRenderClient {
    pub fn new(transport: Arc<dyn RenderTransport>) -> SessionResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| SessionError::AvatarInit(e.to_string()))?;
        Ok(Self {
            transport,
            http,
            state: Arc::new(Mutex::new(ClientState::default())),
            events: Arc::new(EventBus::new()),
            pump: Mutex::new(None),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.lock_state().connected
    }

    /// Track currently forwarded for lip-sync, if any.
    pub fn current_track(&self) -> Option<MediaTrack> {
        self.lock_state().current_track.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn negotiate(&self, config: &AvatarConfig) -> SessionResult<RenderSession> {
        let url = format!("{}{}", config.api_url.trim_end_matches('/'), SESSION_PATH);
        let body = SessionRequest {
            face_id: &config.face_id,
            api_key: config.api_key.expose(),
            handle_silence: config.handle_silence,
            max_session_length: config.max_session_length_secs,
            max_idle_time: config.max_idle_time_secs,
        };
        let res = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::AvatarInit(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(SessionError::AvatarInit(format!(
                "render session rejected {}: {}",
                status, text
            )));
        }
        let parsed: SessionResponse = res
            .json()
            .await
            .map_err(|e| SessionError::AvatarInit(format!("invalid session response: {}", e)))?;
        Ok(RenderSession {
            session_token: parsed.session_token,
        })
    }

    fn spawn_pump(&self) {
        let mut rx = self.transport.events();
        let state = Arc::clone(&self.state);
        let events = Arc::clone(&self.events);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        {
                            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                            guard.connected = matches!(event, AvatarEvent::Connected);
                        }
                        match &event {
                            AvatarEvent::Connected => info!(target: "avatar::render", "renderer connected"),
                            AvatarEvent::Disconnected { reason } => {
                                info!(target: "avatar::render", reason = ?reason, "renderer disconnected")
                            }
                        }
                        events.emit(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "avatar::render", skipped = n, "render transport events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = pump.replace(handle) {
            old.abort();
        }
    }
}

#[async_trait]
impl AvatarRenderer for AvatarRenderClient {
    fn initialize(&self, config: &AvatarConfig) -> SessionResult<()> {
        let mut state = self.lock_state();
        if state.config.is_some() {
            debug!(target: "avatar::render", "already initialized; ignoring");
            return Ok(());
        }
        if config.surfaces.is_none() {
            debug!(target: "avatar::render", "render surfaces not ready; initialize deferred");
            return Ok(());
        }
        state.config = Some(config.clone());
        info!(target: "avatar::render", face_id = %config.face_id, "avatar client initialized");
        Ok(())
    }

    async fn start(&self) -> SessionResult<()> {
        let config = {
            let state = self.lock_state();
            if state.started {
                return Ok(());
            }
            state.config.clone().ok_or_else(|| {
                SessionError::AvatarInit("render surfaces are not bound".to_string())
            })?
        };
        let surfaces = config
            .surfaces
            .clone()
            .ok_or_else(|| SessionError::AvatarInit("render surfaces are not bound".to_string()))?;

        let session = self.negotiate(&config).await?;
        debug!(target: "avatar::render", "render session negotiated");

        self.spawn_pump();
        self.lock_state().started = true;
        self.transport
            .open(&session, &surfaces)
            .await
            .map_err(|e| SessionError::AvatarInit(e.to_string()))?;
        Ok(())
    }

    async fn send_audio_data(&self, frame: &AudioFrame) -> SessionResult<()> {
        if !self.is_connected() {
            return Err(SessionError::Transport(
                "renderer is not connected; audio dropped".to_string(),
            ));
        }
        self.transport.send_audio(&frame.data).await
    }

    async fn listen_to_media_stream_track(&self, track: MediaTrack) -> SessionResult<()> {
        if !self.lock_state().started {
            return Err(SessionError::Transport("renderer is not started".to_string()));
        }
        self.transport.attach_track(&track).await?;
        info!(target: "avatar::render", track = %track.id, "listening to media stream track");
        self.lock_state().current_track = Some(track);
        Ok(())
    }

    async fn clear_buffer(&self) -> SessionResult<()> {
        if !self.is_connected() {
            debug!(target: "avatar::render", "clear_buffer before connect; nothing queued");
            return Ok(());
        }
        self.transport.send_command(RenderCommand::Skip).await
    }

    async fn close(&self) {
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
        let was_started = {
            let mut state = self.lock_state();
            let was_started = state.started;
            state.started = false;
            state.connected = false;
            state.current_track = None;
            was_started
        };
        if was_started {
            self.transport.close().await;
            info!(target: "avatar::render", "avatar client closed");
        }
    }

    fn events(&self) -> broadcast::Receiver<AvatarEvent> {
        self.events.subscribe()
    }
}

impl Drop for AvatarRenderClient {
    fn drop(&mut self) {
        if let Some(pump) = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKey;
    use mockito::Matcher;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeTransport {
        bus: EventBus<AvatarEvent>,
        log: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RenderTransport for FakeTransport {
        async fn open(
            &self,
            session: &RenderSession,
            surfaces: &RenderSurfaces,
        ) -> SessionResult<()> {
            self.log.lock().unwrap().push(format!(
                "open:{}:{}",
                session.session_token, surfaces.audio_output_id
            ));
            Ok(())
        }
        async fn send_audio(&self, data: &[u8]) -> SessionResult<()> {
            self.log.lock().unwrap().push(format!("audio:{}", data.len()));
            Ok(())
        }
        async fn attach_track(&self, track: &MediaTrack) -> SessionResult<()> {
            self.log.lock().unwrap().push(format!("track:{}", track.id));
            Ok(())
        }
        async fn send_command(&self, command: RenderCommand) -> SessionResult<()> {
            self.log.lock().unwrap().push(command.as_str().to_string());
            Ok(())
        }
        async fn close(&self) {
            self.log.lock().unwrap().push("close".to_string());
        }
        fn events(&self) -> broadcast::Receiver<AvatarEvent> {
            self.bus.subscribe()
        }
    }

    fn config(url: &str) -> AvatarConfig {
        AvatarConfig::new(ApiKey::new("simli-key"), "face-7")
            .with_api_url(url)
            .with_surfaces(RenderSurfaces::default())
    }

    async fn wait_connected(client: &AvatarRenderClient) {
        for _ in 0..100 {
            if client.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("client never observed Connected");
    }

    #[tokio::test]
    async fn start_negotiates_and_opens_transport() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/startAudioToVideoSession")
            .match_body(Matcher::Json(json!({
                "faceId": "face-7",
                "apiKey": "simli-key",
                "handleSilence": true,
                "maxSessionLength": 3600,
                "maxIdleTime": 300
            })))
            .with_status(200)
            .with_body(r#"{"session_token":"tok-1"}"#)
            .create_async()
            .await;

        let transport = Arc::new(FakeTransport::default());
        let client = AvatarRenderClient::new(transport.clone()).unwrap();
        client.initialize(&config(&server.url())).unwrap();
        client.start().await.unwrap();

        mock.assert_async().await;
        assert_eq!(transport.log(), vec!["open:tok-1:avatar_audio".to_string()]);
    }

    #[tokio::test]
    async fn start_without_surfaces_fails() {
        let client = AvatarRenderClient::new(Arc::new(FakeTransport::default())).unwrap();
        let cfg = AvatarConfig::new(ApiKey::new("k"), "face");
        client.initialize(&cfg).unwrap();
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, SessionError::AvatarInit(_)));
    }

    #[tokio::test]
    async fn rejected_session_carries_backend_text() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/startAudioToVideoSession")
            .with_status(401)
            .with_body("invalid api key")
            .create_async()
            .await;

        let client = AvatarRenderClient::new(Arc::new(FakeTransport::default())).unwrap();
        client.initialize(&config(&server.url())).unwrap();
        let err = client.start().await.unwrap_err();
        match err {
            SessionError::AvatarInit(msg) => assert!(msg.contains("invalid api key")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn audio_is_refused_until_connected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/startAudioToVideoSession")
            .with_status(200)
            .with_body(r#"{"session_token":"tok-2"}"#)
            .create_async()
            .await;

        let transport = Arc::new(FakeTransport::default());
        let client = AvatarRenderClient::new(transport.clone()).unwrap();
        client.initialize(&config(&server.url())).unwrap();
        let mut events = client.events();
        client.start().await.unwrap();

        let silence = AudioFrame::silence(6000);
        assert!(client.send_audio_data(&silence).await.is_err());

        transport.bus.emit(AvatarEvent::Connected);
        assert_eq!(events.recv().await.unwrap(), AvatarEvent::Connected);
        wait_connected(&client).await;

        client.send_audio_data(&silence).await.unwrap();
        client.clear_buffer().await.unwrap();
        client
            .listen_to_media_stream_track(MediaTrack::new("conv-track"))
            .await
            .unwrap();
        assert_eq!(client.current_track(), Some(MediaTrack::new("conv-track")));

        assert_eq!(
            transport.log(),
            vec![
                "open:tok-2:avatar_audio".to_string(),
                "audio:6000".to_string(),
                "SKIP".to_string(),
                "track:conv-track".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn close_is_safe_when_never_started() {
        let transport = Arc::new(FakeTransport::default());
        let client = AvatarRenderClient::new(transport.clone()).unwrap();
        client.close().await;
        client.close().await;
        assert!(transport.log().is_empty());
    }

    #[test]
    fn second_initialize_is_ignored() {
        let client = AvatarRenderClient::new(Arc::new(FakeTransport::default())).unwrap();
        client.initialize(&config("http://first")).unwrap();
        client.initialize(&config("http://second")).unwrap();
        let state = client.lock_state();
        assert_eq!(state.config.as_ref().unwrap().api_url, "http://first");
    }
}
