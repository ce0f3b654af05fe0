//! Session configuration: avatar renderer, conversation backend and audio bridge.
//!
//! Loaded from an optional TOML file plus environment overrides. Credentials are
//! read from the environment after `.env` is applied and are never logged.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | AVATAR_SESSION_CONFIG | config/session.toml | Path of the TOML settings file. |
//! | AVATAR_SESSION__<SECTION>__<KEY> | – | Override any settings key (e.g. `AVATAR_SESSION__AVATAR__FACE_ID`). |
//! | AVATAR_API_KEY | – | Avatar-rendering service credential. |
//! | CONVERSATION_API_KEY | – | Hosted agent credential (agent backend only). |

use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_AVATAR_API_URL: &str = "https://api.simli.ai";
pub const DEFAULT_AGENT_API_URL: &str = "https://api.vapi.ai";
pub const DEFAULT_PIPELINE_BASE_URL: &str = "http://127.0.0.1:7860/api";
pub const DEFAULT_RENDER_AUDIO_ID: &str = "avatar_audio";
pub const DEFAULT_RENDER_VIDEO_ID: &str = "avatar_video";

/// Request timeout for every HTTP client in the crate.
pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A service credential. `Debug` never prints the value.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into().trim().to_string())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("ApiKey(<unset>)")
        } else {
            f.write_str("ApiKey(***)")
        }
    }
}

/// Output surfaces the renderer draws into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderSurfaces {
    pub video_surface_id: String,
    /// Identifier of the renderer's own audio output; the bridge never selects it.
    pub audio_output_id: String,
}

impl Default for RenderSurfaces {
    fn default() -> Self {
        Self {
            video_surface_id: DEFAULT_RENDER_VIDEO_ID.to_string(),
            audio_output_id: DEFAULT_RENDER_AUDIO_ID.to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_avatar_api_url() -> String {
    DEFAULT_AVATAR_API_URL.to_string()
}

fn default_max_session_length() -> u64 {
    3600
}

fn default_max_idle_time() -> u64 {
    300
}

/// Avatar renderer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarConfig {
    #[serde(default = "default_avatar_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: ApiKey,
    /// Face/identity selector.
    pub face_id: String,
    /// Hold a neutral pose while no audio arrives.
    #[serde(default = "default_true")]
    pub handle_silence: bool,
    #[serde(default = "default_max_session_length")]
    pub max_session_length_secs: u64,
    #[serde(default = "default_max_idle_time")]
    pub max_idle_time_secs: u64,
    /// `None` until the host has created its output surfaces.
    #[serde(default)]
    pub surfaces: Option<RenderSurfaces>,
}

impl AvatarConfig {
    pub fn new(api_key: ApiKey, face_id: impl Into<String>) -> Self {
        Self {
            api_url: default_avatar_api_url(),
            api_key,
            face_id: face_id.into(),
            handle_silence: true,
            max_session_length_secs: default_max_session_length(),
            max_idle_time_secs: default_max_idle_time(),
            surfaces: None,
        }
    }

    pub fn with_surfaces(mut self, surfaces: RenderSurfaces) -> Self {
        self.surfaces = Some(surfaces);
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Identifier of the renderer's own audio output, when surfaces are bound.
    pub fn render_audio_id(&self) -> Option<&str> {
        self.surfaces.as_ref().map(|s| s.audio_output_id.as_str())
    }
}

/// One `{name, value}` pair forwarded verbatim to a pipeline service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigOption {
    pub name: String,
    pub value: Value,
}

/// Ordered options for one named pipeline service (`tts`, `llm`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub service: String,
    #[serde(default)]
    pub options: Vec<ConfigOption>,
}

impl ServiceConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            options: Vec::new(),
        }
    }

    /// Append an option, keeping insertion order.
    pub fn option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.push(ConfigOption {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

/// Which provider backs each pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSelection {
    pub stt: String,
    pub tts: String,
    pub llm: String,
}

impl Default for ServiceSelection {
    fn default() -> Self {
        Self {
            stt: "deepgram".to_string(),
            tts: "cartesia".to_string(),
            llm: "anthropic".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineEndpoints {
    pub connect: String,
    pub action: String,
}

impl Default for PipelineEndpoints {
    fn default() -> Self {
        Self {
            connect: "/connect".to_string(),
            action: "/actions".to_string(),
        }
    }
}

fn default_pipeline_base_url() -> String {
    DEFAULT_PIPELINE_BASE_URL.to_string()
}

/// Multi-service pipeline backend (separate STT, LLM and TTS services).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub endpoints: PipelineEndpoints,
    #[serde(default)]
    pub services: ServiceSelection,
    /// Forwarded to the backend's connect call unmodified and in order.
    #[serde(default)]
    pub config: Vec<ServiceConfig>,
}

impl PipelineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            endpoints: PipelineEndpoints::default(),
            services: ServiceSelection::default(),
            config: Vec::new(),
        }
    }

    pub fn with_service_config(mut self, service: ServiceConfig) -> Self {
        self.config.push(service);
        self
    }
}

fn default_agent_api_url() -> String {
    DEFAULT_AGENT_API_URL.to_string()
}

/// Hosted single-endpoint conversational agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    #[serde(default = "default_agent_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: ApiKey,
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>, api_key: ApiKey) -> Self {
        Self {
            agent_id: agent_id.into(),
            api_url: default_agent_api_url(),
            api_key,
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }
}

/// Conversation backend selection. The tag picks the client implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ConversationConfig {
    Pipeline(PipelineConfig),
    Agent(AgentConfig),
}

impl ConversationConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            ConversationConfig::Pipeline(_) => "pipeline",
            ConversationConfig::Agent(_) => "agent",
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    500
}

/// Bounds for the audio-output discovery poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl BridgeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Worst-case time spent polling before giving up.
    pub fn timeout(&self) -> Duration {
        self.poll_interval() * self.max_attempts.max(1)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Everything one controller needs to run sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub avatar: AvatarConfig,
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl SessionSettings {
    /// Load settings. Precedence: env `AVATAR_SESSION__*` > file (`AVATAR_SESSION_CONFIG`
    /// or `config/session.toml`) > defaults. Credentials come from the environment
    /// when the file leaves them empty.
    pub fn load() -> SessionResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            debug!(target: "avatar::config", "no .env loaded: {}", e);
        }
        let config_path = std::env::var("AVATAR_SESSION_CONFIG")
            .unwrap_or_else(|_| "config/session.toml".to_string());

        let builder = Self::builder_with_defaults()?;
        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };
        let settings: Self = builder
            .add_source(config::Environment::with_prefix("AVATAR_SESSION").separator("__"))
            .build()?
            .try_deserialize()?;

        let settings = settings.with_env_credentials();
        settings.validate()?;
        Ok(settings)
    }

    /// Load from one file over the defaults, without consulting the environment.
    pub fn load_from(path: &Path) -> SessionResult<Self> {
        let settings: Self = Self::builder_with_defaults()?
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn builder_with_defaults(
    ) -> SessionResult<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(config::Config::builder()
            .set_default("avatar.api_url", DEFAULT_AVATAR_API_URL)?
            .set_default("avatar.handle_silence", true)?
            .set_default("avatar.surfaces.video_surface_id", DEFAULT_RENDER_VIDEO_ID)?
            .set_default("avatar.surfaces.audio_output_id", DEFAULT_RENDER_AUDIO_ID)?
            .set_default("conversation.backend", "pipeline")?
            .set_default("bridge.poll_interval_ms", default_poll_interval_ms() as i64)?
            .set_default("bridge.max_attempts", default_max_attempts() as i64)?)
    }

    /// Fill empty credentials from `AVATAR_API_KEY` / `CONVERSATION_API_KEY`.
    pub fn with_env_credentials(mut self) -> Self {
        if self.avatar.api_key.is_empty() {
            if let Some(key) = env_opt_string("AVATAR_API_KEY") {
                self.avatar.api_key = ApiKey::new(key);
            }
        }
        if let ConversationConfig::Agent(agent) = &mut self.conversation {
            if agent.api_key.is_empty() {
                if let Some(key) = env_opt_string("CONVERSATION_API_KEY") {
                    agent.api_key = ApiKey::new(key);
                }
            }
        }
        self
    }

    pub fn validate(&self) -> SessionResult<()> {
        if self.avatar.face_id.trim().is_empty() {
            return Err(SessionError::Config("avatar.face_id must not be empty".into()));
        }
        match &self.conversation {
            ConversationConfig::Pipeline(p) if p.base_url.trim().is_empty() => Err(
                SessionError::Config("conversation.base_url must not be empty".into()),
            ),
            ConversationConfig::Agent(a) if a.agent_id.trim().is_empty() => Err(
                SessionError::Config("conversation.agent_id must not be empty".into()),
            ),
            _ => Ok(()),
        }
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn api_key_is_redacted() {
        let key = ApiKey::new("sk-live-very-secret");
        let shown = format!("{:?}", key);
        assert!(!shown.contains("secret"));
        assert_eq!(shown, "ApiKey(***)");
        assert_eq!(format!("{:?}", ApiKey::default()), "ApiKey(<unset>)");

        let cfg = AvatarConfig::new(key, "face-1");
        assert!(!format!("{:?}", cfg).contains("very-secret"));
    }

    #[test]
    fn service_options_keep_order_and_structure() {
        let llm = ServiceConfig::new("llm")
            .option("model", "claude-3-5-sonnet-latest")
            .option(
                "initial_messages",
                json!([{"role": "user", "content": [{"type": "text", "text": "Act as a pirate."}]}]),
            )
            .option("run_on_config", true);

        let value = serde_json::to_value(&llm).unwrap();
        assert_eq!(
            value,
            json!({
                "service": "llm",
                "options": [
                    {"name": "model", "value": "claude-3-5-sonnet-latest"},
                    {"name": "initial_messages", "value": [{"role": "user", "content": [{"type": "text", "text": "Act as a pirate."}]}]},
                    {"name": "run_on_config", "value": true}
                ]
            })
        );
    }

    #[test]
    fn conversation_config_is_tagged() {
        let cfg = ConversationConfig::Agent(AgentConfig::new("agent-42", ApiKey::default()));
        let value = serde_json::to_value(&cfg).unwrap();
        assert_eq!(value["backend"], "agent");
        assert_eq!(value["agent_id"], "agent-42");
        assert_eq!(cfg.backend_name(), "agent");
    }

    #[test]
    fn bridge_timeout_is_bounded() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.poll_interval(), Duration::from_millis(10));
        assert_eq!(cfg.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn load_pipeline_settings_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[avatar]
face_id = "101bef0d"

[conversation]
backend = "pipeline"
base_url = "http://localhost:7860/api"

[[conversation.config]]
service = "tts"
options = [{{ name = "voice", value = "V1" }}]

[[conversation.config]]
service = "llm"
options = [{{ name = "model", value = "M1" }}, {{ name = "run_on_config", value = true }}]
"#
        )
        .unwrap();

        let settings = SessionSettings::load_from(file.path()).unwrap();
        assert_eq!(settings.avatar.face_id, "101bef0d");
        assert!(settings.avatar.handle_silence);
        assert_eq!(settings.avatar.render_audio_id(), Some(DEFAULT_RENDER_AUDIO_ID));
        assert_eq!(settings.bridge, BridgeConfig::default());

        let ConversationConfig::Pipeline(pipeline) = settings.conversation else {
            panic!("expected pipeline backend");
        };
        assert_eq!(pipeline.endpoints, PipelineEndpoints::default());
        let services: Vec<&str> = pipeline.config.iter().map(|s| s.service.as_str()).collect();
        assert_eq!(services, vec!["tts", "llm"]);
        assert_eq!(pipeline.config[0].options[0].value, json!("V1"));
        assert_eq!(pipeline.config[1].options[1].value, json!(true));
    }

    #[test]
    fn load_rejects_empty_face_id() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[avatar]
face_id = ""

[conversation]
backend = "agent"
agent_id = "a-1"
"#
        )
        .unwrap();

        let err = SessionSettings::load_from(file.path()).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }
}
