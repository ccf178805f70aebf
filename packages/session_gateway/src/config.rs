use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use session_manager::ManagerConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [sessions]
//                    max_pairing_attempts = 5
//
//   env var:         WAG_SESSIONS__MAX_PAIRING_ATTEMPTS=5   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub sessions: SessionsFileConfig,
}

/// HTTP listener knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted request body; media arrives base64-encoded inline.
    #[serde(default = "default_max_body_mb")]
    pub max_body_mb: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_mb: default_max_body_mb(),
        }
    }
}

/// Session lifecycle tunables (lives under `[sessions]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionsFileConfig {
    /// Credential folder root. Defaults to `<data dir>/auth`.
    #[serde(default)]
    pub auth_dir: Option<PathBuf>,
    #[serde(default = "default_max_pairing_attempts")]
    pub max_pairing_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_presence_delay_ms")]
    pub presence_delay_ms: u64,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default)]
    pub fallback_version: Option<String>,
}

impl Default for SessionsFileConfig {
    fn default() -> Self {
        Self {
            auth_dir: None,
            max_pairing_attempts: default_max_pairing_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            presence_delay_ms: default_presence_delay_ms(),
            batch_delay_ms: default_batch_delay_ms(),
            fallback_version: None,
        }
    }
}

impl SessionsFileConfig {
    pub fn manager_config(&self) -> ManagerConfig {
        let defaults = ManagerConfig::default();
        ManagerConfig {
            max_pairing_attempts: self.max_pairing_attempts.max(1),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            presence_delay: Duration::from_millis(self.presence_delay_ms),
            batch_delay: Duration::from_millis(self.batch_delay_ms),
            fallback_version: self
                .fallback_version
                .clone()
                .unwrap_or(defaults.fallback_version),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3009
}
fn default_max_body_mb() -> usize {
    50
}
fn default_max_pairing_attempts() -> u32 {
    3
}
fn default_reconnect_delay_ms() -> u64 {
    3000
}
fn default_presence_delay_ms() -> u64 {
    500
}
fn default_batch_delay_ms() -> u64 {
    1500
}

/// Build a figment that layers: defaults → config.toml → WAG_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `WAG_SERVER__PORT=8080`  →  `server.port = 8080`
///   `WAG_SESSIONS__BATCH_DELAY_MS=500`  →  `sessions.batch_delay_ms = 500`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("WAG_").split("__"))
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub data_dir: PathBuf,
}

impl GatewayConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".wagateway"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    /// Credential folder root, honoring the `sessions.auth_dir` override.
    /// Relative overrides resolve against the data directory.
    pub fn auth_dir(&self, sessions: &SessionsFileConfig) -> PathBuf {
        match &sessions.auth_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.data_dir.join(dir),
            None => self.data_dir.join("auth"),
        }
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
