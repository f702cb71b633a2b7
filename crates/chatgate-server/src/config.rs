//! Server configuration: TOML file + CLI overrides.

use chatgate_core::{GateError, GateResult, CHALLENGE_PAYLOAD};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Where an authenticated session's chat messages go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RelayPolicy {
    /// Write the re-tagged message back to the sender only.
    Echo,
    /// Deliver to every other registered session, not the sender.
    Others,
    /// Deliver to every registered session including the sender.
    All,
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub identity: IdentitySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    #[serde(default = "default_relay")]
    pub relay: RelayPolicy,
    #[serde(default = "default_challenge")]
    pub challenge: String,
    #[serde(default)]
    pub error_envelopes: bool,
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
            auth_timeout_ms: default_auth_timeout_ms(),
            relay: default_relay(),
            challenge: default_challenge(),
            error_envelopes: false,
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

/// `[identity]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySection {
    #[serde(default = "default_identity_url")]
    pub base_url: String,
    #[serde(default = "default_identity_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            base_url: default_identity_url(),
            timeout_ms: default_identity_timeout_ms(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_admin_listen() -> String {
    "127.0.0.1:8081".to_string()
}
fn default_auth_timeout_ms() -> u64 {
    5000
}
fn default_relay() -> RelayPolicy {
    RelayPolicy::All
}
fn default_challenge() -> String {
    CHALLENGE_PAYLOAD.to_string()
}
fn default_outbox_capacity() -> usize {
    64
}
fn default_identity_url() -> String {
    "https://learnalist.net/api/v1".to_string()
}
fn default_identity_timeout_ms() -> u64 {
    500
}

/// Values given on the command line. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
    pub relay: Option<RelayPolicy>,
    pub auth_timeout_ms: Option<u64>,
    pub identity_url: Option<String>,
}

/// Resolved server configuration (addresses parsed, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub admin_listen: SocketAddr,
    pub auth_timeout: Duration,
    pub relay: RelayPolicy,
    pub challenge: String,
    pub error_envelopes: bool,
    pub outbox_capacity: usize,
    pub identity_url: String,
    pub identity_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            admin_listen: SocketAddr::from(([127, 0, 0, 1], 8081)),
            auth_timeout: Duration::from_millis(default_auth_timeout_ms()),
            relay: default_relay(),
            challenge: default_challenge(),
            error_envelopes: false,
            outbox_capacity: default_outbox_capacity(),
            identity_url: default_identity_url(),
            identity_timeout: Duration::from_millis(default_identity_timeout_ms()),
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> GateResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| GateError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    fn resolve(file: ConfigFile, overrides: Overrides) -> GateResult<Self> {
        let listen = overrides.listen.unwrap_or(file.server.listen);
        let admin_listen = overrides.admin_listen.unwrap_or(file.server.admin_listen);

        if file.server.outbox_capacity == 0 {
            return Err(GateError::Config("outbox_capacity must be at least 1".into()));
        }

        Ok(Self {
            listen: parse_addr("listen", &listen)?,
            admin_listen: parse_addr("admin_listen", &admin_listen)?,
            auth_timeout: Duration::from_millis(
                overrides
                    .auth_timeout_ms
                    .unwrap_or(file.server.auth_timeout_ms),
            ),
            relay: overrides.relay.unwrap_or(file.server.relay),
            challenge: file.server.challenge,
            error_envelopes: file.server.error_envelopes,
            outbox_capacity: file.server.outbox_capacity,
            identity_url: overrides.identity_url.unwrap_or(file.identity.base_url),
            identity_timeout: Duration::from_millis(file.identity.timeout_ms),
        })
    }
}

fn parse_addr(field: &str, value: &str) -> GateResult<SocketAddr> {
    value
        .parse()
        .map_err(|e| GateError::Config(format!("invalid {field} address {value:?}: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
