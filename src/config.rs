//! Global configuration parsing, validation, and environment overrides.

use std::collections::{HashMap, HashSet};
use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::framing::codec::{DEFAULT_LENGTH_HEADER, DEFAULT_MAX_BUFFER_BYTES};
use crate::registry::DEFAULT_CAPABILITY;
use crate::{AppError, Result};

/// Per-session resource limits shared by every listener.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Window between the graceful termination signal and a forced kill.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Capacity of the bounded adapter stdin queue, in messages.
    #[serde(default = "default_write_queue_capacity")]
    pub write_queue_capacity: usize,
    /// Client messages held while the adapter is spawning or not yet
    /// draining stdin.
    #[serde(default = "default_max_pending_messages")]
    pub max_pending_messages: usize,
    /// Trailing stderr bytes retained for crash diagnostics.
    #[serde(default = "default_stderr_tail_bytes")]
    pub stderr_tail_bytes: usize,
    /// How long process shutdown waits for live sessions to tear down.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl SessionConfig {
    /// Grace period as a [`Duration`].
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Shutdown timeout as a [`Duration`].
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            write_queue_capacity: default_write_queue_capacity(),
            max_pending_messages: default_max_pending_messages(),
            stderr_tail_bytes: default_stderr_tail_bytes(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_grace_period_ms() -> u64 {
    3000
}

fn default_write_queue_capacity() -> usize {
    64
}

fn default_max_pending_messages() -> usize {
    256
}

fn default_stderr_tail_bytes() -> usize {
    4096
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

/// Framing parameters for one listener's adapters.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct FramingConfig {
    /// Header carrying the body length.
    #[serde(default = "default_length_header")]
    pub length_header: String,
    /// Optional `Content-Type` emitted on every outbound frame.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Ceiling on bytes buffered while assembling a frame.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            length_header: default_length_header(),
            content_type: None,
            max_buffer_bytes: default_max_buffer_bytes(),
        }
    }
}

fn default_length_header() -> String {
    DEFAULT_LENGTH_HEADER.into()
}

fn default_max_buffer_bytes() -> usize {
    DEFAULT_MAX_BUFFER_BYTES
}

/// Spawn command for one capability.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AdapterEntry {
    /// Executable path or name resolved through `PATH`.
    pub command: String,
    /// Arguments passed to the executable, in order.
    #[serde(default)]
    pub args: Vec<String>,
}

/// One WebSocket endpoint fronting one family of adapters.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ListenerConfig {
    /// Short name used in logs (e.g. `lsp`, `dap`).
    pub name: String,
    /// Interface to bind.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// TCP port; `0` asks the OS for an ephemeral port.
    pub port: u16,
    /// Environment variable that overrides `port` when set.
    #[serde(default)]
    pub port_env: Option<String>,
    /// HTTP path that accepts the WebSocket upgrade.
    #[serde(default = "default_path")]
    pub path: String,
    /// JSON pointer to the capability identifier in the first client message.
    #[serde(default)]
    pub capability_pointer: String,
    /// Whether the capability-declaring message is also sent to the adapter.
    #[serde(default = "default_true")]
    pub forward_first_message: bool,
    /// Wire framing towards the adapters.
    #[serde(default)]
    pub framing: FramingConfig,
    /// Capability identifier to spawn command; must contain `default`.
    pub adapters: HashMap<String, AdapterEntry>,
}

impl ListenerConfig {
    /// Socket address the listener binds to.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    fn validate(&self) -> Result<()> {
        let name = &self.name;
        if name.trim().is_empty() {
            return Err(AppError::Config("listener name must not be empty".into()));
        }
        if !self.path.starts_with('/') {
            return Err(AppError::Config(format!(
                "listener '{name}': path must start with '/'"
            )));
        }
        if !self.capability_pointer.is_empty() && !self.capability_pointer.starts_with('/') {
            return Err(AppError::Config(format!(
                "listener '{name}': capability_pointer must be empty or start with '/'"
            )));
        }
        if self.framing.max_buffer_bytes == 0 {
            return Err(AppError::Config(format!(
                "listener '{name}': framing.max_buffer_bytes must be greater than zero"
            )));
        }
        if self.framing.length_header.trim().is_empty() {
            return Err(AppError::Config(format!(
                "listener '{name}': framing.length_header must not be empty"
            )));
        }
        if !self.adapters.contains_key(DEFAULT_CAPABILITY) {
            return Err(AppError::Config(format!(
                "listener '{name}': adapters must include a '{DEFAULT_CAPABILITY}' entry"
            )));
        }
        if let Some((id, _)) = self
            .adapters
            .iter()
            .find(|(_, entry)| entry.command.trim().is_empty())
        {
            return Err(AppError::Config(format!(
                "listener '{name}': adapter '{id}' has an empty command"
            )));
        }
        Ok(())
    }
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_path() -> String {
    "/".into()
}

fn default_true() -> bool {
    true
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Session limits and timeouts.
    #[serde(default)]
    pub session: SessionConfig,
    /// Listeners, one per adapter family.
    pub listeners: Vec<ListenerConfig>,
}

impl GlobalConfig {
    /// Load, validate, and apply environment overrides from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, fails validation, or an override variable is malformed.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace listener ports from their `port_env` variables when present.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a variable is set but is not a valid port.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        for listener in &mut self.listeners {
            let Some(ref var) = listener.port_env else {
                continue;
            };
            let Ok(raw) = env::var(var) else {
                continue;
            };
            let port = raw.trim().parse::<u16>().map_err(|err| {
                AppError::Config(format!("{var}={raw:?} is not a valid port: {err}"))
            })?;
            info!(
                listener = %listener.name,
                env = %var,
                port,
                "listener port overridden from environment"
            );
            listener.port = port;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            return Err(AppError::Config(
                "at least one listener must be configured".into(),
            ));
        }
        if self.session.write_queue_capacity == 0 {
            return Err(AppError::Config(
                "session.write_queue_capacity must be greater than zero".into(),
            ));
        }
        if self.session.max_pending_messages == 0 {
            return Err(AppError::Config(
                "session.max_pending_messages must be greater than zero".into(),
            ));
        }

        let mut names = HashSet::new();
        for listener in &self.listeners {
            listener.validate()?;
            if !names.insert(listener.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate listener name '{}'",
                    listener.name
                )));
            }
        }
        Ok(())
    }
}
