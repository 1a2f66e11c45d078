//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use aero_core::liveness::LivenessConfig;
use aero_core::{CoordinatorConfig, DeviceClass};
use anyhow::Context;
use serde::Deserialize;

/// How a peer that is not yet pinned is treated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthPolicyKind {
    /// Accept and pin on first contact.
    Tofu,
    /// Ask the user to compare the verification code.
    Prompt,
    /// Only already-pinned peers.
    TrustedOnly,
}

impl std::str::FromStr for AuthPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tofu" | "trust-on-first-use" => Ok(Self::Tofu),
            "prompt" | "verify" => Ok(Self::Prompt),
            "trusted-only" | "trusted" => Ok(Self::TrustedOnly),
            other => Err(format!("unknown auth policy {other:?}")),
        }
    }
}

/// Daemon configuration. File: ~/.config/aerosync/config.toml or /etc/aerosync/config.toml.
/// Env overrides: AEROSYNC_DISCOVERY_PORT, AEROSYNC_TRANSPORT_PORT, AEROSYNC_DISPLAY_NAME,
/// AEROSYNC_DOWNLOAD_DIR, AEROSYNC_STATE_DIR, AEROSYNC_AUTH_POLICY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Discovery UDP port (default 45678). 0 turns LAN discovery off.
    pub discovery_port: u16,
    /// Transport TCP port (default 45679).
    pub transport_port: u16,
    pub display_name: String,
    pub device_class: DeviceClass,
    /// Host to advertise instead of the datagram source address.
    pub advertise_host: Option<String>,
    pub download_dir: PathBuf,
    /// Identity key and trusted peers live here.
    pub state_dir: PathBuf,
    pub heartbeat_interval_secs: u64,
    pub announce_interval_secs: u64,
    pub stale_after_secs: u64,
    pub offline_after_secs: u64,
    pub prune_after_secs: u64,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub auth_policy: AuthPolicyKind,
    pub auth_prompt_timeout_secs: u64,
    pub ack_timeout_secs: u64,
    pub verify_checksums: bool,
    pub auto_reconnect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: 45678,
            transport_port: 45679,
            display_name: default_display_name(),
            device_class: DeviceClass::Desktop,
            advertise_host: None,
            download_dir: default_download_dir(),
            state_dir: default_state_dir(),
            heartbeat_interval_secs: 5,
            announce_interval_secs: 15,
            stale_after_secs: 5,
            offline_after_secs: 15,
            prune_after_secs: 120,
            connect_timeout_secs: 5,
            handshake_timeout_secs: 10,
            auth_policy: AuthPolicyKind::Tofu,
            auth_prompt_timeout_secs: 60,
            ack_timeout_secs: 10,
            verify_checksums: true,
            auto_reconnect: true,
        }
    }
}

fn home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn default_display_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "aerosync".to_string())
}

fn default_download_dir() -> PathBuf {
    match home() {
        Some(h) => h.join("Downloads/AeroSync"),
        None => PathBuf::from("downloads"),
    }
}

fn default_state_dir() -> PathBuf {
    if let Some(data) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(data).join("aerosync");
    }
    match home() {
        Some(h) => h.join(".local/share/aerosync"),
        None => PathBuf::from(".aerosync"),
    }
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn auth_prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_prompt_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            liveness: LivenessConfig::new(
                Duration::from_secs(self.stale_after_secs),
                Duration::from_secs(self.offline_after_secs),
            ),
            prune_after: Duration::from_secs(self.prune_after_secs),
            auto_reconnect: self.auto_reconnect,
            download_dir: self.download_dir.clone(),
        }
    }

    /// Apply `AEROSYNC_*` overrides. Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn port(key: &str, value: String) -> Option<u16> {
            value
                .parse()
                .map_err(|_| tracing::warn!(key, value = %value, "ignoring invalid port"))
                .ok()
        }
        if let Some(p) = lookup("AEROSYNC_DISCOVERY_PORT").and_then(|v| port("AEROSYNC_DISCOVERY_PORT", v)) {
            self.discovery_port = p;
        }
        if let Some(p) = lookup("AEROSYNC_TRANSPORT_PORT").and_then(|v| port("AEROSYNC_TRANSPORT_PORT", v)) {
            self.transport_port = p;
        }
        if let Some(name) = lookup("AEROSYNC_DISPLAY_NAME").filter(|s| !s.trim().is_empty()) {
            self.display_name = name;
        }
        if let Some(dir) = lookup("AEROSYNC_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("AEROSYNC_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup("AEROSYNC_AUTH_POLICY") {
            match v.parse() {
                Ok(policy) => self.auth_policy = policy,
                Err(e) => tracing::warn!(error = %e, "ignoring AEROSYNC_AUTH_POLICY"),
            }
        }
    }
}

/// Load config: defaults, then the first config file found, then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = home() {
        out.push(h.join(".config/aerosync/config.toml"));
    }
    out.push(PathBuf::from("/etc/aerosync/config.toml"));
    out
}

pub fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let c = toml::from_str::<Config>(&s)
        .with_context(|| format!("invalid config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(c)
}
