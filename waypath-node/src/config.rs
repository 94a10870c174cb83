//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use waypath_core::TransportConfig;

/// Node configuration. File: ~/.config/waypath/config.toml or /etc/waypath/config.toml.
/// Env overrides: WAYPATH_KEY_FILE, WAYPATH_PEERSTORE_FILE, WAYPATH_LOG,
/// WAYPATH_STATS_INTERVAL_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Hex-encoded ed25519 secret key of this peer.
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    /// JSON file backing the peer store.
    #[serde(default = "default_peerstore_file")]
    pub peerstore_file: PathBuf,
    /// `tracing` filter directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Seconds between statistics dumps at info level; 0 turns them off.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("bad value for {var}: {value}")]
    Env { var: &'static str, value: String },
}

fn data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/waypath"),
        None => PathBuf::from("/var/lib/waypath"),
    }
}

fn default_key_file() -> PathBuf {
    data_dir().join("identity.key")
}
fn default_peerstore_file() -> PathBuf {
    data_dir().join("peerstore.json")
}
fn default_log_filter() -> String {
    "info".to_string()
}
fn default_stats_interval() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
            peerstore_file: default_peerstore_file(),
            log_filter: default_log_filter(),
            stats_interval_secs: default_stats_interval(),
            transport: TransportConfig::default(),
        }
    }
}

/// Load config: default, then the given or first existing config file, then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let file = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => config_paths().into_iter().find(|p| p.exists()),
    };
    let mut c = match file {
        Some(p) => load_file(&p)?,
        None => Config::default(),
    };
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    if let Some(s) = var("WAYPATH_KEY_FILE") {
        c.key_file = PathBuf::from(s);
    }
    if let Some(s) = var("WAYPATH_PEERSTORE_FILE") {
        c.peerstore_file = PathBuf::from(s);
    }
    if let Some(s) = var("WAYPATH_LOG") {
        c.log_filter = s;
    }
    if let Some(s) = var("WAYPATH_STATS_INTERVAL_SECS") {
        c.stats_interval_secs = s.parse().map_err(|_| ConfigError::Env {
            var: "WAYPATH_STATS_INTERVAL_SECS",
            value: s.clone(),
        })?;
    }
    Ok(())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/waypath/config.toml"));
    }
    out.push(PathBuf::from("/etc/waypath/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
