//! Server configuration: TOML file + CLI overrides.

use crate::access::NetworkRange;
use crate::session::TerminalOptions;
use cyberdeck_core::{DeckError, DeckResult};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub access: AccessSection,
    #[serde(default)]
    pub terminal: TerminalSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
    #[serde(default)]
    pub release_on_disconnect: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            session_ttl: default_session_ttl(),
            release_on_disconnect: false,
        }
    }
}

/// `[access]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessSection {
    #[serde(default = "default_allowed_networks")]
    pub allowed_networks: Vec<String>,
    /// Take the client address from `X-Real-IP` (set by a reverse proxy).
    #[serde(default)]
    pub trust_real_ip_header: bool,
}

impl Default for AccessSection {
    fn default() -> Self {
        Self {
            allowed_networks: default_allowed_networks(),
            trust_real_ip_header: false,
        }
    }
}

/// `[terminal]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalSection {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            cols: default_cols(),
            rows: default_rows(),
            poll_interval_ms: default_poll_interval_ms(),
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_session_ttl() -> u64 {
    3600
}
fn default_allowed_networks() -> Vec<String> {
    crate::access::DEFAULT_ALLOWED_NETWORKS
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}
fn default_cols() -> u16 {
    100
}
fn default_rows() -> u16 {
    30
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_read_chunk_size() -> usize {
    1024
}

/// Resolved server configuration (ranges parsed, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub session_ttl: u64,
    pub release_on_disconnect: bool,
    pub allowed_networks: Vec<NetworkRange>,
    pub trust_real_ip_header: bool,
    pub terminal: TerminalOptions,
}

/// Values given on the command line; `None` keeps the file/default value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides<'a> {
    pub port: Option<u16>,
    pub bind: Option<&'a str>,
    pub shell: Option<&'a str>,
    pub session_ttl: Option<u64>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &CliOverrides<'_>) -> DeckResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Parse the TOML text of a config file.
    pub fn parse_file(content: &str) -> DeckResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| DeckError::Config(format!("config parse error: {e}")))
    }

    /// Merge CLI overrides into a parsed file and validate the result.
    pub fn resolve(file: ConfigFile, overrides: &CliOverrides<'_>) -> DeckResult<Self> {
        let bind = overrides.bind.unwrap_or(&file.server.bind);
        let port = overrides.port.unwrap_or(file.server.port);
        let ip: IpAddr = bind
            .parse()
            .map_err(|e| DeckError::Config(format!("invalid bind address {bind:?}: {e}")))?;

        let allowed_networks = file
            .access
            .allowed_networks
            .iter()
            .map(|s| s.parse::<NetworkRange>())
            .collect::<DeckResult<Vec<_>>>()?;

        let session_ttl = overrides.session_ttl.unwrap_or(file.server.session_ttl);
        if session_ttl == 0 {
            return Err(DeckError::Config("session_ttl must be positive".into()));
        }
        if file.terminal.read_chunk_size == 0 {
            return Err(DeckError::Config("read_chunk_size must be positive".into()));
        }

        let shell = overrides
            .shell
            .map(|s| s.to_string())
            .unwrap_or(file.terminal.shell);

        Ok(Self {
            bind_addr: SocketAddr::new(ip, port),
            session_ttl,
            release_on_disconnect: file.server.release_on_disconnect,
            allowed_networks,
            trust_real_ip_header: file.access.trust_real_ip_header,
            terminal: TerminalOptions {
                shell: expand_tilde_str(&shell),
                cols: file.terminal.cols,
                rows: file.terminal.rows,
                poll_interval: Duration::from_millis(file.terminal.poll_interval_ms.max(1)),
                read_chunk_size: file.terminal.read_chunk_size,
            },
        })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_local_network_deployment() {
        let cfg = ServerConfig::resolve(ConfigFile::default(), &CliOverrides::default()).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.session_ttl, 3600);
        assert_eq!(cfg.allowed_networks.len(), 4);
        assert!(!cfg.trust_real_ip_header);
        assert!(!cfg.release_on_disconnect);
        assert_eq!(cfg.terminal.shell, PathBuf::from("/bin/bash"));
        assert_eq!(cfg.terminal.poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.terminal.read_chunk_size, 1024);
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let file = ServerConfig::parse_file(
            r#"
            [server]
            port = 9000
            session_ttl = 60
            release_on_disconnect = true

            [access]
            allowed_networks = ["127.0.0.1"]
            trust_real_ip_header = true

            [terminal]
            shell = "/bin/zsh"
            poll_interval_ms = 50
            "#,
        )
        .unwrap();
        let overrides = CliOverrides {
            port: Some(9100),
            bind: Some("127.0.0.1"),
            shell: Some("/bin/sh"),
            session_ttl: None,
        };
        let cfg = ServerConfig::resolve(file, &overrides).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(cfg.session_ttl, 60);
        assert!(cfg.release_on_disconnect);
        assert!(cfg.trust_real_ip_header);
        assert_eq!(cfg.allowed_networks.len(), 1);
        assert_eq!(cfg.terminal.shell, PathBuf::from("/bin/sh"));
        assert_eq!(cfg.terminal.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn bad_network_range_is_config_error() {
        let file = ServerConfig::parse_file(
            r#"
            [access]
            allowed_networks = ["10.0.0.0/40"]
            "#,
        )
        .unwrap();
        let err = ServerConfig::resolve(file, &CliOverrides::default()).unwrap_err();
        assert!(matches!(err, DeckError::Config(_)), "got {err:?}");
    }

    #[test]
    fn bad_toml_is_config_error() {
        assert!(matches!(
            ServerConfig::parse_file("[server\nport = 1"),
            Err(DeckError::Config(_))
        ));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = ServerConfig::load(
            Some(Path::new("/nonexistent/cyberdeck/config.toml")),
            &CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.bind_addr.port(), 8080);
    }
}
