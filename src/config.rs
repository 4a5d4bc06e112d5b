//! Configuration loading and persistence.
//!
//! Handles reading the funnel configuration file (JSON). The file is
//! optional; every field has a default. Recognized keys control which
//! microservices a peer may start here and how listeners treat
//! non-loopback bind addresses.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Per-listener-family policy.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ListenerConfig {
    /// When false, a listener bound to any non-loopback interface is
    /// demoted to loopback.
    #[serde(default)]
    pub gateway_ports: bool,
}

/// Toggle for the file-copy service family (ids 7–9).
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct FileCopyConfig {
    /// Whether the file-copy services may be started by the peer.
    #[serde(default)]
    pub enable: bool,
}

/// Process/shell service (id 10) spawn parameters.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ShellConfig {
    /// Whether the shell service may be started by the peer.
    #[serde(default)]
    pub enable: bool,
    /// Binary to spawn for each shell session.
    #[serde(default = "ShellConfig::default_path")]
    pub path: String,
    /// Arguments passed to the binary.
    #[serde(default)]
    pub args: Vec<String>,
}

impl ShellConfig {
    fn default_path() -> String {
        if cfg!(windows) {
            "cmd.exe".to_owned()
        } else {
            "/bin/sh".to_owned()
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            enable: false,
            path: Self::default_path(),
            args: Vec::new(),
        }
    }
}

/// Which microservices this peer offers and how.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ServicesConfig {
    /// Stream listener (id 4) policy.
    #[serde(default)]
    pub stream_listener: ListenerConfig,
    /// Datagram listener (id 6) policy.
    #[serde(default)]
    pub datagram_listener: ListenerConfig,
    /// File-copy services (ids 7–9).
    #[serde(default)]
    pub file_copy: FileCopyConfig,
    /// Shell service (id 10).
    #[serde(default)]
    pub shell: ShellConfig,
}

/// Configuration for the funnel client and server.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
    /// Microservice policy.
    #[serde(default)]
    pub services: ServicesConfig,
    /// Server only: reject direct connections, relaying is the only
    /// allowed use.
    #[serde(default)]
    pub relay_only: bool,
}

impl Config {
    /// Load from an explicit path, or return defaults when `path` is
    /// `None` and no file exists at the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Platform config file location (`<config dir>/funnel/config.json`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("funnel")
            .join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_optional_services() {
        let config = Config::default();
        assert!(!config.services.file_copy.enable);
        assert!(!config.services.shell.enable);
        assert!(!config.services.stream_listener.gateway_ports);
        assert!(!config.relay_only);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "services": {
                    "stream_listener": { "gateway_ports": true },
                    "shell": { "enable": true, "path": "/bin/bash" }
                }
            }"#,
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert!(config.services.stream_listener.gateway_ports);
        assert!(!config.services.datagram_listener.gateway_ports);
        assert!(config.services.shell.enable);
        assert_eq!(config.services.shell.path, "/bin/bash");
        assert!(config.services.shell.args.is_empty());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/funnel.json"))).is_err());
    }
}
