/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration structure definitions
//!
//! Defines the schema for gatedns configuration files (YAML format).

use serde::Deserialize;
use serde_yml::Value;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Invalid listen address: {0}")]
    InvalidListenAddr(String),

    #[error("Chain step {0} has an empty plugin type")]
    EmptyStepType(usize),

    #[error("Duplicate chain step tag: {0}")]
    DuplicateStepTag(String),

    #[error("TLS requires both 'cert' and 'key'")]
    IncompleteTls,
}

/// Main server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging configuration (level, file output)
    #[serde(default)]
    pub log: LogConfig,

    /// HTTP listener configuration
    pub server: ServerConfig,

    /// External KV store location
    #[serde(default)]
    pub kv: KvConfig,

    /// Data loader tuning
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Plugin chain executed per request, in order
    pub chain: Vec<StepConfig>,
}

impl Config {
    /// Validate configuration
    ///
    /// Checks structural errors (log level, listen address, step tags).
    /// Plugin-specific argument validation is delegated to each plugin
    /// factory when the chain is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log.level.to_lowercase().as_str() {
            "off" | "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ConfigError::InvalidLogLevel(self.log.level.clone())),
        }

        if SocketAddr::from_str(&self.server.listen).is_err() {
            return Err(ConfigError::InvalidListenAddr(self.server.listen.clone()));
        }

        if self.server.cert.is_some() != self.server.key.is_some() {
            return Err(ConfigError::IncompleteTls);
        }

        let mut seen = std::collections::HashSet::new();
        for (idx, step) in self.chain.iter().enumerate() {
            if step.kind.is_empty() {
                return Err(ConfigError::EmptyStepType(idx));
            }
            if let Some(tag) = &step.tag {
                if !seen.insert(tag.clone()) {
                    return Err(ConfigError::DuplicateStepTag(tag.clone()));
                }
            }
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: off, trace, debug, info, warn, error
    #[serde(default = "default_level")]
    pub level: String,

    /// Optional file path for log output (in addition to console)
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: default_level(),
            file: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address in `ip:port` format (e.g., "0.0.0.0:443")
    pub listen: String,

    /// DoH request path. Defaults to "/dns-query".
    #[serde(default = "default_doh_path")]
    pub path: String,

    /// Path to TLS certificate file (PEM format, optional)
    pub cert: Option<String>,

    /// Path to TLS private key file (PEM format, optional)
    pub key: Option<String>,

    /// HTTP header name to extract the real client IP (optional).
    ///
    /// - Common values: "X-Real-IP", "X-Forwarded-For".
    /// - Falls back to the TCP source IP when absent or unparsable.
    pub src_ip_header: Option<String>,
}

fn default_doh_path() -> String {
    "/dns-query".to_string()
}

/// External KV store configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct KvConfig {
    /// Root directory of the directory-backed store. Relative keys like
    /// `domains/ads` resolve beneath it.
    pub root: Option<String>,
}

/// Data loader configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoaderConfig {
    /// List cache TTL in seconds. Defaults to 30 minutes.
    pub ttl: Option<u64>,
}

/// One plugin chain step
#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    /// Plugin kind (e.g., "cache", "forward", "matcher")
    #[serde(rename = "type")]
    pub kind: String,

    /// Step tag; defaults to `plugin_<index>` when omitted. Must be
    /// unique within the chain.
    pub tag: Option<String>,

    /// Plugin-specific arguments (parsed by the plugin factory)
    pub args: Option<Value>,

    /// Run this step only when the tag is already present
    pub if_matched: Option<String>,

    /// Skip this step when the tag is already present
    pub if_not_matched: Option<String>,
}
