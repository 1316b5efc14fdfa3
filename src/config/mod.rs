/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration loading.

pub mod types;

use crate::core::error::{DnsError, Result};
use std::path::Path;
use types::Config;

/// Read and validate the YAML configuration file.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        DnsError::config(format!("failed to read '{}': {}", path.display(), e))
    })?;

    let config: Config = serde_yml::from_str(&text)
        .map_err(|e| DnsError::config(format!("failed to parse '{}': {}", path.display(), e)))?;

    config
        .validate()
        .map_err(|e| DnsError::config(e.to_string()))?;

    Ok(config)
}
