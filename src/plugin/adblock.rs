/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `adblock` plugin.
//!
//! Convenience substring blocklist: a query is filtered when any pattern
//! occurs in the domain and no whitelist entry equals the domain or is a
//! parent of it.

use crate::codec::Rcode;
use crate::config::types::StepConfig;
use crate::core::context::QueryContext;
use crate::core::error::Result;
use crate::core::rule_matcher::normalize_domain;
use crate::plugin::{parse_args, BuildEnv, Plugin, PluginFactory};
use ahash::AHashSet;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdblockArgs {
    /// Substrings that mark a domain as blocked.
    #[serde(default)]
    patterns: Vec<String>,
    /// Domains exempt from blocking (the entry itself and subdomains).
    #[serde(default)]
    whitelist: Vec<String>,
    /// Log filtered queries at info level.
    #[serde(default = "default_log")]
    log: bool,
}

fn default_log() -> bool {
    true
}

#[derive(Debug)]
pub struct AdblockPlugin {
    matcher: Option<AhoCorasick>,
    whitelist: AHashSet<String>,
    log: bool,
}

impl AdblockPlugin {
    fn whitelisted(&self, domain: &str) -> bool {
        if self.whitelist.contains(domain) {
            return true;
        }
        // A whitelist entry also exempts its subdomains.
        let mut rest = domain;
        while let Some(dot) = rest.find('.') {
            rest = &rest[dot + 1..];
            if self.whitelist.contains(rest) {
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl Plugin for AdblockPlugin {
    async fn execute(&self, ctx: &mut QueryContext) -> Result<bool> {
        let Some(matcher) = &self.matcher else {
            return Ok(false);
        };

        let domain = ctx.query_domain().to_string();
        if domain.is_empty() || !matcher.is_match(domain.as_str()) {
            return Ok(false);
        }
        if self.whitelisted(&domain) {
            return Ok(false);
        }

        if self.log {
            info!(domain = %domain, "adblock filtered query");
        }
        ctx.set_error(Rcode::NxDomain);
        ctx.resolved = true;
        ctx.add_tag("adblock_filtered");
        Ok(true)
    }
}

#[derive(Debug)]
pub struct AdblockFactory;

impl PluginFactory for AdblockFactory {
    fn create(&self, step: &StepConfig, _build: &BuildEnv<'_>) -> Result<Arc<dyn Plugin>> {
        let args: AdblockArgs = parse_args("adblock", &step.args)?;

        let patterns: Vec<String> = args
            .patterns
            .iter()
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect();

        let matcher = if patterns.is_empty() {
            None
        } else {
            Some(
                AhoCorasickBuilder::new()
                    .build(&patterns)
                    .map_err(|e| crate::core::error::DnsError::plugin(format!(
                        "adblock: failed to build pattern matcher: {}",
                        e
                    )))?,
            )
        };

        let whitelist = args
            .whitelist
            .iter()
            .map(|d| normalize_domain(d).into_owned())
            .filter(|d| !d.is_empty())
            .collect();

        Ok(Arc::new(AdblockPlugin {
            matcher,
            whitelist,
            log: args.log,
        }))
    }
}
