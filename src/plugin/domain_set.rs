/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `domain_set` plugin.
//!
//! Matcher over KV-loaded domain lists plus inline entries. List entries
//! are exact domains or `*.suffix` wildcards; the outcome contract is the
//! same as `matcher` with `domain_set_*` tags.

use crate::config::types::StepConfig;
use crate::core::context::QueryContext;
use crate::core::error::Result;
use crate::core::rule_matcher::DomainPatternSet;
use crate::loader::DataLoader;
use crate::plugin::matcher::{parse_rcode, MatchAction};
use crate::plugin::{parse_args, BuildEnv, Plugin, PluginFactory};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DomainSetArgs {
    /// KV keys of domain lists (family `domains/`).
    #[serde(default)]
    files: Vec<String>,
    /// Inline list entries.
    #[serde(default)]
    domains: Vec<String>,
    #[serde(default)]
    action: MatchAction,
    rcode: Option<String>,
    #[serde(default)]
    inverse: bool,
}

#[derive(Debug)]
pub struct DomainSetPlugin {
    inline: DomainPatternSet,
    files: Vec<String>,
    loader: Arc<DataLoader>,
    action: MatchAction,
    rcode: crate::codec::Rcode,
    inverse: bool,
}

impl DomainSetPlugin {
    async fn matches(&self, domain: &str) -> bool {
        if self.inline.matches(domain) {
            return true;
        }

        for key in &self.files {
            let list = self.loader.domains(key).await;
            if list.contains(domain) {
                return true;
            }
            // Wildcard entries in loaded lists match parent suffixes.
            let mut rest = domain;
            while let Some(dot) = rest.find('.') {
                rest = &rest[dot + 1..];
                if list.contains(&format!("*.{}", rest)) {
                    return true;
                }
            }
        }
        false
    }
}

#[async_trait]
impl Plugin for DomainSetPlugin {
    async fn execute(&self, ctx: &mut QueryContext) -> Result<bool> {
        let domain = ctx.query_domain().to_string();
        if domain.is_empty() {
            return Ok(false);
        }

        let mut matched = self.matches(&domain).await;
        if self.inverse {
            matched = !matched;
        }
        if !matched {
            return Ok(false);
        }

        match self.action {
            MatchAction::Reject => {
                debug!(domain = %domain, rcode = %self.rcode, "domain_set rejected query");
                ctx.set_error(self.rcode);
                ctx.resolved = true;
                ctx.add_tag("domain_set_rejected");
            }
            MatchAction::Accept => {
                ctx.add_tag("domain_set_accepted");
            }
        }
        Ok(true)
    }
}

#[derive(Debug)]
pub struct DomainSetFactory;

impl PluginFactory for DomainSetFactory {
    fn create(&self, step: &StepConfig, build: &BuildEnv<'_>) -> Result<Arc<dyn Plugin>> {
        let args: DomainSetArgs = parse_args("domain_set", &step.args)?;

        let mut inline = DomainPatternSet::default();
        for domain in &args.domains {
            inline.add_pattern(domain);
        }
        inline.finalize();

        Ok(Arc::new(DomainSetPlugin {
            inline,
            files: args.files,
            loader: build.env.loader.clone(),
            action: args.action,
            rcode: parse_rcode(&args.rcode)?,
            inverse: args.inverse,
        }))
    }
}
