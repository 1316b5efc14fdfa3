/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `redirect` plugin.
//!
//! Records a pending question rewrite on the context; the forwarder
//! consults it when building the upstream request. The original query
//! buffer is never touched.

use crate::config::types::StepConfig;
use crate::core::context::{QueryContext, Redirect};
use crate::core::error::{DnsError, Result};
use crate::core::rule_matcher::normalize_domain;
use crate::plugin::matcher::TypeSpec;
use crate::plugin::{parse_args, BuildEnv, Plugin, PluginFactory};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RedirectRuleArgs {
    from: String,
    to: String,
    /// Restrict the rule to one query type.
    #[serde(rename = "type")]
    qtype: Option<TypeSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RedirectArgs {
    rules: Vec<RedirectRuleArgs>,
    /// The rewritten question keeps the original query type. Accepted for
    /// configuration compatibility; this is the only implemented mode.
    #[serde(default = "default_true")]
    preserve_type: bool,
    /// Rewrite `sub.FROM` to `sub.TO`, carrying the prefix over.
    #[serde(default = "default_true")]
    include_subdomains: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug)]
struct RedirectRule {
    from: String,
    to: String,
    qtype: Option<u16>,
}

#[derive(Debug)]
pub struct RedirectPlugin {
    rules: Vec<RedirectRule>,
    include_subdomains: bool,
}

impl RedirectPlugin {
    /// First matching rule wins.
    fn target_for(&self, domain: &str, qtype: u16) -> Option<String> {
        for rule in &self.rules {
            if let Some(required) = rule.qtype {
                if required != qtype {
                    continue;
                }
            }

            if domain == rule.from {
                return Some(rule.to.clone());
            }

            if self.include_subdomains {
                if let Some(prefix) = domain.strip_suffix(&rule.from) {
                    if let Some(prefix) = prefix.strip_suffix('.') {
                        return Some(format!("{}.{}", prefix, rule.to));
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl Plugin for RedirectPlugin {
    async fn execute(&self, ctx: &mut QueryContext) -> Result<bool> {
        let domain = ctx.query_domain().to_string();
        if domain.is_empty() {
            return Ok(false);
        }

        let Some(target) = self.target_for(&domain, ctx.query_type()) else {
            return Ok(false);
        };

        debug!(original = %domain, target = %target, "redirect recorded");
        ctx.metadata.redirect = Some(Redirect {
            original: domain,
            target,
        });
        ctx.add_tag("redirected");
        Ok(true)
    }
}

#[derive(Debug)]
pub struct RedirectFactory;

impl PluginFactory for RedirectFactory {
    fn create(&self, step: &StepConfig, _build: &BuildEnv<'_>) -> Result<Arc<dyn Plugin>> {
        let args: RedirectArgs = parse_args("redirect", &step.args)?;

        let mut rules = Vec::with_capacity(args.rules.len());
        for (idx, rule) in args.rules.iter().enumerate() {
            let from = normalize_domain(&rule.from);
            let to = normalize_domain(&rule.to);
            if from.is_empty() || to.is_empty() {
                return Err(DnsError::plugin(format!(
                    "redirect rule #{} has an empty domain",
                    idx
                )));
            }
            rules.push(RedirectRule {
                from: from.into_owned(),
                to: to.into_owned(),
                qtype: rule.qtype.as_ref().map(TypeSpec::to_u16),
            });
        }

        // preserve_type has a single implemented mode; the field exists so
        // configs carrying it round-trip.
        let _ = args.preserve_type;

        Ok(Arc::new(RedirectPlugin {
            rules,
            include_subdomains: args.include_subdomains,
        }))
    }
}
