/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `response_modifier` plugin.
//!
//! Terminal `accept`/`reject` actions, plus wire-level rewrites of an
//! already-committed response: TTL clamping/fixing and A/AAAA address
//! replacement. Rewrites operate on a cloned buffer.

use crate::codec::{self, Rcode};
use crate::config::types::StepConfig;
use crate::core::context::QueryContext;
use crate::core::error::{DnsError, Result};
use crate::core::rule_matcher::DomainPatternSet;
use crate::plugin::matcher::parse_rcode;
use crate::plugin::{parse_args, BuildEnv, Plugin, PluginFactory};
use async_trait::async_trait;
use bytes::Bytes;
use rand::prelude::IndexedRandom;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ModifierAction {
    Accept,
    Reject,
    /// Rewrite mode (TTL / IP); also the default when `action` is absent.
    Modify,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResponseModifierArgs {
    action: Option<ModifierAction>,
    rcode: Option<String>,
    /// Replacement address; family decides which records it applies to.
    ip: Option<String>,
    /// Replacement addresses; one per family is picked at random.
    #[serde(default)]
    ips: Vec<String>,
    min_ttl: Option<u32>,
    max_ttl: Option<u32>,
    ttl: Option<u32>,
    /// Apply the modifier only to queries matching these rules.
    #[serde(default)]
    domains: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct TtlPolicy {
    fix: Option<u32>,
    min: Option<u32>,
    max: Option<u32>,
}

impl TtlPolicy {
    fn is_noop(&self) -> bool {
        self.fix.is_none() && self.min.is_none() && self.max.is_none()
    }

    fn apply(&self, ttl: u32) -> u32 {
        if let Some(fix) = self.fix {
            return fix;
        }

        let mut out = ttl;
        if let Some(min) = self.min {
            out = out.max(min);
        }
        if let Some(max) = self.max {
            out = out.min(max);
        }
        out
    }
}

#[derive(Debug)]
pub struct ResponseModifierPlugin {
    action: ModifierAction,
    rcode: Rcode,
    replacement_v4: Vec<Ipv4Addr>,
    replacement_v6: Vec<Ipv6Addr>,
    ttl: TtlPolicy,
    domains: DomainPatternSet,
}

#[async_trait]
impl Plugin for ResponseModifierPlugin {
    async fn execute(&self, ctx: &mut QueryContext) -> Result<bool> {
        match self.action {
            ModifierAction::Reject => {
                debug!(rcode = %self.rcode, "response_modifier rejected query");
                ctx.set_error(self.rcode);
                ctx.resolved = true;
                ctx.add_tag("response_rejected");
                return Ok(true);
            }
            ModifierAction::Accept => {
                ctx.resolved = true;
                ctx.add_tag("response_accepted");
                return Ok(true);
            }
            ModifierAction::Modify => {}
        }

        if !self.domains.is_empty() && !self.domains.matches(ctx.query_domain()) {
            return Ok(false);
        }

        let Some(response) = ctx.response.clone() else {
            return Ok(false);
        };

        let mut bytes: Vec<u8> = response.to_vec();
        let mut ttl_modified = false;
        let mut ip_replaced = false;

        if !self.ttl.is_noop() {
            let (rewritten, changed) = codec::rewrite_answer_ttls(&bytes, |ttl| self.ttl.apply(ttl))
                .map_err(|e| DnsError::protocol(e.to_string()))?;
            bytes = rewritten;
            ttl_modified = changed;
        }

        if !self.replacement_v4.is_empty() || !self.replacement_v6.is_empty() {
            let mut rng = rand::rng();
            let v4 = self.replacement_v4.choose(&mut rng).copied();
            let v6 = self.replacement_v6.choose(&mut rng).copied();
            let (rewritten, changed) = codec::rewrite_answer_addrs(&bytes, v4, v6)
                .map_err(|e| DnsError::protocol(e.to_string()))?;
            bytes = rewritten;
            ip_replaced = changed;
        }

        if !ttl_modified && !ip_replaced {
            return Ok(false);
        }

        if ttl_modified {
            ctx.add_tag("ttl_modified");
        }
        if ip_replaced {
            ctx.add_tag("ip_replaced");
        }
        debug!(ttl_modified, ip_replaced, "response rewritten");
        // Replace in place without re-resolving: the response was already
        // committed by an earlier step.
        ctx.response = Some(Bytes::from(bytes));
        Ok(true)
    }
}

#[derive(Debug)]
pub struct ResponseModifierFactory;

impl PluginFactory for ResponseModifierFactory {
    fn create(&self, step: &StepConfig, _build: &BuildEnv<'_>) -> Result<Arc<dyn Plugin>> {
        let args: ResponseModifierArgs = parse_args("response_modifier", &step.args)?;

        let mut replacement_v4 = Vec::new();
        let mut replacement_v6 = Vec::new();
        let mut push_ip = |raw: &str| -> Result<()> {
            match raw.parse::<IpAddr>() {
                Ok(IpAddr::V4(v4)) => replacement_v4.push(v4),
                Ok(IpAddr::V6(v6)) => replacement_v6.push(v6),
                Err(e) => {
                    return Err(DnsError::plugin(format!(
                        "response_modifier: invalid ip '{}': {}",
                        raw, e
                    )))
                }
            }
            Ok(())
        };
        if let Some(ip) = &args.ip {
            push_ip(ip)?;
        }
        for ip in &args.ips {
            push_ip(ip)?;
        }

        let mut domains = DomainPatternSet::default();
        for domain in &args.domains {
            domains.add_pattern(domain);
        }
        domains.finalize();

        Ok(Arc::new(ResponseModifierPlugin {
            action: args.action.unwrap_or(ModifierAction::Modify),
            rcode: parse_rcode(&args.rcode)?,
            replacement_v4,
            replacement_v6,
            ttl: TtlPolicy {
                fix: args.ttl,
                min: args.min_ttl,
                max: args.max_ttl,
            },
            domains,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{build_host_response, build_query, parse_response, rr_type};

    fn ctx_with_response(name: &str, ip: &str, ttl: u32) -> QueryContext {
        let query = build_query(name, rr_type::A);
        let response =
            build_host_response(&query, &[ip.parse().unwrap()], ttl).unwrap();
        let mut ctx = QueryContext::from_wire(Bytes::from(query.raw.clone()), None).unwrap();
        ctx.set_response(Bytes::from(response));
        ctx
    }

    fn modify_plugin() -> ResponseModifierPlugin {
        ResponseModifierPlugin {
            action: ModifierAction::Modify,
            rcode: Rcode::NxDomain,
            replacement_v4: Vec::new(),
            replacement_v6: Vec::new(),
            ttl: TtlPolicy {
                fix: None,
                min: None,
                max: None,
            },
            domains: DomainPatternSet::default(),
        }
    }

    #[tokio::test]
    async fn reject_action_is_terminal() {
        let mut p = modify_plugin();
        p.action = ModifierAction::Reject;
        p.rcode = Rcode::Refused;

        let query = build_query("example.com", rr_type::A);
        let mut ctx = QueryContext::from_wire(Bytes::from(query.raw), None).unwrap();

        assert!(p.execute(&mut ctx).await.unwrap());
        assert!(ctx.resolved);
        assert_eq!(ctx.error, Some(Rcode::Refused));
        assert!(ctx.has_tag("response_rejected"));
    }

    #[tokio::test]
    async fn accept_action_resolves_without_error() {
        let mut p = modify_plugin();
        p.action = ModifierAction::Accept;

        let query = build_query("example.com", rr_type::A);
        let mut ctx = QueryContext::from_wire(Bytes::from(query.raw), None).unwrap();

        assert!(p.execute(&mut ctx).await.unwrap());
        assert!(ctx.resolved);
        assert!(ctx.error.is_none());
        assert!(ctx.has_tag("response_accepted"));
    }

    #[tokio::test]
    async fn ttl_clamp_rewrites_answers() {
        let mut p = modify_plugin();
        p.ttl = TtlPolicy {
            fix: None,
            min: Some(120),
            max: Some(600),
        };

        let mut ctx = ctx_with_response("example.com", "192.0.2.1", 30);
        assert!(p.execute(&mut ctx).await.unwrap());
        assert!(ctx.has_tag("ttl_modified"));

        let response = parse_response(ctx.response.as_ref().unwrap()).unwrap();
        assert_eq!(response.answers[0].ttl, 120);
    }

    #[tokio::test]
    async fn fixed_ttl_overrides_clamp() {
        let mut p = modify_plugin();
        p.ttl = TtlPolicy {
            fix: Some(42),
            min: Some(120),
            max: Some(600),
        };

        let mut ctx = ctx_with_response("example.com", "192.0.2.1", 300);
        assert!(p.execute(&mut ctx).await.unwrap());
        let response = parse_response(ctx.response.as_ref().unwrap()).unwrap();
        assert_eq!(response.answers[0].ttl, 42);
    }

    #[tokio::test]
    async fn ip_replacement_rewrites_a_records() {
        let mut p = modify_plugin();
        p.replacement_v4 = vec!["127.0.0.1".parse().unwrap()];

        let mut ctx = ctx_with_response("example.com", "192.0.2.1", 300);
        assert!(p.execute(&mut ctx).await.unwrap());
        assert!(ctx.has_tag("ip_replaced"));

        let response = parse_response(ctx.response.as_ref().unwrap()).unwrap();
        assert_eq!(response.answers[0].data, "127.0.0.1");
    }

    #[tokio::test]
    async fn requires_response_in_modify_mode() {
        let mut p = modify_plugin();
        p.ttl = TtlPolicy {
            fix: Some(60),
            min: None,
            max: None,
        };

        let query = build_query("example.com", rr_type::A);
        let mut ctx = QueryContext::from_wire(Bytes::from(query.raw), None).unwrap();
        assert!(!p.execute(&mut ctx).await.unwrap());
    }

    #[tokio::test]
    async fn domain_filter_skips_non_matching_queries() {
        let mut p = modify_plugin();
        p.ttl = TtlPolicy {
            fix: Some(60),
            min: None,
            max: None,
        };
        let mut domains = DomainPatternSet::default();
        domains.add_pattern("other.example");
        domains.finalize();
        p.domains = domains;

        let mut ctx = ctx_with_response("example.com", "192.0.2.1", 300);
        assert!(!p.execute(&mut ctx).await.unwrap());
        let response = parse_response(ctx.response.as_ref().unwrap()).unwrap();
        assert_eq!(response.answers[0].ttl, 300);
    }

    #[tokio::test]
    async fn noop_modify_returns_false() {
        let p = modify_plugin();
        let mut ctx = ctx_with_response("example.com", "192.0.2.1", 300);
        assert!(!p.execute(&mut ctx).await.unwrap());
        assert!(!ctx.has_tag("ttl_modified"));
    }
}
