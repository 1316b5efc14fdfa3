/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `ip_matcher` plugin.
//!
//! Runs after a response is committed: extracts the A/AAAA addresses from
//! the answer section and matches them against literal IPs and KV-loaded
//! IP lists. Outcome contract mirrors `matcher`.

use crate::codec::{answer_spans, rr_type, Rcode};
use crate::config::types::StepConfig;
use crate::core::context::QueryContext;
use crate::core::error::{DnsError, Result};
use crate::core::rule_matcher::IpRuleSet;
use crate::loader::DataLoader;
use crate::plugin::matcher::{parse_rcode, MatchAction};
use crate::plugin::{parse_args, BuildEnv, Plugin, PluginFactory};
use async_trait::async_trait;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct IpMatcherArgs {
    /// KV keys of IP lists (family `ips/`).
    #[serde(default)]
    files: Vec<String>,
    /// Literal IPs / CIDRs / ranges.
    #[serde(default)]
    ips: Vec<String>,
    #[serde(default)]
    action: MatchAction,
    #[serde(default)]
    inverse: bool,
    rcode: Option<String>,
}

#[derive(Debug)]
pub struct IpMatcherPlugin {
    literals: IpRuleSet,
    files: Vec<String>,
    loader: Arc<DataLoader>,
    action: MatchAction,
    inverse: bool,
    rcode: Rcode,
}

/// Pull every A/AAAA address out of a response's answer section.
fn response_addrs(bytes: &[u8]) -> Vec<IpAddr> {
    let Ok(spans) = answer_spans(bytes) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for span in spans {
        match (span.rtype, span.rdata_len) {
            (rr_type::A, 4) => {
                let d = &bytes[span.rdata_offset..span.rdata_offset + 4];
                out.push(IpAddr::V4(Ipv4Addr::new(d[0], d[1], d[2], d[3])));
            }
            (rr_type::AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[span.rdata_offset..span.rdata_offset + 16]);
                out.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {}
        }
    }
    out
}

impl IpMatcherPlugin {
    async fn any_addr_matches(&self, addrs: &[IpAddr]) -> bool {
        for addr in addrs {
            if self.literals.contains(*addr) {
                return true;
            }
        }

        for key in &self.files {
            let rules = self.loader.ips(key).await;
            for addr in addrs {
                if rules.contains(*addr) {
                    return true;
                }
            }
        }
        false
    }
}

#[async_trait]
impl Plugin for IpMatcherPlugin {
    async fn execute(&self, ctx: &mut QueryContext) -> Result<bool> {
        let Some(response) = ctx.response.as_ref() else {
            return Ok(false);
        };

        let addrs = response_addrs(response);
        let mut matched = !addrs.is_empty() && self.any_addr_matches(&addrs).await;
        if self.inverse {
            matched = !matched;
        }
        if !matched {
            return Ok(false);
        }

        match self.action {
            MatchAction::Reject => {
                debug!(domain = %ctx.query_domain(), rcode = %self.rcode, "ip_matcher rejected response");
                ctx.set_error(self.rcode);
                ctx.resolved = true;
                ctx.add_tag("ip_matcher_rejected");
            }
            MatchAction::Accept => {
                ctx.add_tag("ip_matcher_accepted");
            }
        }
        Ok(true)
    }
}

#[derive(Debug)]
pub struct IpMatcherFactory;

impl PluginFactory for IpMatcherFactory {
    fn create(&self, step: &StepConfig, build: &BuildEnv<'_>) -> Result<Arc<dyn Plugin>> {
        let args: IpMatcherArgs = parse_args("ip_matcher", &step.args)?;

        let mut literals = IpRuleSet::default();
        for raw in &args.ips {
            literals
                .add_rule(raw)
                .map_err(|e| DnsError::plugin(format!("ip_matcher rule '{}': {}", raw, e)))?;
        }

        Ok(Arc::new(IpMatcherPlugin {
            literals,
            files: args.files,
            loader: build.env.loader.clone(),
            action: args.action,
            inverse: args.inverse,
            rcode: parse_rcode(&args.rcode)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{build_host_response, build_query, rr_type};
    use crate::plugin::chain::tests_support::{env_with_kv, StaticKv};
    use ahash::AHashMap;
    use bytes::Bytes;

    fn ctx_with_answer(ip: &str) -> QueryContext {
        let qtype = if ip.contains(':') {
            rr_type::AAAA
        } else {
            rr_type::A
        };
        let query = build_query("example.com", qtype);
        let response = build_host_response(&query, &[ip.parse().unwrap()], 60).unwrap();
        let mut ctx = QueryContext::from_wire(Bytes::from(query.raw.clone()), None).unwrap();
        ctx.set_response(Bytes::from(response));
        ctx
    }

    fn plugin(literals: &[&str], action: MatchAction, inverse: bool) -> IpMatcherPlugin {
        let mut rules = IpRuleSet::default();
        for raw in literals {
            rules.add_rule(raw).unwrap();
        }
        let env = env_with_kv(StaticKv::default());
        IpMatcherPlugin {
            literals: rules,
            files: Vec::new(),
            loader: env.loader.clone(),
            action,
            inverse,
            rcode: Rcode::NxDomain,
        }
    }

    #[tokio::test]
    async fn literal_cidr_match_rejects() {
        let p = plugin(&["192.0.2.0/24"], MatchAction::Reject, false);
        let mut ctx = ctx_with_answer("192.0.2.77");

        assert!(p.execute(&mut ctx).await.unwrap());
        assert!(ctx.resolved);
        assert!(ctx.has_tag("ip_matcher_rejected"));
        assert_eq!(ctx.error, Some(Rcode::NxDomain));
    }

    #[tokio::test]
    async fn non_matching_address_is_ignored() {
        let p = plugin(&["192.0.2.0/24"], MatchAction::Reject, false);
        let mut ctx = ctx_with_answer("198.51.100.1");
        assert!(!p.execute(&mut ctx).await.unwrap());
        assert!(!ctx.resolved);
    }

    #[tokio::test]
    async fn requires_a_response() {
        let p = plugin(&["192.0.2.0/24"], MatchAction::Reject, false);
        let query = build_query("example.com", rr_type::A);
        let mut ctx = QueryContext::from_wire(Bytes::from(query.raw), None).unwrap();
        assert!(!p.execute(&mut ctx).await.unwrap());
    }

    #[tokio::test]
    async fn inverse_accepts_unlisted_addresses() {
        let p = plugin(&["192.0.2.0/24"], MatchAction::Accept, true);
        let mut ctx = ctx_with_answer("198.51.100.1");
        assert!(p.execute(&mut ctx).await.unwrap());
        assert!(ctx.has_tag("ip_matcher_accepted"));
    }

    #[tokio::test]
    async fn ipv6_answers_match_v6_rules() {
        let p = plugin(&["2001:db8::/32"], MatchAction::Accept, false);
        let mut ctx = ctx_with_answer("2001:db8::5");
        assert!(p.execute(&mut ctx).await.unwrap());
    }

    #[tokio::test]
    async fn kv_ip_list_is_consulted() {
        let mut entries = AHashMap::new();
        entries.insert("ips/cdn".to_string(), "203.0.113.0/24\n".to_string());
        let env = env_with_kv(StaticKv { entries });

        let p = IpMatcherPlugin {
            literals: IpRuleSet::default(),
            files: vec!["ips/cdn".to_string()],
            loader: env.loader.clone(),
            action: MatchAction::Accept,
            inverse: false,
            rcode: Rcode::NxDomain,
        };

        let mut ctx = ctx_with_answer("203.0.113.9");
        assert!(p.execute(&mut ctx).await.unwrap());
        assert!(ctx.has_tag("ip_matcher_accepted"));
    }
}
