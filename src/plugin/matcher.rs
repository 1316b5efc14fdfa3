/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `matcher` plugin.
//!
//! Matches the question against domain rules and either tags the request
//! (`accept`) or answers it with an error code (`reject`). Pattern shapes:
//! bare domain (exact), `*.suffix`, `~substring`, `regexp:expr`.

use crate::codec::{rr_type_from_name, Rcode};
use crate::config::types::StepConfig;
use crate::core::context::QueryContext;
use crate::core::error::{DnsError, Result};
use crate::core::rule_matcher::DomainPatternSet;
use crate::plugin::{parse_args, BuildEnv, Plugin, PluginFactory};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum MatchAction {
    Accept,
    Reject,
}

impl Default for MatchAction {
    fn default() -> Self {
        MatchAction::Accept
    }
}

/// RR type given as a name ("A", "AAAA") or a number.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum TypeSpec {
    Number(u16),
    Name(String),
}

impl TypeSpec {
    pub(crate) fn to_u16(&self) -> u16 {
        match self {
            TypeSpec::Number(n) => *n,
            TypeSpec::Name(name) => rr_type_from_name(name),
        }
    }
}

/// Parse the `rcode` argument (name or number), defaulting to NXDOMAIN.
pub(crate) fn parse_rcode(raw: &Option<String>) -> Result<Rcode> {
    match raw {
        None => Ok(Rcode::NxDomain),
        Some(raw) => Rcode::parse(raw)
            .ok_or_else(|| DnsError::plugin(format!("invalid rcode '{}'", raw))),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MatcherArgs {
    /// Single exact-or-wildcard domain rule.
    domain: Option<String>,
    /// Additional domain rules.
    #[serde(default)]
    domains: Vec<String>,
    /// Pattern rules (exact, `*.suffix`, `~substring`, `regexp:`).
    #[serde(default)]
    patterns: Vec<String>,
    /// Restrict to one query type.
    #[serde(rename = "type")]
    qtype: Option<TypeSpec>,
    /// Restrict to several query types.
    #[serde(default)]
    types: Vec<TypeSpec>,
    #[serde(default)]
    action: MatchAction,
    /// Error code for `reject`; name or number.
    rcode: Option<String>,
    /// Flip the match decision after all patterns are evaluated.
    #[serde(default)]
    inverse: bool,
}

#[derive(Debug)]
pub struct MatcherPlugin {
    rules: DomainPatternSet,
    qtypes: Vec<u16>,
    action: MatchAction,
    rcode: Rcode,
    inverse: bool,
}

#[async_trait]
impl Plugin for MatcherPlugin {
    async fn execute(&self, ctx: &mut QueryContext) -> Result<bool> {
        // Type filter excludes differing types unconditionally; inverse
        // does not apply to it.
        if !self.qtypes.is_empty() && !self.qtypes.contains(&ctx.query_type()) {
            return Ok(false);
        }

        if self.rules.is_empty() {
            return Ok(false);
        }

        let mut matched = self.rules.matches(ctx.query_domain());
        if self.inverse {
            matched = !matched;
        }
        if !matched {
            return Ok(false);
        }

        match self.action {
            MatchAction::Reject => {
                debug!(domain = %ctx.query_domain(), rcode = %self.rcode, "matcher rejected query");
                ctx.set_error(self.rcode);
                ctx.resolved = true;
                ctx.add_tag("matcher_rejected");
            }
            MatchAction::Accept => {
                ctx.add_tag("matcher_accepted");
            }
        }
        Ok(true)
    }
}

#[derive(Debug)]
pub struct MatcherFactory;

impl PluginFactory for MatcherFactory {
    fn create(&self, step: &StepConfig, _build: &BuildEnv<'_>) -> Result<Arc<dyn Plugin>> {
        let args: MatcherArgs = parse_args("matcher", &step.args)?;

        let mut rules = DomainPatternSet::default();
        if let Some(domain) = &args.domain {
            rules.add_pattern(domain);
        }
        for domain in &args.domains {
            rules.add_pattern(domain);
        }
        for pattern in &args.patterns {
            rules.add_pattern(pattern);
        }
        rules.finalize();

        let mut qtypes: Vec<u16> = args.types.iter().map(TypeSpec::to_u16).collect();
        if let Some(qtype) = &args.qtype {
            qtypes.push(qtype.to_u16());
        }

        Ok(Arc::new(MatcherPlugin {
            rules,
            qtypes,
            action: args.action,
            rcode: parse_rcode(&args.rcode)?,
            inverse: args.inverse,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, rr_type};
    use bytes::Bytes;

    fn ctx(name: &str, qtype: u16) -> QueryContext {
        let query = codec::build_query(name, qtype);
        QueryContext::from_wire(Bytes::from(query.raw), None).unwrap()
    }

    fn plugin(patterns: &[&str], action: MatchAction, inverse: bool) -> MatcherPlugin {
        let mut rules = DomainPatternSet::default();
        for p in patterns {
            rules.add_pattern(p);
        }
        rules.finalize();
        MatcherPlugin {
            rules,
            qtypes: Vec::new(),
            action,
            rcode: Rcode::NxDomain,
            inverse,
        }
    }

    #[tokio::test]
    async fn exact_domain_matches_itself_only() {
        let m = plugin(&["example.com"], MatchAction::Accept, false);

        let mut hit = ctx("example.com", rr_type::A);
        assert!(m.execute(&mut hit).await.unwrap());
        assert!(hit.has_tag("matcher_accepted"));

        let mut miss = ctx("sub.example.com", rr_type::A);
        assert!(!m.execute(&mut miss).await.unwrap());
    }

    #[tokio::test]
    async fn wildcard_matches_subdomains_not_root() {
        let m = plugin(&["*.example.com"], MatchAction::Accept, false);

        let mut sub = ctx("sub.example.com", rr_type::A);
        assert!(m.execute(&mut sub).await.unwrap());
        let mut deep = ctx("a.b.example.com", rr_type::A);
        assert!(m.execute(&mut deep).await.unwrap());
        let mut root = ctx("example.com", rr_type::A);
        assert!(!m.execute(&mut root).await.unwrap());
    }

    #[tokio::test]
    async fn reject_sets_rcode_and_resolves() {
        let m = plugin(&["ads.example.com"], MatchAction::Reject, false);

        let mut ctx = ctx("ads.example.com", rr_type::A);
        assert!(m.execute(&mut ctx).await.unwrap());
        assert!(ctx.resolved);
        assert_eq!(ctx.error, Some(Rcode::NxDomain));
        assert!(ctx.has_tag("matcher_rejected"));
    }

    #[tokio::test]
    async fn inverse_flips_after_evaluation() {
        let m = plugin(&["example.com"], MatchAction::Accept, true);

        let mut miss = ctx("example.com", rr_type::A);
        assert!(!m.execute(&mut miss).await.unwrap());

        let mut hit = ctx("other.example", rr_type::A);
        assert!(m.execute(&mut hit).await.unwrap());
    }

    #[tokio::test]
    async fn type_filter_is_unconditional() {
        let mut m = plugin(&["example.com"], MatchAction::Accept, false);
        m.qtypes = vec![rr_type::AAAA];

        let mut wrong_type = ctx("example.com", rr_type::A);
        assert!(!m.execute(&mut wrong_type).await.unwrap());

        // Even with inverse set, a differing type never matches.
        m.inverse = true;
        let mut still_wrong = ctx("other.example", rr_type::A);
        assert!(!m.execute(&mut still_wrong).await.unwrap());
    }

    #[tokio::test]
    async fn empty_pattern_set_never_matches() {
        let m = plugin(&[], MatchAction::Reject, false);
        let mut plain = ctx("example.com", rr_type::A);
        assert!(!m.execute(&mut plain).await.unwrap());

        // Inverse on an empty set still returns false.
        let m = plugin(&[], MatchAction::Reject, true);
        let mut inverted = ctx("example.com", rr_type::A);
        assert!(!m.execute(&mut inverted).await.unwrap());
    }

    #[test]
    fn factory_rejects_unknown_keys() {
        let args: serde_yml::Value =
            serde_yml::from_str("domain: example.com\nbogus_key: 1\n").unwrap();
        let step = StepConfig {
            kind: "matcher".into(),
            tag: None,
            args: Some(args),
            if_matched: None,
            if_not_matched: None,
        };
        let env = crate::plugin::chain::tests_support::test_env();
        let built = ahash::AHashMap::new();
        assert!(MatcherFactory
            .create(&step, &BuildEnv {
                env: &env,
                built: &built
            })
            .is_err());
    }
}
