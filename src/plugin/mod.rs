/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Plugin framework.
//!
//! Every plugin kind is registered through a factory that parses the
//! kind-specific argument schema at build time and returns a ready
//! handler. Handlers are stateless with respect to requests: all
//! per-request state lives in the `QueryContext`.

pub mod adblock;
pub mod cache;
pub mod chain;
pub mod domain_set;
pub mod forward;
pub mod hosts;
pub mod ip_matcher;
pub mod load_balancer;
pub mod matcher;
pub mod redirect;
pub mod response_modifier;

use crate::config::types::StepConfig;
use crate::core::context::QueryContext;
use crate::core::error::Result;
use crate::loader::DataLoader;
use crate::plugin::cache::ResponseCache;
use ahash::AHashMap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// A chain step handler.
///
/// `execute` returns `true` iff the step's configured tag should be added
/// to the context. Returning `true` never stops the chain; setting
/// `ctx.resolved` is the sole short-circuit signal.
#[async_trait]
pub trait Plugin: Debug + Send + Sync + 'static {
    async fn execute(&self, ctx: &mut QueryContext) -> Result<bool>;
}

/// Shared resources handed to plugin factories and handlers.
#[derive(Debug, Clone)]
pub struct PluginEnv {
    pub loader: Arc<DataLoader>,
    pub response_cache: Arc<dyn ResponseCache>,
    pub http_client: reqwest::Client,
}

/// Build-time view: shared resources plus the chain steps built so far,
/// by tag. The load balancer resolves its upstream executors here.
pub struct BuildEnv<'a> {
    pub env: &'a PluginEnv,
    pub built: &'a AHashMap<String, Arc<dyn Plugin>>,
}

/// Constructs plugin instances for one kind.
pub trait PluginFactory: Send + Sync + 'static {
    /// Parse the step's argument schema and build the handler. Unknown
    /// argument keys are rejected by the per-kind schema.
    fn create(&self, step: &StepConfig, build: &BuildEnv<'_>) -> Result<Arc<dyn Plugin>>;
}

/// Kind-name to factory table. Populated once at startup; read-only
/// afterwards.
pub struct PluginRegistry {
    factories: HashMap<String, Box<dyn PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry {
            factories: HashMap::new(),
        }
    }

    /// All built-in plugin kinds.
    pub fn builtin() -> Self {
        let mut registry = PluginRegistry::new();
        registry.register("cache", Box::new(cache::CacheFactory));
        registry.register("forward", Box::new(forward::ForwardFactory));
        registry.register("hosts", Box::new(hosts::HostsFactory));
        registry.register("matcher", Box::new(matcher::MatcherFactory));
        registry.register("domain_set", Box::new(domain_set::DomainSetFactory));
        registry.register("redirect", Box::new(redirect::RedirectFactory));
        registry.register(
            "response_modifier",
            Box::new(response_modifier::ResponseModifierFactory),
        );
        registry.register("ip_matcher", Box::new(ip_matcher::IpMatcherFactory));
        registry.register("load_balancer", Box::new(load_balancer::LoadBalancerFactory));
        registry.register("adblock", Box::new(adblock::AdblockFactory));
        registry
    }

    /// Register a factory under a kind name. Last registration wins.
    pub fn register(&mut self, kind: &str, factory: Box<dyn PluginFactory>) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn get(&self, kind: &str) -> Option<&dyn PluginFactory> {
        self.factories.get(kind).map(|f| f.as_ref())
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(|k| k.as_str()).collect()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Parse a step's `args` into a kind-specific schema; missing args
/// deserialize from an empty mapping so defaults apply.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(
    kind: &str,
    args: &Option<serde_yml::Value>,
) -> Result<T> {
    let value = args
        .clone()
        .unwrap_or(serde_yml::Value::Mapping(Default::default()));
    serde_yml::from_value(value).map_err(|e| {
        crate::core::error::DnsError::plugin(format!("failed to parse {} args: {}", kind, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_covers_all_kinds() {
        let registry = PluginRegistry::builtin();
        for kind in [
            "cache",
            "forward",
            "hosts",
            "matcher",
            "domain_set",
            "redirect",
            "response_modifier",
            "ip_matcher",
            "load_balancer",
            "adblock",
        ] {
            assert!(registry.get(kind).is_some(), "missing kind {}", kind);
        }
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn register_last_wins() {
        struct A;
        struct B;
        impl PluginFactory for A {
            fn create(&self, _: &StepConfig, _: &BuildEnv<'_>) -> Result<Arc<dyn Plugin>> {
                Err("a".into())
            }
        }
        impl PluginFactory for B {
            fn create(&self, _: &StepConfig, _: &BuildEnv<'_>) -> Result<Arc<dyn Plugin>> {
                Err("b".into())
            }
        }

        let mut registry = PluginRegistry::new();
        registry.register("x", Box::new(A));
        registry.register("x", Box::new(B));

        let env = crate::plugin::chain::tests_support::test_env();
        let built = AHashMap::new();
        let step = StepConfig {
            kind: "x".into(),
            tag: None,
            args: None,
            if_matched: None,
            if_not_matched: None,
        };
        let err = registry
            .get("x")
            .unwrap()
            .create(&step, &BuildEnv {
                env: &env,
                built: &built,
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "b");
    }
}
