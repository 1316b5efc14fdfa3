/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Chain builder and executor.
//!
//! Steps run strictly in configuration order. A failing handler is
//! recorded and never blocks later steps; `ctx.resolved` is the only
//! short-circuit.

use crate::config::types::StepConfig;
use crate::core::context::{PluginError, QueryContext};
use crate::core::error::Result;
use crate::plugin::{BuildEnv, Plugin, PluginEnv, PluginRegistry};
use ahash::AHashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// One executable step: a handler plus its tag and gate predicates.
#[derive(Debug)]
pub struct ChainStep {
    pub tag: String,
    pub if_matched: Option<String>,
    pub if_not_matched: Option<String>,
    plugin: Arc<dyn Plugin>,
}

/// An ordered, conditional plugin chain.
#[derive(Debug)]
pub struct Chain {
    steps: Vec<ChainStep>,
}

impl Chain {
    /// Build a chain from step configs. Steps with an unregistered kind
    /// are skipped with a warning; invalid arguments are fatal.
    pub fn build(
        registry: &PluginRegistry,
        env: &PluginEnv,
        configs: &[StepConfig],
    ) -> Result<Chain> {
        let mut steps = Vec::with_capacity(configs.len());
        let mut built: AHashMap<String, Arc<dyn Plugin>> = AHashMap::new();

        for (idx, config) in configs.iter().enumerate() {
            let Some(factory) = registry.get(&config.kind) else {
                warn!(kind = %config.kind, index = idx, "unknown plugin kind, skipping step");
                continue;
            };

            let tag = config
                .tag
                .clone()
                .unwrap_or_else(|| format!("plugin_{}", idx));

            let plugin = factory.create(
                config,
                &BuildEnv {
                    env,
                    built: &built,
                },
            )?;

            debug!(kind = %config.kind, tag = %tag, "chain step built");
            built.insert(tag.clone(), plugin.clone());
            steps.push(ChainStep {
                tag,
                if_matched: config.if_matched.clone(),
                if_not_matched: config.if_not_matched.clone(),
                plugin,
            });
        }

        Ok(Chain { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the chain over a context.
    pub async fn execute(&self, ctx: &mut QueryContext) {
        for step in &self.steps {
            if let Some(required) = &step.if_matched {
                if !ctx.has_tag(required) {
                    debug!(step = %step.tag, gate = %required, "skipping step, tag not present");
                    continue;
                }
            }
            if let Some(excluded) = &step.if_not_matched {
                if ctx.has_tag(excluded) {
                    debug!(step = %step.tag, gate = %excluded, "skipping step, tag present");
                    continue;
                }
            }

            let start = Instant::now();
            let outcome = step.plugin.execute(ctx).await;
            ctx.metadata.timings.insert(step.tag.clone(), start.elapsed());

            match outcome {
                Ok(true) => ctx.add_tag(&step.tag),
                Ok(false) => {}
                Err(e) => {
                    warn!(step = %step.tag, error = %e, "plugin failed, continuing chain");
                    ctx.metadata.errors.push(PluginError {
                        plugin: step.tag.clone(),
                        message: e.to_string(),
                    });
                }
            }

            if ctx.resolved {
                debug!(step = %step.tag, "chain resolved");
                break;
            }
        }
    }
}

#[cfg(test)]
pub mod tests_support {
    use super::*;
    use crate::loader::{DataLoader, KvStore};
    use crate::plugin::cache::MemoryResponseCache;
    use async_trait::async_trait;

    /// KV backend with a fixed in-memory table.
    #[derive(Debug, Default)]
    pub struct StaticKv {
        pub entries: AHashMap<String, String>,
    }

    #[async_trait]
    impl KvStore for StaticKv {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.entries.get(key).cloned())
        }
    }

    /// A `PluginEnv` over in-memory collaborators.
    pub fn test_env() -> PluginEnv {
        env_with_kv(StaticKv::default())
    }

    pub fn env_with_kv(kv: StaticKv) -> PluginEnv {
        PluginEnv {
            loader: Arc::new(DataLoader::new(Arc::new(kv), None)),
            response_cache: Arc::new(MemoryResponseCache::new(1024)),
            http_client: reqwest::Client::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::test_env;
    use super::*;
    use crate::codec::{self, rr_type};
    use crate::core::error::DnsError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> QueryContext {
        let query = codec::build_query("example.com", rr_type::A);
        QueryContext::from_wire(Bytes::from(query.raw), None).unwrap()
    }

    /// Scripted handler: records its execution order, optionally fails,
    /// resolves, or returns a tag.
    #[derive(Debug)]
    struct Scripted {
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        name: &'static str,
        ret: bool,
        fail: bool,
        resolve: bool,
    }

    #[async_trait]
    impl Plugin for Scripted {
        async fn execute(&self, ctx: &mut QueryContext) -> Result<bool> {
            self.order.lock().unwrap().push(self.name);
            if self.fail {
                return Err(DnsError::plugin("scripted failure"));
            }
            if self.resolve {
                ctx.set_response(Bytes::from_static(b"\x00"));
            }
            Ok(self.ret)
        }
    }

    struct ScriptedFactory {
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        calls: AtomicUsize,
        script: Vec<(&'static str, bool, bool, bool)>,
    }

    impl crate::plugin::PluginFactory for ScriptedFactory {
        fn create(&self, _step: &StepConfig, _build: &BuildEnv<'_>) -> Result<Arc<dyn Plugin>> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            let (name, ret, fail, resolve) = self.script[idx];
            Ok(Arc::new(Scripted {
                order: self.order.clone(),
                name,
                ret,
                fail,
                resolve,
            }))
        }
    }

    fn step(kind: &str, tag: Option<&str>) -> StepConfig {
        StepConfig {
            kind: kind.to_string(),
            tag: tag.map(|t| t.to_string()),
            args: None,
            if_matched: None,
            if_not_matched: None,
        }
    }

    fn scripted_registry(
        order: &Arc<std::sync::Mutex<Vec<&'static str>>>,
        script: Vec<(&'static str, bool, bool, bool)>,
    ) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry.register(
            "scripted",
            Box::new(ScriptedFactory {
                order: order.clone(),
                calls: AtomicUsize::new(0),
                script,
            }),
        );
        registry
    }

    #[tokio::test]
    async fn steps_execute_in_order_with_one_timing_each() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let registry = scripted_registry(
            &order,
            vec![
                ("s1", false, false, false),
                ("s2", false, false, false),
                ("s3", false, false, false),
            ],
        );
        let env = test_env();
        let chain = Chain::build(
            &registry,
            &env,
            &[
                step("scripted", Some("s1")),
                step("scripted", Some("s2")),
                step("scripted", Some("s3")),
            ],
        )
        .unwrap();

        let mut ctx = ctx();
        chain.execute(&mut ctx).await;

        assert_eq!(*order.lock().unwrap(), ["s1", "s2", "s3"]);
        for tag in ["s1", "s2", "s3"] {
            assert!(ctx.metadata.timings.contains_key(tag), "missing timing {}", tag);
        }
        assert_eq!(ctx.metadata.timings.len(), 3);
    }

    #[tokio::test]
    async fn conditional_gates_respect_earlier_tags_only() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let registry = scripted_registry(
            &order,
            vec![
                ("tagger", true, false, false),
                ("wants_tag", false, false, false),
                ("avoids_tag", false, false, false),
            ],
        );
        let env = test_env();

        let mut wants = step("scripted", Some("wants_tag"));
        wants.if_matched = Some("tagger".into());
        let mut avoids = step("scripted", Some("avoids_tag"));
        avoids.if_not_matched = Some("tagger".into());

        let chain = Chain::build(
            &registry,
            &env,
            &[step("scripted", Some("tagger")), wants, avoids],
        )
        .unwrap();

        let mut ctx = ctx();
        chain.execute(&mut ctx).await;

        assert_eq!(*order.lock().unwrap(), ["tagger", "wants_tag"]);
        assert!(ctx.has_tag("tagger"));
        assert!(!ctx.metadata.timings.contains_key("avoids_tag"));
    }

    #[tokio::test]
    async fn resolved_short_circuits_later_steps() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let registry = scripted_registry(
            &order,
            vec![("resolver", true, false, true), ("after", false, false, false)],
        );
        let env = test_env();
        let chain = Chain::build(
            &registry,
            &env,
            &[step("scripted", Some("resolver")), step("scripted", Some("after"))],
        )
        .unwrap();

        let mut ctx = ctx();
        chain.execute(&mut ctx).await;

        assert_eq!(*order.lock().unwrap(), ["resolver"]);
        assert!(ctx.resolved);
        assert!(ctx.has_tag("resolver"));
    }

    #[tokio::test]
    async fn failing_step_is_recorded_and_isolated() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let registry = scripted_registry(
            &order,
            vec![
                ("ok", false, false, false),
                ("boom", false, true, false),
                ("recorder", false, false, false),
            ],
        );
        let env = test_env();
        let chain = Chain::build(
            &registry,
            &env,
            &[
                step("scripted", Some("ok")),
                step("scripted", Some("boom")),
                step("scripted", Some("recorder")),
            ],
        )
        .unwrap();

        let mut ctx = ctx();
        chain.execute(&mut ctx).await;

        assert_eq!(*order.lock().unwrap(), ["ok", "boom", "recorder"]);
        assert!(ctx.metadata.timings.contains_key("ok"));
        assert!(ctx.metadata.timings.contains_key("recorder"));
        assert_eq!(ctx.metadata.errors.len(), 1);
        assert_eq!(ctx.metadata.errors[0].plugin, "boom");
        // The failing step returned an error, so its tag is absent.
        assert!(!ctx.has_tag("boom"));
    }

    #[tokio::test]
    async fn unknown_kind_is_skipped_with_default_tags() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let registry = scripted_registry(&order, vec![("only", true, false, false)]);
        let env = test_env();
        let chain = Chain::build(
            &registry,
            &env,
            &[step("does_not_exist", None), step("scripted", None)],
        )
        .unwrap();

        assert_eq!(chain.len(), 1);

        let mut ctx = ctx();
        chain.execute(&mut ctx).await;
        // Default tag keeps the original index.
        assert!(ctx.has_tag("plugin_1"));
    }
}
