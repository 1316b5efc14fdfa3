/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `load_balancer` plugin.
//!
//! Dispatches to upstream executors referenced by chain tag. Strategies:
//! `random` picks one, `parallel` races independent context clones and
//! keeps the first success, `fallback` walks the list sequentially.
//! Referenced steps must be declared earlier in the chain (and are
//! normally gated off with `if_matched` on a tag nothing produces).

use crate::config::types::StepConfig;
use crate::core::context::QueryContext;
use crate::core::error::{DnsError, Result};
use crate::plugin::{parse_args, BuildEnv, Plugin, PluginFactory};
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

const DEFAULT_PARALLEL_TIMEOUT_MS: u64 = 2000;
const DEFAULT_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Strategy {
    Random,
    Parallel,
    Fallback,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoadBalancerArgs {
    /// Chain tags of the upstream executors.
    upstreams: Vec<String>,
    strategy: Strategy,
    /// Per-clone deadline for the `parallel` strategy.
    #[serde(default = "default_parallel_timeout_ms")]
    parallel_timeout_ms: u64,
    /// Per-upstream deadline for the `fallback` strategy.
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

fn default_parallel_timeout_ms() -> u64 {
    DEFAULT_PARALLEL_TIMEOUT_MS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

#[derive(Debug)]
struct UpstreamRef {
    tag: String,
    plugin: Arc<dyn Plugin>,
}

#[derive(Debug)]
pub struct LoadBalancerPlugin {
    upstreams: Vec<UpstreamRef>,
    strategy: Strategy,
    parallel_timeout: Duration,
    fallback_timeout: Duration,
}

impl LoadBalancerPlugin {
    /// Copy a winning sub-context's outcome back into the original.
    /// Committing through `set_response` fires the parent's observers
    /// (cache write-through) exactly once.
    fn adopt(ctx: &mut QueryContext, sub: QueryContext, tag: &str) {
        if let Some(response) = sub.response {
            ctx.metadata.upstream = sub.metadata.upstream;
            ctx.set_response(response);
            debug!(upstream = %tag, "load_balancer adopted response");
        }
    }

    async fn run_random(&self, ctx: &mut QueryContext) -> Result<bool> {
        let pick = rand::rng().random_range(0..self.upstreams.len());
        let upstream = &self.upstreams[pick];
        debug!(upstream = %upstream.tag, "load_balancer random pick");
        upstream.plugin.execute(ctx).await
    }

    async fn run_parallel(&self, ctx: &mut QueryContext) -> Result<bool> {
        let mut join_set: JoinSet<(String, Result<bool>, QueryContext)> = JoinSet::new();
        let deadline = self.parallel_timeout;

        for upstream in &self.upstreams {
            let plugin = upstream.plugin.clone();
            let tag = upstream.tag.clone();
            let mut sub = ctx.clone_for_subquery();
            join_set.spawn(async move {
                let outcome = match timeout(deadline, plugin.execute(&mut sub)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(DnsError::upstream("timeout")),
                };
                (tag, outcome, sub)
            });
        }

        let mut last_err: Option<String> = None;
        while let Some(joined) = join_set.join_next().await {
            let (tag, outcome, sub) = match joined {
                Ok(result) => result,
                Err(e) => {
                    last_err = Some(format!("join error: {}", e));
                    continue;
                }
            };

            match outcome {
                Ok(true) if sub.resolved => {
                    // First success wins; cancel still-pending siblings.
                    join_set.abort_all();
                    Self::adopt(ctx, sub, &tag);
                    return Ok(true);
                }
                Ok(_) => {
                    if let Some(e) = sub.metadata.upstream_error {
                        last_err = Some(format!("{}: {}", tag, e));
                    }
                }
                Err(e) => {
                    warn!(upstream = %tag, error = %e, "parallel upstream failed");
                    last_err = Some(format!("{}: {}", tag, e));
                }
            }
        }

        if let Some(reason) = last_err {
            ctx.metadata.upstream_error = Some(reason);
        }
        Ok(false)
    }

    async fn run_fallback(&self, ctx: &mut QueryContext) -> Result<bool> {
        for upstream in &self.upstreams {
            let mut sub = ctx.clone_for_subquery();
            match timeout(self.fallback_timeout, upstream.plugin.execute(&mut sub)).await {
                Ok(Ok(true)) if sub.resolved => {
                    Self::adopt(ctx, sub, &upstream.tag);
                    return Ok(true);
                }
                Ok(Ok(_)) => {
                    debug!(upstream = %upstream.tag, "fallback upstream produced no response");
                }
                Ok(Err(e)) => {
                    warn!(upstream = %upstream.tag, error = %e, "fallback upstream failed");
                }
                Err(_) => {
                    warn!(upstream = %upstream.tag, "fallback upstream timed out");
                    ctx.metadata.upstream_error = Some("timeout".to_string());
                }
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl Plugin for LoadBalancerPlugin {
    async fn execute(&self, ctx: &mut QueryContext) -> Result<bool> {
        match self.strategy {
            Strategy::Random => self.run_random(ctx).await,
            Strategy::Parallel => self.run_parallel(ctx).await,
            Strategy::Fallback => self.run_fallback(ctx).await,
        }
    }
}

#[derive(Debug)]
pub struct LoadBalancerFactory;

impl PluginFactory for LoadBalancerFactory {
    fn create(&self, step: &StepConfig, build: &BuildEnv<'_>) -> Result<Arc<dyn Plugin>> {
        let args: LoadBalancerArgs = parse_args("load_balancer", &step.args)?;
        if args.upstreams.is_empty() {
            return Err(DnsError::plugin("load_balancer requires at least one upstream"));
        }

        let mut upstreams = Vec::with_capacity(args.upstreams.len());
        for tag in &args.upstreams {
            let plugin = build.built.get(tag).ok_or_else(|| {
                DnsError::plugin(format!(
                    "load_balancer upstream '{}' not found; it must be declared earlier in the chain",
                    tag
                ))
            })?;
            upstreams.push(UpstreamRef {
                tag: tag.clone(),
                plugin: plugin.clone(),
            });
        }

        Ok(Arc::new(LoadBalancerPlugin {
            upstreams,
            strategy: args.strategy,
            parallel_timeout: Duration::from_millis(args.parallel_timeout_ms),
            fallback_timeout: Duration::from_millis(args.timeout_ms),
        }))
    }
}
