/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `cache` plugin and the response cache backend.
//!
//! The plugin reads through the cache before the forwarders run and, on a
//! miss, installs a write-through observer so the next committed response
//! is stored without any coupling between the cache step and the step
//! that produced the bytes.

use crate::config::types::StepConfig;
use crate::core::app_clock::AppClock;
use crate::core::context::{Metadata, QueryContext, ResponseObserver};
use crate::core::error::Result;
use crate::plugin::{parse_args, BuildEnv, Plugin, PluginFactory};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Deserialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

// Default response TTL (seconds)
const DEFAULT_TTL: u32 = 300;
// Cleanup interval for the in-process backend (seconds)
const DEFAULT_CLEANUP_INTERVAL: u64 = 60;
// Eviction threshold as a fraction of capacity
const EVICTION_THRESHOLD: f32 = 0.9;

/// Backend abstraction over the HTTP response cache collaborator. The
/// only contract is honoring `max_age` on stored entries.
pub trait ResponseCache: Debug + Send + Sync + 'static {
    fn lookup(&self, key: &str) -> Option<Bytes>;
    fn put(&self, key: &str, body: Bytes, max_age: u32);
}

#[derive(Debug, Clone)]
struct CachedResponse {
    body: Bytes,
    expire_time: u64,
    last_access_time: u64,
}

/// In-process `ResponseCache` over a concurrent map with lazy expiry and
/// a background sweeper.
#[derive(Debug)]
pub struct MemoryResponseCache {
    entries: Arc<DashMap<String, CachedResponse>>,
    capacity: usize,
}

impl MemoryResponseCache {
    pub fn new(capacity: usize) -> Self {
        MemoryResponseCache {
            entries: Arc::new(DashMap::with_capacity(capacity)),
            capacity,
        }
    }

    /// Spawn the periodic cleanup task: drops expired entries and evicts
    /// the least recently accessed ones past the capacity threshold.
    pub fn start_sweeper(&self) {
        let entries = self.entries.clone();
        let capacity = self.capacity;

        tokio::spawn(async move {
            let interval = Duration::from_secs(DEFAULT_CLEANUP_INTERVAL);
            loop {
                sleep(interval).await;

                let now = AppClock::run_millis();
                let expired: Vec<String> = entries
                    .iter()
                    .filter(|item| item.value().expire_time <= now)
                    .map(|item| item.key().clone())
                    .collect();
                for key in &expired {
                    entries.remove(key);
                }
                if !expired.is_empty() {
                    debug!("cleaned {} expired response cache entries", expired.len());
                }

                let current = entries.len();
                let threshold = (capacity as f32 * EVICTION_THRESHOLD) as usize;
                if current > threshold {
                    let mut by_access: Vec<(String, u64)> = entries
                        .iter()
                        .map(|item| (item.key().clone(), item.value().last_access_time))
                        .collect();
                    by_access.sort_by_key(|(_, last)| *last);

                    let evict_count = current - (threshold - threshold / 10);
                    let mut evicted = 0;
                    for (key, _) in by_access.into_iter().take(evict_count) {
                        if entries.remove(&key).is_some() {
                            evicted += 1;
                        }
                    }
                    if evicted > 0 {
                        warn!(
                            "response cache eviction: removed {} items, size {} -> {}",
                            evicted,
                            current,
                            entries.len()
                        );
                    }
                }
            }
        });
    }
}

impl ResponseCache for MemoryResponseCache {
    fn lookup(&self, key: &str) -> Option<Bytes> {
        let now = AppClock::run_millis();

        if let Some(mut item) = self.entries.get_mut(key) {
            if now < item.expire_time {
                item.last_access_time = now;
                return Some(item.body.clone());
            }
        }
        // Expired entries are removed outside the read guard.
        self.entries
            .remove_if(key, |_, value| value.expire_time <= now);
        None
    }

    fn put(&self, key: &str, body: Bytes, max_age: u32) {
        let now = AppClock::run_millis();
        self.entries.insert(
            key.to_string(),
            CachedResponse {
                body,
                expire_time: now + max_age as u64 * 1000,
                last_access_time: now,
            },
        );
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheArgs {
    /// Stored-response TTL in seconds.
    #[serde(default = "default_ttl")]
    ttl: u32,
}

fn default_ttl() -> u32 {
    DEFAULT_TTL
}

#[derive(Debug)]
struct CachePlugin {
    backend: Arc<dyn ResponseCache>,
    ttl: u32,
}

/// Write-through observer installed on a cache miss.
struct WriteThrough {
    backend: Arc<dyn ResponseCache>,
    key: String,
    ttl: u32,
}

impl ResponseObserver for WriteThrough {
    fn on_response(&self, _metadata: &Metadata, response: &Bytes) {
        self.backend.put(&self.key, response.clone(), self.ttl);
        debug!(key = %self.key, ttl = self.ttl, "response cached");
    }
}

#[async_trait]
impl Plugin for CachePlugin {
    async fn execute(&self, ctx: &mut QueryContext) -> Result<bool> {
        if ctx.has_tag("bypass_cache") {
            ctx.add_tag("cache_bypassed");
            return Ok(false);
        }

        let key = format!("dns-{}-{}", ctx.query_domain(), ctx.query_type());

        if let Some(body) = self.backend.lookup(&key) {
            debug!(key = %key, "cache hit");
            ctx.add_tag("cache_hit");
            ctx.set_response(body);
            return Ok(true);
        }

        debug!(key = %key, "cache miss");
        ctx.metadata.cache_key = Some(key.clone());
        ctx.metadata.cache_ttl = Some(self.ttl);
        ctx.add_tag("cache_miss");
        ctx.add_response_observer(Arc::new(WriteThrough {
            backend: self.backend.clone(),
            key,
            ttl: self.ttl,
        }));
        Ok(false)
    }
}

#[derive(Debug)]
pub struct CacheFactory;

impl PluginFactory for CacheFactory {
    fn create(&self, step: &StepConfig, build: &BuildEnv<'_>) -> Result<Arc<dyn Plugin>> {
        let args: CacheArgs = parse_args("cache", &step.args)?;

        Ok(Arc::new(CachePlugin {
            backend: build.env.response_cache.clone(),
            ttl: args.ttl,
        }))
    }
}
