/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `forward` plugin.
//!
//! Forwards the query to an upstream DoH resolver via HTTP POST
//! (`application/dns-message`). Failures are recorded on the context and
//! never set an error code; later chain steps or the boundary decide how
//! the request ends.

use crate::codec;
use crate::config::types::StepConfig;
use crate::core::context::QueryContext;
use crate::core::error::Result;
use crate::plugin::{parse_args, BuildEnv, Plugin, PluginFactory};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CONTENT_TYPE_DNS: &str = "application/dns-message";
const DEFAULT_UPSTREAM: &str = "https://doh.pub/dns-query";
const DEFAULT_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ForwardArgs {
    /// Upstream resolver URL. A bare hostname is rewritten to
    /// `https://<host>/dns-query`.
    #[serde(default = "default_upstream")]
    upstream: String,

    /// Per-call deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,

    /// Extra request headers.
    #[serde(default)]
    headers: HashMap<String, String>,

    /// Splice an EDNS client-subnet option before forwarding. Accepted
    /// and logged; the option is not spliced yet.
    #[serde(default)]
    edns_client_subnet: bool,
}

fn default_upstream() -> String {
    DEFAULT_UPSTREAM.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Normalize an upstream address into a full DoH URL.
fn normalize_upstream(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with("https://") || raw.starts_with("http://") {
        raw.to_string()
    } else {
        format!("https://{}/dns-query", raw.trim_end_matches('/'))
    }
}

#[derive(Debug)]
pub struct ForwardPlugin {
    upstream: String,
    timeout: Duration,
    headers: HashMap<String, String>,
    edns_client_subnet: bool,
    client: reqwest::Client,
}

impl ForwardPlugin {
    /// The query bytes to send: the redirect plugin's target question if
    /// one is pending (on a synthesized buffer), otherwise the original
    /// message untouched.
    fn outgoing_message(&self, ctx: &QueryContext) -> Option<Bytes> {
        let original = ctx.dns_message()?;

        if let Some(redirect) = &ctx.metadata.redirect {
            if let Some(question) = ctx.query().and_then(|q| q.question()) {
                let query = ctx.query()?;
                debug!(
                    original = %redirect.original,
                    target = %redirect.target,
                    "forwarding redirected question"
                );
                return Some(Bytes::from(codec::build_query_raw(
                    query.id,
                    query.flags,
                    &redirect.target,
                    question.qtype,
                    question.qclass,
                )));
            }
        }

        Some(original.clone())
    }
}

#[async_trait]
impl Plugin for ForwardPlugin {
    async fn execute(&self, ctx: &mut QueryContext) -> Result<bool> {
        let Some(body) = self.outgoing_message(ctx) else {
            ctx.metadata.upstream_error = Some("no query message to forward".to_string());
            return Ok(false);
        };

        if self.edns_client_subnet {
            if let Some(client) = ctx.metadata.client_addr {
                // ECS splicing is a stub; never mutates the query buffer.
                debug!(client = %client.ip(), "edns_client_subnet requested, not spliced");
            }
        }

        let mut request = self
            .client
            .post(&self.upstream)
            .timeout(self.timeout)
            .header("Content-Type", CONTENT_TYPE_DNS)
            .header("Accept", CONTENT_TYPE_DNS);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = match request.body(body).send().await {
            Ok(response) => response,
            Err(e) => {
                let reason = if e.is_timeout() {
                    "timeout".to_string()
                } else {
                    e.to_string()
                };
                warn!(upstream = %self.upstream, error = %reason, "upstream request failed");
                ctx.metadata.upstream_error = Some(reason);
                return Ok(false);
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(upstream = %self.upstream, status = %status, "upstream returned non-2xx");
            ctx.metadata.upstream_error = Some(format!("upstream status {}", status.as_u16()));
            return Ok(false);
        }

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(upstream = %self.upstream, error = %e, "failed to read upstream body");
                ctx.metadata.upstream_error = Some(e.to_string());
                return Ok(false);
            }
        };

        debug!(upstream = %self.upstream, bytes = bytes.len(), "upstream answered");
        ctx.metadata.upstream = Some(self.upstream.clone());
        ctx.set_response(bytes);
        Ok(true)
    }
}

#[derive(Debug)]
pub struct ForwardFactory;

impl PluginFactory for ForwardFactory {
    fn create(&self, step: &StepConfig, build: &BuildEnv<'_>) -> Result<Arc<dyn Plugin>> {
        let args: ForwardArgs = parse_args("forward", &step.args)?;

        Ok(Arc::new(ForwardPlugin {
            upstream: normalize_upstream(&args.upstream),
            timeout: Duration::from_millis(args.timeout_ms),
            headers: args.headers,
            edns_client_subnet: args.edns_client_subnet,
            client: build.env.http_client.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::rr_type;
    use crate::core::context::Redirect;

    #[test]
    fn upstream_normalization() {
        assert_eq!(
            normalize_upstream("doh.pub"),
            "https://doh.pub/dns-query"
        );
        assert_eq!(
            normalize_upstream("https://dns.example/custom"),
            "https://dns.example/custom"
        );
        assert_eq!(
            normalize_upstream("dns.example/"),
            "https://dns.example/dns-query"
        );
    }

    #[test]
    fn outgoing_message_respects_redirect_without_mutation() {
        let query = codec::build_query("www.blocked.example", rr_type::A);
        let original = Bytes::from(query.raw.clone());
        let mut ctx = QueryContext::from_wire(original.clone(), None).unwrap();
        ctx.metadata.redirect = Some(Redirect {
            original: "www.blocked.example".to_string(),
            target: "www.mirror.example".to_string(),
        });

        let plugin = ForwardPlugin {
            upstream: DEFAULT_UPSTREAM.to_string(),
            timeout: Duration::from_millis(100),
            headers: HashMap::new(),
            edns_client_subnet: false,
            client: reqwest::Client::new(),
        };

        let outgoing = plugin.outgoing_message(&ctx).unwrap();
        let parsed = codec::parse_query(&outgoing).unwrap();
        assert_eq!(parsed.question().unwrap().name, "www.mirror.example");
        assert_eq!(parsed.id, query.id);
        // The context's original message is untouched.
        assert_eq!(ctx.dns_message().unwrap(), &original);
    }

    #[test]
    fn outgoing_message_defaults_to_original_bytes() {
        let query = codec::build_query("plain.example", rr_type::A);
        let original = Bytes::from(query.raw);
        let ctx = QueryContext::from_wire(original.clone(), None).unwrap();

        let plugin = ForwardPlugin {
            upstream: DEFAULT_UPSTREAM.to_string(),
            timeout: Duration::from_millis(100),
            headers: HashMap::new(),
            edns_client_subnet: false,
            client: reqwest::Client::new(),
        };

        assert_eq!(plugin.outgoing_message(&ctx).unwrap(), original);
    }

    #[tokio::test]
    async fn unreachable_upstream_records_error_and_returns_false() {
        let query = codec::build_query("example.com", rr_type::A);
        let mut ctx = QueryContext::from_wire(Bytes::from(query.raw), None).unwrap();

        let plugin = ForwardPlugin {
            // TEST-NET-1 address: nothing listens there.
            upstream: "http://192.0.2.1:1/dns-query".to_string(),
            timeout: Duration::from_millis(200),
            headers: HashMap::new(),
            edns_client_subnet: false,
            client: reqwest::Client::new(),
        };

        assert!(!plugin.execute(&mut ctx).await.unwrap());
        assert!(ctx.metadata.upstream_error.is_some());
        assert!(ctx.error.is_none());
        assert!(!ctx.resolved);
    }
}
