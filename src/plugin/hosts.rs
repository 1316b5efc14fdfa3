/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `hosts` plugin.
//!
//! Answers A/AAAA queries from a static hostname table: inline entries
//! plus optional KV-backed hosts files. IPs are filtered to the requested
//! address family; a mapped name with no IP in that family is NODATA
//! unless `pass_through` lets the chain continue.

use crate::codec::{self, rr_type, Rcode};
use crate::config::types::StepConfig;
use crate::core::context::QueryContext;
use crate::core::error::{DnsError, Result};
use crate::core::rule_matcher::normalize_domain;
use crate::loader::DataLoader;
use crate::plugin::{parse_args, BuildEnv, Plugin, PluginFactory};
use ahash::AHashMap;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_TTL: u32 = 300;

/// One inline mapping: a single IP or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum HostEntry {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostsArgs {
    /// domain -> ip or [ip, ...]
    #[serde(default)]
    hosts: AHashMap<String, HostEntry>,

    /// KV keys of hosts files (family `hosts/`).
    #[serde(default)]
    files: Vec<String>,

    /// Answer TTL in seconds.
    #[serde(default = "default_ttl")]
    ttl: u32,

    /// On a mapped name with no family-matched IP: continue the chain
    /// instead of answering NODATA.
    #[serde(default = "default_pass_through")]
    pass_through: bool,
}

fn default_ttl() -> u32 {
    DEFAULT_TTL
}

fn default_pass_through() -> bool {
    true
}

#[derive(Debug)]
pub struct HostsPlugin {
    table: AHashMap<String, Vec<IpAddr>>,
    files: Vec<String>,
    loader: Arc<DataLoader>,
    ttl: u32,
    pass_through: bool,
}

impl HostsPlugin {
    /// All IPs mapped to `domain`, inline table first, then KV files.
    async fn lookup(&self, domain: &str) -> Vec<IpAddr> {
        let mut out = self.table.get(domain).cloned().unwrap_or_default();

        for key in &self.files {
            let table = self.loader.hosts(key).await;
            if let Some(ip_text) = table.get(domain) {
                match ip_text.parse::<IpAddr>() {
                    Ok(ip) => {
                        if !out.contains(&ip) {
                            out.push(ip);
                        }
                    }
                    Err(e) => warn!(key, domain, error = %e, "invalid IP in hosts file"),
                }
            }
        }

        out
    }
}

#[async_trait]
impl Plugin for HostsPlugin {
    async fn execute(&self, ctx: &mut QueryContext) -> Result<bool> {
        let qtype = ctx.query_type();
        if qtype != rr_type::A && qtype != rr_type::AAAA {
            return Ok(false);
        }

        let domain = ctx.query_domain().to_string();
        if domain.is_empty() {
            return Ok(false);
        }

        let mapped = self.lookup(&domain).await;
        if mapped.is_empty() {
            return Ok(false);
        }

        // Filter to the requested address family.
        let want_v6 = qtype == rr_type::AAAA;
        let ips: Vec<IpAddr> = mapped
            .into_iter()
            .filter(|ip| ip.is_ipv6() == want_v6)
            .collect();

        if ips.is_empty() {
            if self.pass_through {
                return Ok(false);
            }
            // NODATA: name exists, no records of this type.
            ctx.set_error(Rcode::NoError);
            ctx.resolved = true;
            return Ok(true);
        }

        let response = match ctx.query() {
            Some(query) => codec::build_host_response(query, &ips, self.ttl),
            None => return Ok(false),
        };
        let Some(response) = response else {
            return Err(DnsError::plugin("hosts: query has no question"));
        };

        debug!(domain = %domain, answers = ips.len(), "answered from hosts table");
        ctx.add_tag("hosts_resolved");
        ctx.set_response(Bytes::from(response));
        Ok(true)
    }
}

#[derive(Debug)]
pub struct HostsFactory;

impl PluginFactory for HostsFactory {
    fn create(&self, step: &StepConfig, build: &BuildEnv<'_>) -> Result<Arc<dyn Plugin>> {
        let args: HostsArgs = parse_args("hosts", &step.args)?;

        let mut table: AHashMap<String, Vec<IpAddr>> = AHashMap::new();
        for (domain, entry) in &args.hosts {
            let normalized = normalize_domain(domain);
            if normalized.is_empty() {
                continue;
            }
            let raw_ips: Vec<&String> = match entry {
                HostEntry::One(ip) => vec![ip],
                HostEntry::Many(ips) => ips.iter().collect(),
            };

            let mut ips = Vec::with_capacity(raw_ips.len());
            for raw in raw_ips {
                let ip = raw.parse::<IpAddr>().map_err(|e| {
                    DnsError::plugin(format!("hosts entry '{}': invalid IP '{}': {}", domain, raw, e))
                })?;
                ips.push(ip);
            }
            table.insert(normalized.into_owned(), ips);
        }

        Ok(Arc::new(HostsPlugin {
            table,
            files: args.files,
            loader: build.env.loader.clone(),
            ttl: args.ttl,
            pass_through: args.pass_through,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_response;
    use crate::loader::KvStore;

    fn plugin_with(
        entries: &[(&str, &[&str])],
        pass_through: bool,
    ) -> HostsPlugin {
        #[derive(Debug)]
        struct EmptyKv;
        #[async_trait]
        impl KvStore for EmptyKv {
            async fn get(&self, _key: &str) -> Result<Option<String>> {
                Ok(None)
            }
        }

        let mut table = AHashMap::new();
        for (domain, ips) in entries {
            table.insert(
                domain.to_string(),
                ips.iter().map(|ip| ip.parse().unwrap()).collect(),
            );
        }

        HostsPlugin {
            table,
            files: Vec::new(),
            loader: Arc::new(DataLoader::new(Arc::new(EmptyKv), None)),
            ttl: 300,
            pass_through,
        }
    }

    fn ctx(name: &str, qtype: u16) -> QueryContext {
        let query = codec::build_query(name, qtype);
        QueryContext::from_wire(Bytes::from(query.raw), None).unwrap()
    }

    #[tokio::test]
    async fn a_query_yields_only_ipv4() {
        let hosts = plugin_with(&[("example.com", &["192.0.2.1", "2001:db8::1"])], true);
        let mut ctx = ctx("example.com", rr_type::A);

        assert!(hosts.execute(&mut ctx).await.unwrap());
        assert!(ctx.has_tag("hosts_resolved"));
        assert!(ctx.resolved);

        let response = parse_response(ctx.response.as_ref().unwrap()).unwrap();
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.answers[0].data, "192.0.2.1");
        assert_eq!(response.answers[0].rtype, rr_type::A);
    }

    #[tokio::test]
    async fn aaaa_query_yields_only_ipv6() {
        let hosts = plugin_with(&[("example.com", &["192.0.2.1", "2001:db8::1"])], true);
        let mut ctx = ctx("example.com", rr_type::AAAA);

        assert!(hosts.execute(&mut ctx).await.unwrap());
        let response = parse_response(ctx.response.as_ref().unwrap()).unwrap();
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.answers[0].data, "2001:db8::1");
    }

    #[tokio::test]
    async fn non_address_query_is_ignored() {
        let hosts = plugin_with(&[("example.com", &["192.0.2.1"])], true);
        let mut ctx = ctx("example.com", rr_type::MX);

        assert!(!hosts.execute(&mut ctx).await.unwrap());
        assert!(!ctx.resolved);
    }

    #[tokio::test]
    async fn family_mismatch_passes_through_by_default() {
        let hosts = plugin_with(&[("v4only.example", &["192.0.2.1"])], true);
        let mut ctx = ctx("v4only.example", rr_type::AAAA);

        assert!(!hosts.execute(&mut ctx).await.unwrap());
        assert!(!ctx.resolved);
    }

    #[tokio::test]
    async fn family_mismatch_is_nodata_without_pass_through() {
        let hosts = plugin_with(&[("v4only.example", &["192.0.2.1"])], false);
        let mut ctx = ctx("v4only.example", rr_type::AAAA);

        assert!(hosts.execute(&mut ctx).await.unwrap());
        assert!(ctx.resolved);
        assert_eq!(ctx.error, Some(Rcode::NoError));
        assert!(ctx.response.is_none());
    }

    #[tokio::test]
    async fn unmapped_name_is_ignored() {
        let hosts = plugin_with(&[("example.com", &["192.0.2.1"])], false);
        let mut ctx = ctx("other.example", rr_type::A);

        assert!(!hosts.execute(&mut ctx).await.unwrap());
    }

    #[tokio::test]
    async fn kv_hosts_file_entries_resolve() {
        let mut entries = AHashMap::new();
        entries.insert(
            "hosts/lan".to_string(),
            "192.0.2.50 printer.lan\n".to_string(),
        );
        let env = crate::plugin::chain::tests_support::env_with_kv(
            crate::plugin::chain::tests_support::StaticKv { entries },
        );

        let hosts = HostsPlugin {
            table: AHashMap::new(),
            files: vec!["hosts/lan".to_string()],
            loader: env.loader.clone(),
            ttl: 60,
            pass_through: true,
        };

        let mut ctx = ctx("printer.lan", rr_type::A);
        assert!(hosts.execute(&mut ctx).await.unwrap());
        let response = parse_response(ctx.response.as_ref().unwrap()).unwrap();
        assert_eq!(response.answers[0].data, "192.0.2.50");
        assert_eq!(response.answers[0].ttl, 60);
    }
}
