/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! KV-backed data loader.
//!
//! Domain lists, IP lists, and hosts tables live in an external key-value
//! store; this module pulls them through a per-family TTL cache so hot
//! lookups never touch the backend. A backend failure degrades to an empty
//! value and is logged, never raised.

use crate::core::error::Result;
use crate::core::rule_matcher::{normalize_domain, IpRuleSet};
use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default cache TTL for loaded lists (30 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// External key-value collaborator. Keys are structured as
/// `<family>/<name>` but are opaque here.
#[async_trait]
pub trait KvStore: std::fmt::Debug + Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;
}

/// Directory-backed `KvStore`: key `domains/ads` maps to
/// `<root>/domains/ads`.
#[derive(Debug)]
pub struct DirKvStore {
    root: PathBuf,
}

impl DirKvStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        DirKvStore { root: root.into() }
    }
}

#[async_trait]
impl KvStore for DirKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        // Reject traversal outside the root.
        if key.split('/').any(|part| part == "..") {
            return Ok(None);
        }

        let path = self.root.join(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Hosts table: hostname -> IP literal. Later lines override earlier ones.
pub type HostsTable = AHashMap<String, String>;

/// Domain list: set of normalized domain strings.
pub type DomainList = AHashSet<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Domains,
    Ips,
    Hosts,
}

impl Family {
    pub fn as_str(self) -> &'static str {
        match self {
            Family::Domains => "domains",
            Family::Ips => "ips",
            Family::Hosts => "hosts",
        }
    }
}

struct CacheEntry<T> {
    value: Arc<T>,
    expires_at: Instant,
}

struct FamilyCache<T> {
    entries: Mutex<AHashMap<String, CacheEntry<T>>>,
}

impl<T> FamilyCache<T> {
    fn new() -> Self {
        FamilyCache {
            entries: Mutex::new(AHashMap::new()),
        }
    }
}

/// Loader counters for the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct LoaderStats {
    pub domains: usize,
    pub ips: usize,
    pub hosts: usize,
}

/// TTL-bounded read-through cache over the KV collaborator.
///
/// A coarse lock per family is sufficient: duplicate loads under
/// contention produce equal values.
pub struct DataLoader {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    domains: FamilyCache<DomainList>,
    ips: FamilyCache<IpRuleSet>,
    hosts: FamilyCache<HostsTable>,
}

impl std::fmt::Debug for DataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoader")
            .field("kv", &self.kv)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl DataLoader {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Option<Duration>) -> Self {
        DataLoader {
            kv,
            ttl: ttl.unwrap_or(DEFAULT_TTL),
            domains: FamilyCache::new(),
            ips: FamilyCache::new(),
            hosts: FamilyCache::new(),
        }
    }

    /// Load a domain list by KV key.
    pub async fn domains(&self, key: &str) -> Arc<DomainList> {
        let mut entries = self.domains.entries.lock().await;
        if let Some(entry) = entries.get(key) {
            if Instant::now() < entry.expires_at {
                return entry.value.clone();
            }
        }

        let value = Arc::new(parse_domain_list(&self.fetch(Family::Domains, key).await));
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        value
    }

    /// Load an IP rule list by KV key.
    pub async fn ips(&self, key: &str) -> Arc<IpRuleSet> {
        let mut entries = self.ips.entries.lock().await;
        if let Some(entry) = entries.get(key) {
            if Instant::now() < entry.expires_at {
                return entry.value.clone();
            }
        }

        let value = Arc::new(parse_ip_list(key, &self.fetch(Family::Ips, key).await));
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        value
    }

    /// Load a hosts table by KV key.
    pub async fn hosts(&self, key: &str) -> Arc<HostsTable> {
        let mut entries = self.hosts.entries.lock().await;
        if let Some(entry) = entries.get(key) {
            if Instant::now() < entry.expires_at {
                return entry.value.clone();
            }
        }

        let value = Arc::new(parse_hosts_file(key, &self.fetch(Family::Hosts, key).await));
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        value
    }

    async fn fetch(&self, family: Family, key: &str) -> String {
        match self.kv.get(key).await {
            Ok(Some(text)) => {
                debug!(family = family.as_str(), key, bytes = text.len(), "loaded list from KV");
                text
            }
            Ok(None) => {
                warn!(family = family.as_str(), key, "KV key not found, treating as empty");
                String::new()
            }
            Err(e) => {
                warn!(family = family.as_str(), key, error = %e, "KV load failed, treating as empty");
                String::new()
            }
        }
    }

    /// Drop cached entries for one family, or all of them.
    pub async fn clear_cache(&self, family: Option<Family>) {
        match family {
            Some(Family::Domains) => self.domains.entries.lock().await.clear(),
            Some(Family::Ips) => self.ips.entries.lock().await.clear(),
            Some(Family::Hosts) => self.hosts.entries.lock().await.clear(),
            None => {
                self.domains.entries.lock().await.clear();
                self.ips.entries.lock().await.clear();
                self.hosts.entries.lock().await.clear();
            }
        }
    }

    /// Cached entry counts per family.
    pub async fn stats(&self) -> LoaderStats {
        LoaderStats {
            domains: self.domains.entries.lock().await.len(),
            ips: self.ips.entries.lock().await.len(),
            hosts: self.hosts.entries.lock().await.len(),
        }
    }
}

/// Strip a trailing `#` comment and surrounding whitespace; returns None
/// for blank and comment-only lines.
fn effective_line(raw: &str) -> Option<&str> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.split_once('#').map(|(left, _)| left).unwrap_or(line).trim();
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

fn parse_domain_list(text: &str) -> DomainList {
    let mut out = DomainList::new();
    for raw in text.lines() {
        let Some(line) = effective_line(raw) else {
            continue;
        };
        let normalized = normalize_domain(line);
        if !normalized.is_empty() {
            out.insert(normalized.into_owned());
        }
    }
    out
}

fn parse_ip_list(key: &str, text: &str) -> IpRuleSet {
    let mut out = IpRuleSet::default();
    for (line_no, raw) in text.lines().enumerate() {
        let Some(line) = effective_line(raw) else {
            continue;
        };
        if let Err(e) = out.add_rule(line) {
            warn!(key, line = line_no + 1, error = %e, "skipping invalid IP rule");
        }
    }
    out
}

fn parse_hosts_file(key: &str, text: &str) -> HostsTable {
    let mut out = HostsTable::new();
    for (line_no, raw) in text.lines().enumerate() {
        let Some(line) = effective_line(raw) else {
            continue;
        };

        let mut fields = line.split_whitespace();
        let Some(ip) = fields.next() else {
            continue;
        };
        if ip.parse::<std::net::IpAddr>().is_err() {
            warn!(key, line = line_no + 1, ip, "skipping hosts line with invalid IP");
            continue;
        }

        let mut any_host = false;
        for host in fields {
            let normalized = normalize_domain(host);
            if normalized.is_empty() {
                continue;
            }
            // Later lines override earlier ones.
            out.insert(normalized.into_owned(), ip.to_string());
            any_host = true;
        }
        if !any_host {
            warn!(key, line = line_no + 1, "skipping hosts line without hostnames");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that counts calls and serves a fixed table.
    #[derive(Debug, Default)]
    struct CountingKv {
        calls: AtomicUsize,
        entries: AHashMap<String, String>,
        fail: bool,
    }

    #[async_trait]
    impl KvStore for CountingKv {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("backend down".into());
            }
            Ok(self.entries.get(key).cloned())
        }
    }

    #[test]
    fn domain_list_parser_skips_comments_and_blanks() {
        let parsed = parse_domain_list("# header\n\nExample.COM.\nads.example # inline\n");
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains("example.com"));
        assert!(parsed.contains("ads.example"));
    }

    #[test]
    fn ip_list_parser_accepts_literals_cidrs_and_ranges() {
        let parsed = parse_ip_list("k", "192.0.2.1\n10.0.0.0/8\n2001:db8::/32\n1.1.1.1-1.1.1.9\nnot-an-ip\n");
        assert_eq!(parsed.rule_count(), 4);
        assert!(parsed.contains("10.9.9.9".parse().unwrap()));
        assert!(parsed.contains("1.1.1.5".parse().unwrap()));
    }

    #[test]
    fn hosts_parser_maps_every_host_and_overrides() {
        let parsed = parse_hosts_file(
            "k",
            "192.0.2.1 a.example b.example\n# comment\n192.0.2.2 b.example\n",
        );
        assert_eq!(parsed.get("a.example").unwrap(), "192.0.2.1");
        assert_eq!(parsed.get("b.example").unwrap(), "192.0.2.2");
    }

    #[tokio::test]
    async fn loader_serves_from_cache_within_ttl() {
        let mut entries = AHashMap::new();
        entries.insert("domains/ads".to_string(), "ads.example\n".to_string());
        let kv = Arc::new(CountingKv {
            entries,
            ..Default::default()
        });
        let loader = DataLoader::new(kv.clone(), Some(Duration::from_secs(60)));

        let first = loader.domains("domains/ads").await;
        let second = loader.domains("domains/ads").await;
        assert!(first.contains("ads.example"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(kv.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loader_reloads_after_ttl() {
        let mut entries = AHashMap::new();
        entries.insert("domains/ads".to_string(), "ads.example\n".to_string());
        let kv = Arc::new(CountingKv {
            entries,
            ..Default::default()
        });
        let loader = DataLoader::new(kv.clone(), Some(Duration::from_millis(10)));

        let _ = loader.domains("domains/ads").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = loader.domains("domains/ads").await;
        assert_eq!(kv.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn backend_failure_yields_empty_value() {
        let kv = Arc::new(CountingKv {
            fail: true,
            ..Default::default()
        });
        let loader = DataLoader::new(kv, None);

        let domains = loader.domains("domains/missing").await;
        assert!(domains.is_empty());
        let ips = loader.ips("ips/missing").await;
        assert!(ips.is_empty());
    }

    #[tokio::test]
    async fn clear_cache_and_stats() {
        let mut entries = AHashMap::new();
        entries.insert("domains/a".to_string(), "a.example\n".to_string());
        entries.insert("hosts/h".to_string(), "192.0.2.1 h.example\n".to_string());
        let kv = Arc::new(CountingKv {
            entries,
            ..Default::default()
        });
        let loader = DataLoader::new(kv, None);

        let _ = loader.domains("domains/a").await;
        let _ = loader.hosts("hosts/h").await;
        assert_eq!(
            loader.stats().await,
            LoaderStats {
                domains: 1,
                ips: 0,
                hosts: 1
            }
        );

        loader.clear_cache(Some(Family::Domains)).await;
        assert_eq!(loader.stats().await.domains, 0);
        assert_eq!(loader.stats().await.hosts, 1);

        loader.clear_cache(None).await;
        assert_eq!(loader.stats().await.hosts, 0);
    }

    #[tokio::test]
    async fn dir_kv_store_reads_files() {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let root = std::env::temp_dir().join(format!("gatedns-kv-{}", ts));
        std::fs::create_dir_all(root.join("domains")).unwrap();
        std::fs::write(root.join("domains/ads"), "ads.example\n").unwrap();

        let kv = DirKvStore::new(&root);
        assert_eq!(
            kv.get("domains/ads").await.unwrap().unwrap(),
            "ads.example\n"
        );
        assert!(kv.get("domains/none").await.unwrap().is_none());
        assert!(kv.get("../etc/passwd").await.unwrap().is_none());
    }
}
