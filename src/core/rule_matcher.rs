/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Shared domain and IP rule matchers used by the policy plugins.
//!
//! Domain patterns come in four shapes: bare `x` (exact), `*.x` (any
//! proper subdomain of `x`), `~text` (substring), and `regexp:expr`.
//! Invalid regex patterns are logged and treated as non-matching.

use ahash::AHashSet;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use regex::{RegexSet, RegexSetBuilder};
use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::warn;

/// Normalize a domain: trim whitespace, strip trailing dots, lowercase.
pub fn normalize_domain(domain: &str) -> Cow<'_, str> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(trimmed.to_ascii_lowercase())
    } else {
        Cow::Borrowed(trimmed)
    }
}

/// A compiled set of domain patterns.
#[derive(Debug, Default)]
pub struct DomainPatternSet {
    exact: AHashSet<Box<str>>,
    /// `*.x` rules, stored as `x`; match any proper subdomain.
    wildcard: AHashSet<Box<str>>,
    /// `x` rules added with subdomain inclusion; match `x` and `*.x`.
    subtree: AHashSet<Box<str>>,
    keyword_patterns: Vec<String>,
    keyword: Option<AhoCorasick>,
    regex_patterns: Vec<String>,
    regex: Option<RegexSet>,
}

impl DomainPatternSet {
    /// Add one pattern, classified by its shape.
    pub fn add_pattern(&mut self, raw: &str) {
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }

        if let Some(expr) = raw.strip_prefix("regexp:") {
            match regex::Regex::new(expr) {
                Ok(_) => self.regex_patterns.push(expr.to_string()),
                Err(e) => warn!(pattern = %raw, error = %e, "ignoring invalid regex pattern"),
            }
            return;
        }
        if let Some(sub) = raw.strip_prefix('~') {
            let sub = sub.trim();
            if !sub.is_empty() {
                self.keyword_patterns.push(sub.to_ascii_lowercase());
            }
            return;
        }
        if let Some(suffix) = raw.strip_prefix("*.") {
            let suffix = normalize_domain(suffix);
            if !suffix.is_empty() {
                self.wildcard.insert(suffix.into_owned().into_boxed_str());
            }
            return;
        }

        let exact = normalize_domain(raw);
        if !exact.is_empty() {
            self.exact.insert(exact.into_owned().into_boxed_str());
        }
    }

    /// Add a bare domain, optionally matching its whole subtree.
    pub fn add_domain(&mut self, raw: &str, include_subdomains: bool) {
        let normalized = normalize_domain(raw);
        if normalized.is_empty() {
            return;
        }
        if let Some(suffix) = normalized.strip_prefix("*.") {
            if !suffix.is_empty() {
                self.wildcard.insert(suffix.to_owned().into_boxed_str());
            }
            return;
        }
        if include_subdomains {
            self.subtree.insert(normalized.into_owned().into_boxed_str());
        } else {
            self.exact.insert(normalized.into_owned().into_boxed_str());
        }
    }

    /// Compile pending keyword / regex patterns. Must be called once after
    /// loading; failures degrade to non-matching with a warning.
    pub fn finalize(&mut self) {
        if !self.keyword_patterns.is_empty() {
            match AhoCorasickBuilder::new().build(&self.keyword_patterns) {
                Ok(matcher) => self.keyword = Some(matcher),
                Err(e) => warn!(error = %e, "failed to build substring matcher"),
            }
            self.keyword_patterns.clear();
            self.keyword_patterns.shrink_to_fit();
        }
        if !self.regex_patterns.is_empty() {
            match RegexSetBuilder::new(&self.regex_patterns)
                .case_insensitive(true)
                .build()
            {
                Ok(set) => self.regex = Some(set),
                Err(e) => warn!(error = %e, "failed to build regex set"),
            }
            self.regex_patterns.clear();
            self.regex_patterns.shrink_to_fit();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
            && self.wildcard.is_empty()
            && self.subtree.is_empty()
            && self.keyword.is_none()
            && self.regex.is_none()
    }

    /// Match an already-normalized domain.
    pub fn matches(&self, domain: &str) -> bool {
        if domain.is_empty() {
            return false;
        }

        if self.exact.contains(domain) || self.subtree.contains(domain) {
            return true;
        }

        // Walk parent suffixes: for query a.b.c check b.c then c.
        if !self.wildcard.is_empty() || !self.subtree.is_empty() {
            let mut rest = domain;
            while let Some(dot) = rest.find('.') {
                rest = &rest[dot + 1..];
                if self.wildcard.contains(rest) || self.subtree.contains(rest) {
                    return true;
                }
            }
        }

        if self.keyword.as_ref().is_some_and(|m| m.is_match(domain)) {
            return true;
        }
        self.regex.as_ref().is_some_and(|m| m.is_match(domain))
    }
}

/// IPv4 bits are left-aligned in the shared u128 representation so the
/// mask arithmetic is identical for both families.
#[inline]
fn ipv4_to_u128(ip: Ipv4Addr) -> u128 {
    (u32::from(ip) as u128) << 96
}

#[inline]
fn ipv6_to_u128(ip: Ipv6Addr) -> u128 {
    u128::from_be_bytes(ip.octets())
}

#[inline]
fn ip_to_u128(ip: IpAddr) -> (u128, bool) {
    match ip {
        IpAddr::V4(v4) => (ipv4_to_u128(v4), false),
        IpAddr::V6(v6) => (ipv6_to_u128(v6), true),
    }
}

/// Prefix lengths count from the top bit; IPv4 left-alignment makes the
/// same mask arithmetic valid for both families.
#[inline]
fn prefix_mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len as u32)
    }
}

#[derive(Debug, Clone, Copy)]
struct CidrRule {
    bits: u128,
    mask: u128,
    v6: bool,
}

#[derive(Debug, Clone, Copy)]
struct RangeRule {
    lo: u128,
    hi: u128,
    v6: bool,
}

/// A compiled set of IP rules: literals, CIDR prefixes, and inclusive
/// `a-b` ranges.
#[derive(Debug, Default)]
pub struct IpRuleSet {
    cidrs: Vec<CidrRule>,
    ranges: Vec<RangeRule>,
}

impl IpRuleSet {
    /// Parse one rule: `ip`, `ip/prefix`, or `a-b`.
    pub fn add_rule(&mut self, raw: &str) -> Result<(), String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(());
        }

        if let Some((lo, hi)) = raw.split_once('-') {
            let lo = lo
                .trim()
                .parse::<IpAddr>()
                .map_err(|e| format!("invalid range start '{}': {}", lo.trim(), e))?;
            let hi = hi
                .trim()
                .parse::<IpAddr>()
                .map_err(|e| format!("invalid range end '{}': {}", hi.trim(), e))?;
            let (lo_bits, lo_v6) = ip_to_u128(lo);
            let (hi_bits, hi_v6) = ip_to_u128(hi);
            if lo_v6 != hi_v6 {
                return Err(format!("mixed address families in range '{}'", raw));
            }
            if lo_bits > hi_bits {
                return Err(format!("inverted range '{}'", raw));
            }
            self.ranges.push(RangeRule {
                lo: lo_bits,
                hi: hi_bits,
                v6: lo_v6,
            });
            return Ok(());
        }

        let (ip_part, prefix_part) = match raw.split_once('/') {
            Some((ip, prefix)) => (ip.trim(), Some(prefix.trim())),
            None => (raw, None),
        };

        let ip = ip_part
            .parse::<IpAddr>()
            .map_err(|e| format!("invalid ip address '{}': {}", ip_part, e))?;
        let total_bits: u8 = if ip.is_ipv6() { 128 } else { 32 };
        let prefix_len = match prefix_part {
            Some(s) => {
                let len = s
                    .parse::<u8>()
                    .map_err(|e| format!("invalid prefix '{}': {}", s, e))?;
                if len > total_bits {
                    return Err(format!(
                        "prefix out of range: {} (expected 0..={})",
                        len, total_bits
                    ));
                }
                len
            }
            None => total_bits,
        };

        let (bits, v6) = ip_to_u128(ip);
        let mask = prefix_mask(prefix_len);
        self.cidrs.push(CidrRule {
            bits: bits & mask,
            mask,
            v6,
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.cidrs.is_empty() && self.ranges.is_empty()
    }

    pub fn rule_count(&self) -> usize {
        self.cidrs.len() + self.ranges.len()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let (bits, v6) = ip_to_u128(ip);

        for rule in &self.cidrs {
            if rule.v6 == v6 && bits & rule.mask == rule.bits {
                return true;
            }
        }
        for rule in &self.ranges {
            if rule.v6 == v6 && bits >= rule.lo && bits <= rule.hi {
                return true;
            }
        }
        false
    }
}

/// RFC 1918 plus loopback.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
                || octets[0] == 127
        }
        IpAddr::V6(_) => false,
    }
}
