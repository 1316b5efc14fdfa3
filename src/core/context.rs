/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Per-request context flowing through the plugin chain.
//!
//! One `QueryContext` is created at the DoH boundary, mutated only by
//! plugin invocations and the boundary, and discarded once the HTTP reply
//! is written. The original query bytes are never mutated; plugins that
//! produce response bytes always allocate.

use crate::codec::{self, Query, Rcode};
use ahash::AHashMap;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Query parsed from the `?name=` / JSON request forms.
#[derive(Debug, Clone)]
pub struct JsonQuery {
    pub name: String,
    pub qtype: u16,
}

/// Pending redirect recorded by the redirect plugin and consumed by the
/// forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub original: String,
    pub target: String,
}

/// One captured plugin failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginError {
    pub plugin: String,
    pub message: String,
}

/// Observability and plugin hand-off state attached to a context.
#[derive(Debug, Default)]
pub struct Metadata {
    /// Ordered tag set; insertion is idempotent, tags are never removed.
    tags: Vec<String>,
    /// Elapsed wall time per executed plugin tag, written exactly once.
    pub timings: AHashMap<String, Duration>,
    /// Captured plugin failures, in execution order.
    pub errors: Vec<PluginError>,
    /// Upstream that produced the response, for observability.
    pub upstream: Option<String>,
    /// Last upstream failure reason.
    pub upstream_error: Option<String>,
    /// Redirect hand-off from the redirect plugin to the forwarder.
    pub redirect: Option<Redirect>,
    /// Cache hand-off from cache-read to cache-write.
    pub cache_key: Option<String>,
    pub cache_ttl: Option<u32>,
    /// Real client address (reverse-proxy header aware).
    pub client_addr: Option<SocketAddr>,
}

impl Metadata {
    pub fn tags(&self) -> &[String] {
        &self.tags
    }
}

/// Observer invoked whenever a plugin commits response bytes. This is the
/// write-through hook list: the cache plugin registers one on a miss.
pub trait ResponseObserver: Send + Sync {
    fn on_response(&self, metadata: &Metadata, response: &Bytes);
}

/// The single mutable object flowing through the chain.
pub struct QueryContext {
    /// Original binary query bytes; `None` for JSON-only queries that were
    /// synthesized (the synthesized buffer then lives in `query.raw`).
    dns_message: Option<Bytes>,
    /// Parsed question view over whichever buffer the request carried.
    query: Option<Query>,
    /// Query as received through the `?name=`/JSON forms, if any.
    pub json_query: Option<JsonQuery>,
    /// Response bytes committed by a plugin.
    pub response: Option<Bytes>,
    /// Response code recorded via `set_error`; overrides `response`
    /// rendering semantics when present.
    pub error: Option<Rcode>,
    /// Once true, the chain stops after the current plugin.
    pub resolved: bool,
    pub metadata: Metadata,
    observers: Vec<Arc<dyn ResponseObserver>>,
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("domain", &self.query_domain())
            .field("qtype", &self.query_type())
            .field("resolved", &self.resolved)
            .field("error", &self.error)
            .field("has_response", &self.response.is_some())
            .field("tags", &self.metadata.tags)
            .finish()
    }
}

impl QueryContext {
    /// Build a context from binary query bytes (the `dns=` and POST
    /// `application/dns-message` forms).
    pub fn from_wire(bytes: Bytes, client_addr: Option<SocketAddr>) -> Result<Self, codec::CodecError> {
        let query = codec::parse_query(&bytes)?;
        let mut metadata = Metadata::default();
        metadata.client_addr = client_addr;

        Ok(QueryContext {
            dns_message: Some(bytes),
            query: Some(query),
            json_query: None,
            response: None,
            error: None,
            resolved: false,
            metadata,
            observers: Vec::new(),
        })
    }

    /// Build a context from the `?name=`/JSON forms by synthesizing a wire
    /// query.
    pub fn from_json(name: &str, qtype: u16, client_addr: Option<SocketAddr>) -> Self {
        let query = codec::build_query(name, qtype);
        let mut metadata = Metadata::default();
        metadata.client_addr = client_addr;

        QueryContext {
            dns_message: Some(Bytes::from(query.raw.clone())),
            json_query: Some(JsonQuery {
                name: query
                    .question()
                    .map(|q| q.name.clone())
                    .unwrap_or_default(),
                qtype,
            }),
            query: Some(query),
            response: None,
            error: None,
            resolved: false,
            metadata,
            observers: Vec::new(),
        }
    }

    /// The original query bytes, retained verbatim for forwarding.
    pub fn dns_message(&self) -> Option<&Bytes> {
        self.dns_message.as_ref()
    }

    pub fn query(&self) -> Option<&Query> {
        self.query.as_ref()
    }

    /// Question name, lowercased with the trailing dot stripped.
    pub fn query_domain(&self) -> &str {
        self.query
            .as_ref()
            .and_then(|q| q.question())
            .map(|q| q.name.as_str())
            .unwrap_or("")
    }

    /// Question type number; 0 when no question was parsed.
    pub fn query_type(&self) -> u16 {
        self.query
            .as_ref()
            .and_then(|q| q.question())
            .map(|q| q.qtype)
            .unwrap_or(0)
    }

    /// Commit response bytes: marks the context resolved and notifies the
    /// registered response observers.
    pub fn set_response(&mut self, bytes: Bytes) {
        for observer in &self.observers {
            observer.on_response(&self.metadata, &bytes);
        }
        self.response = Some(bytes);
        self.resolved = true;
    }

    /// Record an error response code. Does not flip `resolved`; the
    /// calling plugin decides whether the chain should stop.
    pub fn set_error(&mut self, rcode: Rcode) {
        self.error = Some(rcode);
    }

    /// Add a tag; idempotent, never removes existing tags.
    pub fn add_tag(&mut self, tag: &str) {
        if !self.has_tag(tag) {
            self.metadata.tags.push(tag.to_string());
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata.tags.iter().any(|t| t == tag)
    }

    /// Register a response observer; invoked on every subsequent
    /// `set_response`.
    pub fn add_response_observer(&mut self, observer: Arc<dyn ResponseObserver>) {
        self.observers.push(observer);
    }

    /// Independent copy for load-balancer fan-out. Observers are not
    /// carried over: the winning sub-response is re-applied through the
    /// parent's `set_response`, which fires them exactly once.
    pub fn clone_for_subquery(&self) -> Self {
        QueryContext {
            dns_message: self.dns_message.clone(),
            query: self.query.clone(),
            json_query: self.json_query.clone(),
            response: None,
            error: None,
            resolved: false,
            metadata: Metadata {
                tags: self.metadata.tags.clone(),
                timings: AHashMap::new(),
                errors: Vec::new(),
                upstream: None,
                upstream_error: None,
                redirect: self.metadata.redirect.clone(),
                cache_key: None,
                cache_ttl: None,
                client_addr: self.metadata.client_addr,
            },
            observers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::rr_type;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wire_context(name: &str) -> QueryContext {
        let query = codec::build_query(name, rr_type::A);
        QueryContext::from_wire(Bytes::from(query.raw), None).unwrap()
    }

    #[test]
    fn wire_context_exposes_question() {
        let ctx = wire_context("Example.COM");
        assert_eq!(ctx.query_domain(), "example.com");
        assert_eq!(ctx.query_type(), rr_type::A);
        assert!(ctx.dns_message().is_some());
        assert!(ctx.json_query.is_none());
    }

    #[test]
    fn json_context_keeps_json_query() {
        let ctx = QueryContext::from_json("example.com", rr_type::AAAA, None);
        assert_eq!(ctx.query_domain(), "example.com");
        assert_eq!(ctx.json_query.as_ref().unwrap().qtype, rr_type::AAAA);
    }

    #[test]
    fn tags_are_idempotent_and_ordered() {
        let mut ctx = wire_context("example.com");
        ctx.add_tag("one");
        ctx.add_tag("two");
        ctx.add_tag("one");
        assert_eq!(ctx.metadata.tags(), ["one", "two"]);
    }

    #[test]
    fn set_response_resolves_and_notifies_observers() {
        struct Counter(AtomicUsize);
        impl ResponseObserver for Counter {
            fn on_response(&self, _metadata: &Metadata, _response: &Bytes) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let mut ctx = wire_context("example.com");
        ctx.add_response_observer(counter.clone());

        ctx.set_response(Bytes::from_static(b"\x00\x01"));
        assert!(ctx.resolved);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_error_does_not_resolve() {
        let mut ctx = wire_context("example.com");
        ctx.set_error(Rcode::NxDomain);
        assert!(!ctx.resolved);
        assert_eq!(ctx.error, Some(Rcode::NxDomain));
    }

    #[test]
    fn subquery_clone_drops_observers_and_outcome() {
        struct Nop;
        impl ResponseObserver for Nop {
            fn on_response(&self, _m: &Metadata, _r: &Bytes) {}
        }

        let mut ctx = wire_context("example.com");
        ctx.add_tag("seed");
        ctx.add_response_observer(Arc::new(Nop));
        ctx.set_response(Bytes::from_static(b"x"));

        let sub = ctx.clone_for_subquery();
        assert!(sub.has_tag("seed"));
        assert!(!sub.resolved);
        assert!(sub.response.is_none());
        assert!(sub.observers.is_empty());
    }
}
