/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DoH boundary.
//!
//! Decodes the four accepted request forms into a `QueryContext`, runs the
//! chain, and renders the reply: binary `application/dns-message`, or
//! `application/dns-json` when the request arrived through the `?name=` /
//! JSON forms.

use crate::codec::{
    self, base64url_decode, rr_type_from_name, Rcode, FLAG_AD, FLAG_CD, FLAG_RA, FLAG_RD, FLAG_TC,
};
use crate::core::context::QueryContext;
use crate::plugin::chain::Chain;
use bytes::Bytes;
use http::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

pub const CONTENT_TYPE_DNS: &str = "application/dns-message";
pub const CONTENT_TYPE_DNS_JSON: &str = "application/dns-json";
const CACHE_CONTROL: &str = "max-age=300";

// RFC 8484 recommends at most 65535 bytes per message.
pub const MAX_DNS_MESSAGE_SIZE: usize = 65535;

/// Malformed request at the boundary; rendered as HTTP 400.
#[derive(Debug)]
pub struct BadRequest(pub String);

/// JSON POST body: `{ "name": "...", "type": "A" | 1 }`.
#[derive(Debug, Deserialize)]
struct JsonQueryBody {
    name: String,
    #[serde(rename = "type")]
    qtype: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct DnsJsonQuestion {
    name: String,
    #[serde(rename = "type")]
    qtype: u16,
}

#[derive(Debug, Serialize)]
struct DnsJsonAnswer {
    name: String,
    #[serde(rename = "type")]
    qtype: u16,
    #[serde(rename = "TTL")]
    ttl: u32,
    data: String,
}

#[derive(Debug, Serialize)]
struct DnsJsonReply {
    #[serde(rename = "Status")]
    status: u16,
    #[serde(rename = "TC")]
    tc: bool,
    #[serde(rename = "RD")]
    rd: bool,
    #[serde(rename = "RA")]
    ra: bool,
    #[serde(rename = "AD")]
    ad: bool,
    #[serde(rename = "CD")]
    cd: bool,
    #[serde(rename = "Question")]
    question: Vec<DnsJsonQuestion>,
    #[serde(rename = "Answer")]
    answer: Vec<DnsJsonAnswer>,
}

/// Pull one parameter out of a raw query string.
fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix(name) {
            if let Some(value) = value.strip_prefix('=') {
                return Some(value);
            }
        }
    }
    None
}

/// Decode a GET request (`?dns=` or `?name=[&type=]`) into a context.
pub fn context_from_get(
    query: Option<&str>,
    client_addr: Option<SocketAddr>,
) -> Result<QueryContext, BadRequest> {
    let Some(query) = query else {
        return Err(BadRequest("missing query string".to_string()));
    };

    if let Some(encoded) = query_param(query, "dns") {
        let bytes = base64url_decode(encoded)
            .ok_or_else(|| BadRequest("invalid base64url in dns parameter".to_string()))?;
        if bytes.len() > MAX_DNS_MESSAGE_SIZE {
            return Err(BadRequest("DNS message too large".to_string()));
        }
        return QueryContext::from_wire(Bytes::from(bytes), client_addr)
            .map_err(|e| BadRequest(e.to_string()));
    }

    if let Some(name) = query_param(query, "name") {
        if name.is_empty() {
            return Err(BadRequest("empty name parameter".to_string()));
        }
        let qtype = query_param(query, "type")
            .map(rr_type_from_name)
            .unwrap_or(codec::rr_type::A);
        return Ok(QueryContext::from_json(name, qtype, client_addr));
    }

    Err(BadRequest("expected dns= or name= parameter".to_string()))
}

/// Decode a POST request (binary or JSON body) into a context.
pub fn context_from_post(
    content_type: Option<&str>,
    body: &Bytes,
    client_addr: Option<SocketAddr>,
) -> Result<QueryContext, BadRequest> {
    let content_type = content_type
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    match content_type.as_str() {
        CONTENT_TYPE_DNS => {
            if body.len() > MAX_DNS_MESSAGE_SIZE {
                return Err(BadRequest("DNS message too large".to_string()));
            }
            QueryContext::from_wire(body.clone(), client_addr)
                .map_err(|e| BadRequest(e.to_string()))
        }
        "application/json" => {
            let parsed: JsonQueryBody = serde_json::from_slice(body)
                .map_err(|e| BadRequest(format!("invalid JSON query: {}", e)))?;
            if parsed.name.is_empty() {
                return Err(BadRequest("empty name in JSON query".to_string()));
            }
            let qtype = match &parsed.qtype {
                None => codec::rr_type::A,
                Some(serde_json::Value::Number(n)) => {
                    n.as_u64().map(|n| n as u16).unwrap_or(codec::rr_type::A)
                }
                Some(serde_json::Value::String(s)) => rr_type_from_name(s),
                Some(_) => {
                    return Err(BadRequest("invalid type in JSON query".to_string()));
                }
            };
            Ok(QueryContext::from_json(&parsed.name, qtype, client_addr))
        }
        other => Err(BadRequest(format!("unsupported content type '{}'", other))),
    }
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Bytes> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Bytes::from_static(body.as_bytes()))
        .expect("static response")
}

pub fn bad_request(reason: &str) -> Response<Bytes> {
    debug!(reason, "rejecting malformed DoH request");
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header("Content-Type", "text/plain")
        .body(Bytes::from(format!("400 Bad Request: {}", reason)))
        .expect("error response")
}

/// Render the chain outcome as an HTTP reply.
pub fn build_http_response(ctx: &QueryContext) -> Response<Bytes> {
    if let Some(rcode) = ctx.error {
        return match rcode {
            Rcode::Refused => plain_response(StatusCode::BAD_GATEWAY, "DNS server error"),
            _ => plain_response(StatusCode::INTERNAL_SERVER_ERROR, "DNS server error"),
        };
    }

    let Some(response) = ctx.response.as_ref().filter(|_| ctx.resolved) else {
        return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "not processed");
    };

    if ctx.json_query.is_some() {
        let reply = json_reply(ctx, response);
        let body = match serde_json::to_vec(&reply) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to serialize dns-json reply");
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "DNS server error");
            }
        };
        return Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", CONTENT_TYPE_DNS_JSON)
            .header("Cache-Control", CACHE_CONTROL)
            .body(Bytes::from(body))
            .expect("json response");
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", CONTENT_TYPE_DNS)
        .header("Cache-Control", CACHE_CONTROL)
        .body(response.clone())
        .expect("dns response")
}

/// Derive the dns-json body from the response bytes. A response that no
/// longer parses degrades to SERVFAIL with an empty answer set.
fn json_reply(ctx: &QueryContext, response: &Bytes) -> DnsJsonReply {
    match codec::parse_response(response) {
        Ok(parsed) => DnsJsonReply {
            status: parsed.rcode.to_u8() as u16,
            tc: parsed.flags & FLAG_TC != 0,
            rd: parsed.flags & FLAG_RD != 0,
            ra: parsed.flags & FLAG_RA != 0,
            ad: parsed.flags & FLAG_AD != 0,
            cd: parsed.flags & FLAG_CD != 0,
            question: parsed
                .questions
                .iter()
                .map(|q| DnsJsonQuestion {
                    name: q.name.clone(),
                    qtype: q.qtype,
                })
                .collect(),
            answer: parsed
                .answers
                .iter()
                .map(|a| DnsJsonAnswer {
                    name: a.name.clone(),
                    qtype: a.rtype,
                    ttl: a.ttl,
                    data: a.data.clone(),
                })
                .collect(),
        },
        Err(e) => {
            warn!(error = %e, "stored response failed to parse for dns-json");
            DnsJsonReply {
                status: Rcode::ServFail.to_u8() as u16,
                tc: false,
                rd: false,
                ra: false,
                ad: false,
                cd: false,
                question: ctx
                    .json_query
                    .iter()
                    .map(|q| DnsJsonQuestion {
                        name: q.name.clone(),
                        qtype: q.qtype,
                    })
                    .collect(),
                answer: Vec::new(),
            }
        }
    }
}

/// The `/dns-query` endpoint: boundary decoding plus chain execution.
#[derive(Debug)]
pub struct DohEndpoint {
    chain: Arc<Chain>,
}

impl DohEndpoint {
    pub fn new(chain: Arc<Chain>) -> Self {
        DohEndpoint { chain }
    }

    pub async fn handle_get(
        &self,
        query: Option<&str>,
        client_addr: Option<SocketAddr>,
    ) -> Response<Bytes> {
        let ctx = match context_from_get(query, client_addr) {
            Ok(ctx) => ctx,
            Err(BadRequest(reason)) => return bad_request(&reason),
        };
        self.run(ctx).await
    }

    pub async fn handle_post(
        &self,
        content_type: Option<&str>,
        body: &Bytes,
        client_addr: Option<SocketAddr>,
    ) -> Response<Bytes> {
        let ctx = match context_from_post(content_type, body, client_addr) {
            Ok(ctx) => ctx,
            Err(BadRequest(reason)) => return bad_request(&reason),
        };
        self.run(ctx).await
    }

    async fn run(&self, mut ctx: QueryContext) -> Response<Bytes> {
        self.chain.execute(&mut ctx).await;

        debug!(
            domain = %ctx.query_domain(),
            qtype = ctx.query_type(),
            resolved = ctx.resolved,
            tags = ?ctx.metadata.tags(),
            errors = ctx.metadata.errors.len(),
            "chain finished"
        );

        build_http_response(&ctx)
    }
}
