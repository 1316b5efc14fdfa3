/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Wire-format synthesis and in-place rewrites.

use super::decode::answer_spans;
use super::{rr_type, CodecError, Query, Question, Rcode, FLAG_QR, HEADER_LEN};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Append an RFC 1035 label sequence for `name`. An empty name encodes as
/// the root (a single zero byte). Oversized labels are truncated to 63
/// bytes rather than producing an invalid length octet.
fn push_name(out: &mut Vec<u8>, name: &str) {
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        let bytes = label.as_bytes();
        let len = bytes.len().min(63);
        out.push(len as u8);
        out.extend_from_slice(&bytes[..len]);
    }
    out.push(0);
}

/// Synthesize a query buffer with explicit header fields.
pub fn build_query_raw(id: u16, flags: u16, name: &str, qtype: u16, qclass: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    push_name(&mut out, name);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&qclass.to_be_bytes());
    out
}

/// Synthesize a standard recursive query for `name`/`qtype` with a random
/// id, as used by the JSON query forms.
pub fn build_query(name: &str, qtype: u16) -> Query {
    let id: u16 = rand::rng().random();
    let normalized = name.trim_end_matches('.').to_ascii_lowercase();
    let raw = build_query_raw(id, 0x0100, &normalized, qtype, 1);

    Query {
        id,
        flags: 0x0100,
        questions: vec![Question {
            name: normalized,
            qtype,
            qclass: 1,
        }],
        raw,
    }
}

/// Clone the query bytes into an error response: QR set, low 4 flag bits
/// replaced with `rcode`.
pub fn build_error_response(
    query_bytes: &[u8],
    rcode: Rcode,
) -> Result<Vec<u8>, CodecError> {
    if query_bytes.len() < HEADER_LEN {
        return Err(CodecError::FormErr(format!(
            "message too short: {} bytes",
            query_bytes.len()
        )));
    }

    let mut out = query_bytes.to_vec();
    let flags = u16::from_be_bytes([out[2], out[3]]);
    let flags = (flags | FLAG_QR) & !0x000F | rcode.to_u8() as u16;
    out[2..4].copy_from_slice(&flags.to_be_bytes());
    Ok(out)
}

/// Synthesize a full response for a hosts lookup: header, the original
/// question, and one address record per IP with the name compressed to a
/// pointer at the question name.
pub fn build_host_response(query: &Query, ips: &[IpAddr], ttl: u32) -> Option<Vec<u8>> {
    let question = query.question()?;

    let mut out = Vec::with_capacity(HEADER_LEN + question.name.len() + 6 + ips.len() * 28);
    out.extend_from_slice(&query.id.to_be_bytes());
    out.extend_from_slice(&(query.flags | FLAG_QR | super::FLAG_RA).to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&(ips.len() as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    push_name(&mut out, &question.name);
    out.extend_from_slice(&question.qtype.to_be_bytes());
    out.extend_from_slice(&question.qclass.to_be_bytes());

    for ip in ips {
        // Pointer to the question name right after the header.
        out.extend_from_slice(&[0xC0, HEADER_LEN as u8]);
        match ip {
            IpAddr::V4(v4) => {
                out.extend_from_slice(&rr_type::A.to_be_bytes());
                out.extend_from_slice(&question.qclass.to_be_bytes());
                out.extend_from_slice(&ttl.to_be_bytes());
                out.extend_from_slice(&4u16.to_be_bytes());
                out.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                out.extend_from_slice(&rr_type::AAAA.to_be_bytes());
                out.extend_from_slice(&question.qclass.to_be_bytes());
                out.extend_from_slice(&ttl.to_be_bytes());
                out.extend_from_slice(&16u16.to_be_bytes());
                out.extend_from_slice(&v6.octets());
            }
        }
    }

    Some(out)
}

/// Clone `bytes` and rewrite every answer TTL through `apply`. Returns the
/// rewritten buffer and whether any TTL changed.
pub fn rewrite_answer_ttls<F>(bytes: &[u8], apply: F) -> Result<(Vec<u8>, bool), CodecError>
where
    F: Fn(u32) -> u32,
{
    let spans = answer_spans(bytes)?;
    let mut out = bytes.to_vec();
    let mut changed = false;

    for span in spans {
        let new_ttl = apply(span.ttl);
        if new_ttl != span.ttl {
            out[span.ttl_offset..span.ttl_offset + 4].copy_from_slice(&new_ttl.to_be_bytes());
            changed = true;
        }
    }

    Ok((out, changed))
}

/// Clone `bytes` and replace the RDATA of A/AAAA answers with the given
/// addresses (family-matched). Returns the rewritten buffer and whether
/// any record changed.
pub fn rewrite_answer_addrs(
    bytes: &[u8],
    v4: Option<Ipv4Addr>,
    v6: Option<Ipv6Addr>,
) -> Result<(Vec<u8>, bool), CodecError> {
    let spans = answer_spans(bytes)?;
    let mut out = bytes.to_vec();
    let mut changed = false;

    for span in spans {
        match (span.rtype, span.rdata_len) {
            (rr_type::A, 4) => {
                if let Some(addr) = v4 {
                    let octets = addr.octets();
                    if out[span.rdata_offset..span.rdata_offset + 4] != octets {
                        out[span.rdata_offset..span.rdata_offset + 4].copy_from_slice(&octets);
                        changed = true;
                    }
                }
            }
            (rr_type::AAAA, 16) => {
                if let Some(addr) = v6 {
                    let octets = addr.octets();
                    if out[span.rdata_offset..span.rdata_offset + 16] != octets {
                        out[span.rdata_offset..span.rdata_offset + 16].copy_from_slice(&octets);
                        changed = true;
                    }
                }
            }
            _ => {}
        }
    }

    Ok((out, changed))
}
