/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS wire-format codec.
//!
//! Parses queries and responses directly from RFC 1035 wire bytes,
//! synthesizes queries and responses, and exposes base64url helpers for the
//! RFC 8484 `dns=` parameter. Inputs are immutable slices; every produced
//! buffer is newly allocated.

mod decode;
mod encode;

pub use decode::{answer_spans, parse_query, parse_response, AnswerSpan};
pub use encode::{
    build_error_response, build_host_response, build_query, build_query_raw, rewrite_answer_ttls,
    rewrite_answer_addrs,
};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::fmt;

/// Fixed DNS header length.
pub const HEADER_LEN: usize = 12;

/// QR bit in the flags word.
pub const FLAG_QR: u16 = 0x8000;
/// Truncation bit.
pub const FLAG_TC: u16 = 0x0200;
/// Recursion desired.
pub const FLAG_RD: u16 = 0x0100;
/// Recursion available.
pub const FLAG_RA: u16 = 0x0080;
/// Authenticated data.
pub const FLAG_AD: u16 = 0x0020;
/// Checking disabled.
pub const FLAG_CD: u16 = 0x0010;

/// DNS response code (low 4 bits of the flags word).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rcode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    /// Codes 6..=15, carried through verbatim.
    Other(u8),
}

impl Rcode {
    pub fn to_u8(self) -> u8 {
        match self {
            Rcode::NoError => 0,
            Rcode::FormErr => 1,
            Rcode::ServFail => 2,
            Rcode::NxDomain => 3,
            Rcode::NotImp => 4,
            Rcode::Refused => 5,
            Rcode::Other(v) => v & 0x0F,
        }
    }

    pub fn from_u8(v: u8) -> Rcode {
        match v & 0x0F {
            0 => Rcode::NoError,
            1 => Rcode::FormErr,
            2 => Rcode::ServFail,
            3 => Rcode::NxDomain,
            4 => Rcode::NotImp,
            5 => Rcode::Refused,
            other => Rcode::Other(other),
        }
    }

    /// Parse a symbolic rcode name or a bare number.
    pub fn parse(raw: &str) -> Option<Rcode> {
        if let Ok(code) = raw.parse::<u8>() {
            return Some(Rcode::from_u8(code));
        }

        match raw.to_ascii_uppercase().as_str() {
            "NOERROR" => Some(Rcode::NoError),
            "FORMERR" => Some(Rcode::FormErr),
            "SERVFAIL" => Some(Rcode::ServFail),
            "NXDOMAIN" => Some(Rcode::NxDomain),
            "NOTIMP" => Some(Rcode::NotImp),
            "REFUSED" => Some(Rcode::Refused),
            _ => None,
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rcode::NoError => "NOERROR",
            Rcode::FormErr => "FORMERR",
            Rcode::ServFail => "SERVFAIL",
            Rcode::NxDomain => "NXDOMAIN",
            Rcode::NotImp => "NOTIMP",
            Rcode::Refused => "REFUSED",
            Rcode::Other(v) => return write!(f, "RCODE{}", v),
        };
        f.write_str(name)
    }
}

/// Record type numbers used by the codec's typed decoding.
pub mod rr_type {
    pub const A: u16 = 1;
    pub const NS: u16 = 2;
    pub const CNAME: u16 = 5;
    pub const PTR: u16 = 12;
    pub const MX: u16 = 15;
    pub const TXT: u16 = 16;
    pub const AAAA: u16 = 28;
}

/// Map a case-insensitive RR type name to its number. Unknown names fall
/// back to `A`, matching the JSON query form's behavior.
pub fn rr_type_from_name(raw: &str) -> u16 {
    if let Ok(num) = raw.parse::<u16>() {
        return num;
    }

    match raw.to_ascii_uppercase().as_str() {
        "A" => rr_type::A,
        "NS" => rr_type::NS,
        "CNAME" => rr_type::CNAME,
        "SOA" => 6,
        "PTR" => rr_type::PTR,
        "MX" => rr_type::MX,
        "TXT" => rr_type::TXT,
        "AAAA" => rr_type::AAAA,
        "SRV" => 33,
        "HTTPS" => 65,
        "ANY" => 255,
        _ => rr_type::A,
    }
}

/// Codec failure, carrying the rcode the failure surfaces as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Malformed query (bad header, truncated question, pointer in the
    /// question section).
    FormErr(String),
    /// Malformed response (short read, bad pointer chain).
    ServFail(String),
}

impl CodecError {
    pub fn rcode(&self) -> Rcode {
        match self {
            CodecError::FormErr(_) => Rcode::FormErr,
            CodecError::ServFail(_) => Rcode::ServFail,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::FormErr(msg) => write!(f, "malformed query: {}", msg),
            CodecError::ServFail(msg) => write!(f, "malformed response: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

/// A single parsed question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Normalized name: lowercase, no trailing dot.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A parsed DNS query. The original wire bytes are retained verbatim for
/// forwarding.
#[derive(Debug, Clone)]
pub struct Query {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub raw: Vec<u8>,
}

impl Query {
    /// First question, if any. DoH queries carry exactly one in practice.
    pub fn question(&self) -> Option<&Question> {
        self.questions.first()
    }
}

/// A decoded answer record. `data` is the display form per record type
/// (dotted quad, colon-hex, domain name, `"<pref> <exchange>"`, quoted TXT
/// segments, or `0x…` for unknown types).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub data: String,
}

/// A parsed DNS response.
#[derive(Debug, Clone)]
pub struct Response {
    pub id: u16,
    pub flags: u16,
    pub rcode: Rcode,
    pub questions: Vec<Question>,
    pub answers: Vec<Answer>,
}

/// RFC 4648 §5 base64url without padding.
pub fn base64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode base64url, tolerating padded input.
pub fn base64url_decode(raw: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(raw.trim_end_matches('=')).ok()
}
