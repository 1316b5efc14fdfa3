/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Wire-format decoding.
//!
//! Query parsing rejects compression pointers in the question section as
//! FORMERR; queries never use compression in practice and the buffers this
//! crate synthesizes do not either. Response parsing honors backward
//! pointers for answer names and for the name-shaped RDATA of
//! CNAME/NS/PTR and the MX exchange field.

use super::{
    rr_type, Answer, CodecError, Query, Question, Rcode, Response, HEADER_LEN,
};
use std::net::{Ipv4Addr, Ipv6Addr};

const MAX_LABEL_LEN: u8 = 63;
// Upper bound on pointer hops while decoding one name; a valid message
// never chains anywhere near this deep.
const MAX_POINTER_HOPS: usize = 32;

type DecodeResult<T> = std::result::Result<T, CodecError>;

#[inline]
fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let hi = *bytes.get(offset)?;
    let lo = *bytes.get(offset + 1)?;
    Some(u16::from_be_bytes([hi, lo]))
}

#[inline]
fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let chunk = bytes.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

/// Parse a query message.
///
/// Header fields sit at fixed offsets; `qdcount` questions follow. Any
/// truncation or a compression pointer inside a question name yields
/// `FormErr`.
pub fn parse_query(bytes: &[u8]) -> DecodeResult<Query> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::FormErr(format!(
            "message too short: {} bytes",
            bytes.len()
        )));
    }

    let id = u16::from_be_bytes([bytes[0], bytes[1]]);
    let flags = u16::from_be_bytes([bytes[2], bytes[3]]);
    let qdcount = u16::from_be_bytes([bytes[4], bytes[5]]);

    let mut offset = HEADER_LEN;
    let mut questions = Vec::with_capacity(qdcount as usize);
    for _ in 0..qdcount {
        let (name, next) = read_uncompressed_name(bytes, offset)?;
        let qtype = read_u16(bytes, next)
            .ok_or_else(|| CodecError::FormErr("truncated question type".into()))?;
        let qclass = read_u16(bytes, next + 2)
            .ok_or_else(|| CodecError::FormErr("truncated question class".into()))?;
        offset = next + 4;

        questions.push(Question {
            name,
            qtype,
            qclass,
        });
    }

    Ok(Query {
        id,
        flags,
        questions,
        raw: bytes.to_vec(),
    })
}

/// Parse a response message.
///
/// Bounds are strictly checked; any short read yields `ServFail`. Answer
/// names may point backward into the question section.
pub fn parse_response(bytes: &[u8]) -> DecodeResult<Response> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::ServFail(format!(
            "message too short: {} bytes",
            bytes.len()
        )));
    }

    let id = u16::from_be_bytes([bytes[0], bytes[1]]);
    let flags = u16::from_be_bytes([bytes[2], bytes[3]]);
    let qdcount = u16::from_be_bytes([bytes[4], bytes[5]]);
    let ancount = u16::from_be_bytes([bytes[6], bytes[7]]);

    let mut offset = HEADER_LEN;
    let mut questions = Vec::with_capacity(qdcount as usize);
    for _ in 0..qdcount {
        let (name, next) = read_name(bytes, offset).map_err(servfail)?;
        let qtype = read_u16(bytes, next)
            .ok_or_else(|| CodecError::ServFail("truncated question type".into()))?;
        let qclass = read_u16(bytes, next + 2)
            .ok_or_else(|| CodecError::ServFail("truncated question class".into()))?;
        offset = next + 4;

        questions.push(Question {
            name,
            qtype,
            qclass,
        });
    }

    let mut answers = Vec::with_capacity(ancount as usize);
    for _ in 0..ancount {
        let (record, next) = read_answer(bytes, offset)?;
        answers.push(record);
        offset = next;
    }

    Ok(Response {
        id,
        flags,
        rcode: Rcode::from_u8((flags & 0x000F) as u8),
        questions,
        answers,
    })
}

/// Offset/length view of one answer record in a raw response buffer.
///
/// Used for in-place TTL and address rewrites on a cloned buffer; RDATA is
/// located by the declared RDLENGTH and never traversed further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerSpan {
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    /// Offset of the 4-byte TTL field.
    pub ttl_offset: usize,
    /// Offset of the RDATA bytes.
    pub rdata_offset: usize,
    pub rdata_len: usize,
}

/// Scan the answer section of a response, returning one span per record.
pub fn answer_spans(bytes: &[u8]) -> DecodeResult<Vec<AnswerSpan>> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::ServFail(format!(
            "message too short: {} bytes",
            bytes.len()
        )));
    }

    let qdcount = u16::from_be_bytes([bytes[4], bytes[5]]);
    let ancount = u16::from_be_bytes([bytes[6], bytes[7]]);

    let mut offset = HEADER_LEN;
    for _ in 0..qdcount {
        offset = skip_name(bytes, offset).map_err(servfail)? + 4;
    }

    let mut spans = Vec::with_capacity(ancount as usize);
    for _ in 0..ancount {
        let name_end = skip_name(bytes, offset).map_err(servfail)?;
        let rtype = read_u16(bytes, name_end)
            .ok_or_else(|| CodecError::ServFail("truncated record type".into()))?;
        let rclass = read_u16(bytes, name_end + 2)
            .ok_or_else(|| CodecError::ServFail("truncated record class".into()))?;
        let ttl = read_u32(bytes, name_end + 4)
            .ok_or_else(|| CodecError::ServFail("truncated record ttl".into()))?;
        let rdlength = read_u16(bytes, name_end + 8)
            .ok_or_else(|| CodecError::ServFail("truncated rdlength".into()))?
            as usize;
        let rdata_offset = name_end + 10;
        if bytes.len() < rdata_offset + rdlength {
            return Err(CodecError::ServFail("truncated rdata".into()));
        }

        spans.push(AnswerSpan {
            rtype,
            rclass,
            ttl,
            ttl_offset: name_end + 4,
            rdata_offset,
            rdata_len: rdlength,
        });
        offset = rdata_offset + rdlength;
    }

    Ok(spans)
}

fn read_answer(bytes: &[u8], offset: usize) -> DecodeResult<(Answer, usize)> {
    let (name, next) = read_name(bytes, offset).map_err(servfail)?;
    let rtype = read_u16(bytes, next)
        .ok_or_else(|| CodecError::ServFail("truncated record type".into()))?;
    let rclass = read_u16(bytes, next + 2)
        .ok_or_else(|| CodecError::ServFail("truncated record class".into()))?;
    let ttl = read_u32(bytes, next + 4)
        .ok_or_else(|| CodecError::ServFail("truncated record ttl".into()))?;
    let rdlength = read_u16(bytes, next + 8)
        .ok_or_else(|| CodecError::ServFail("truncated rdlength".into()))? as usize;
    let rdata_offset = next + 10;
    let rdata = bytes
        .get(rdata_offset..rdata_offset + rdlength)
        .ok_or_else(|| CodecError::ServFail("truncated rdata".into()))?;

    let data = decode_rdata(bytes, rdata_offset, rdata, rtype)?;

    Ok((
        Answer {
            name,
            rtype,
            rclass,
            ttl,
            data,
        },
        rdata_offset + rdlength,
    ))
}

/// Decode RDATA to its display form per record type.
fn decode_rdata(
    message: &[u8],
    rdata_offset: usize,
    rdata: &[u8],
    rtype: u16,
) -> DecodeResult<String> {
    match rtype {
        rr_type::A => {
            if rdata.len() != 4 {
                return Err(CodecError::ServFail(format!(
                    "A record rdata length {}",
                    rdata.len()
                )));
            }
            Ok(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string())
        }
        rr_type::AAAA => {
            if rdata.len() != 16 {
                return Err(CodecError::ServFail(format!(
                    "AAAA record rdata length {}",
                    rdata.len()
                )));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            Ok(Ipv6Addr::from(octets).to_string())
        }
        rr_type::CNAME | rr_type::NS | rr_type::PTR => {
            let (name, _) = read_name(message, rdata_offset).map_err(servfail)?;
            Ok(name)
        }
        rr_type::MX => {
            if rdata.len() < 2 {
                return Err(CodecError::ServFail("MX record too short".into()));
            }
            let preference = u16::from_be_bytes([rdata[0], rdata[1]]);
            let (exchange, _) = read_name(message, rdata_offset + 2).map_err(servfail)?;
            Ok(format!("{} {}", preference, exchange))
        }
        rr_type::TXT => {
            let mut out = String::new();
            let mut pos = 0usize;
            while pos < rdata.len() {
                let len = rdata[pos] as usize;
                pos += 1;
                let segment = rdata
                    .get(pos..pos + len)
                    .ok_or_else(|| CodecError::ServFail("truncated TXT segment".into()))?;
                out.push('"');
                out.push_str(&String::from_utf8_lossy(segment));
                out.push('"');
                pos += len;
            }
            Ok(out)
        }
        _ => {
            let mut out = String::with_capacity(2 + rdata.len() * 2);
            out.push_str("0x");
            for b in rdata {
                out.push_str(&format!("{:02x}", b));
            }
            Ok(out)
        }
    }
}

/// Read a name that must not contain compression pointers (question
/// sections of queries).
fn read_uncompressed_name(bytes: &[u8], start: usize) -> DecodeResult<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;

    loop {
        let len = *bytes
            .get(pos)
            .ok_or_else(|| CodecError::FormErr("truncated name".into()))?;

        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            return Err(CodecError::FormErr(
                "compression pointer in question section".into(),
            ));
        }
        if len > MAX_LABEL_LEN {
            return Err(CodecError::FormErr(format!("label length {}", len)));
        }

        let label = bytes
            .get(pos + 1..pos + 1 + len as usize)
            .ok_or_else(|| CodecError::FormErr("truncated label".into()))?;
        labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
        pos += 1 + len as usize;
    }

    Ok((labels.join("."), pos))
}

/// Read a possibly-compressed name. Returns the normalized name and the
/// offset just past the name's in-place representation.
fn read_name(bytes: &[u8], start: usize) -> std::result::Result<(String, usize), String> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut end_after: Option<usize> = None;
    let mut hops = 0usize;

    loop {
        let len = *bytes.get(pos).ok_or("truncated name")?;

        if len == 0 {
            pos += 1;
            break;
        }

        if len & 0xC0 == 0xC0 {
            let second = *bytes.get(pos + 1).ok_or("truncated pointer")?;
            let target = (((len & 0x3F) as usize) << 8) | second as usize;
            if end_after.is_none() {
                end_after = Some(pos + 2);
            }
            if target >= pos {
                return Err("forward compression pointer".into());
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err("compression pointer loop".into());
            }
            pos = target;
            continue;
        }

        if len > MAX_LABEL_LEN {
            return Err(format!("label length {}", len));
        }

        let label = bytes
            .get(pos + 1..pos + 1 + len as usize)
            .ok_or("truncated label")?;
        labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
        pos += 1 + len as usize;
    }

    Ok((labels.join("."), end_after.unwrap_or(pos)))
}

/// Skip over a name without decoding it.
fn skip_name(bytes: &[u8], start: usize) -> std::result::Result<usize, String> {
    let mut pos = start;
    loop {
        let len = *bytes.get(pos).ok_or("truncated name")?;
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            if bytes.get(pos + 1).is_none() {
                return Err("truncated pointer".into());
            }
            return Ok(pos + 2);
        }
        if len > MAX_LABEL_LEN {
            return Err(format!("label length {}", len));
        }
        pos += 1 + len as usize;
        if pos > bytes.len() {
            return Err("truncated label".into());
        }
    }
}

#[inline]
fn servfail(msg: String) -> CodecError {
    CodecError::ServFail(msg)
}
