// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Self-describing TLV attribute tree (§6): every frame body is a table of
//! `(tag, value)` pairs, values can nest tables and arrays. Tag 0 is used
//! for array elements, which carry no meaningful tag of their own.

use std::collections::BTreeMap;
use std::io;

use byteorder::{BigEndian, ByteOrder};

use super::AttrTag;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    U32(u32),
    Str(String),
    /// Opaque bytes. One of the shapes an application DATA payload can take
    /// (§4.5: DATA is "nested" but meaningless to us) — the broker forwards
    /// it verbatim regardless of whether the sender used raw bytes, a table
    /// or an array.
    Raw(Vec<u8>),
    Array(Vec<Value>),
    Table(Vec<(u32, Value)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    U8 = 0,
    U32 = 1,
    Str = 2,
    Raw = 3,
    Array = 4,
    Table = 5,
}

impl Kind {
    fn from_u8(v: u8) -> Option<Kind> {
        match v {
            0 => Some(Kind::U8),
            1 => Some(Kind::U32),
            2 => Some(Kind::Str),
            3 => Some(Kind::Raw),
            4 => Some(Kind::Array),
            5 => Some(Kind::Table),
            _ => None,
        }
    }
}

impl Value {
    fn kind(&self) -> Kind {
        match self {
            Value::U8(_) => Kind::U8,
            Value::U32(_) => Kind::U32,
            Value::Str(_) => Kind::Str,
            Value::Raw(_) => Kind::Raw,
            Value::Array(_) => Kind::Array,
            Value::Table(_) => Kind::Table,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Value::U8(v) => out.push(*v),
            Value::U32(v) => {
                let mut buf = [0u8; 4];
                BigEndian::write_u32(&mut buf, *v);
                out.extend_from_slice(&buf);
            }
            Value::Str(s) => out.extend_from_slice(s.as_bytes()),
            Value::Raw(bytes) => out.extend_from_slice(bytes),
            Value::Array(items) => {
                for item in items {
                    encode_entry(out, 0, item);
                }
            }
            Value::Table(entries) => {
                for (tag, v) in entries {
                    encode_entry(out, *tag, v);
                }
            }
        }
    }

    fn decode_payload(kind: Kind, payload: &[u8]) -> io::Result<Value> {
        match kind {
            Kind::U8 => {
                if payload.len() != 1 {
                    return Err(corrupt("u8 attribute with wrong length"));
                }
                Ok(Value::U8(payload[0]))
            }
            Kind::U32 => {
                if payload.len() != 4 {
                    return Err(corrupt("u32 attribute with wrong length"));
                }
                Ok(Value::U32(BigEndian::read_u32(payload)))
            }
            Kind::Str => String::from_utf8(payload.to_vec())
                .map(Value::Str)
                .map_err(|_| corrupt("string attribute is not valid utf-8")),
            Kind::Raw => Ok(Value::Raw(payload.to_vec())),
            Kind::Array => {
                let entries = decode_entries(payload)?;
                Ok(Value::Array(entries.into_iter().map(|(_, v)| v).collect()))
            }
            Kind::Table => Ok(Value::Table(decode_entries(payload)?)),
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Value::U8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&[(u32, Value)]> {
        match self {
            Value::Table(entries) => Some(entries.as_slice()),
            _ => None,
        }
    }
}

fn corrupt(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

const ENTRY_HEADER_LEN: usize = 4 + 1 + 4; // tag, kind, len

fn encode_entry(out: &mut Vec<u8>, tag: u32, value: &Value) {
    let mut payload = Vec::new();
    value.encode_payload(&mut payload);

    let mut header = [0u8; ENTRY_HEADER_LEN];
    BigEndian::write_u32(&mut header[0..4], tag);
    header[4] = value.kind() as u8;
    BigEndian::write_u32(&mut header[5..9], payload.len() as u32);

    out.extend_from_slice(&header);
    out.extend_from_slice(&payload);
}

fn decode_entries(mut buf: &[u8]) -> io::Result<Vec<(u32, Value)>> {
    let mut entries = Vec::new();

    while !buf.is_empty() {
        if buf.len() < ENTRY_HEADER_LEN {
            return Err(corrupt("truncated attribute header"));
        }

        let tag = BigEndian::read_u32(&buf[0..4]);
        let kind = Kind::from_u8(buf[4]).ok_or_else(|| corrupt("unknown attribute kind"))?;
        let len = BigEndian::read_u32(&buf[5..9]) as usize;

        buf = &buf[ENTRY_HEADER_LEN..];
        if buf.len() < len {
            return Err(corrupt("truncated attribute payload"));
        }

        let value = Value::decode_payload(kind, &buf[..len])?;
        entries.push((tag, value));
        buf = &buf[len..];
    }

    Ok(entries)
}

/// A decoded frame body: the attributes the broker recognizes, keyed by tag.
/// Unknown tags and tags whose wire kind doesn't match what the tag is
/// declared to carry are dropped during decode (§4.5 point 4) rather than
/// failing the whole frame.
#[derive(Debug, Clone, Default)]
pub struct AttrSet {
    values: BTreeMap<u32, Value>,
}

impl AttrSet {
    pub fn new() -> AttrSet {
        AttrSet { values: BTreeMap::new() }
    }

    pub fn get(&self, tag: AttrTag) -> Option<&Value> {
        self.values.get(&tag.tag())
    }

    pub fn decode(body: &[u8]) -> io::Result<AttrSet> {
        let entries = decode_entries(body)?;
        let mut values = BTreeMap::new();

        for (tag, value) in entries {
            // DATA is the one tag the broker never interprets (§6:
            // "DATA(nested)") — it forwards whatever shape the sender used
            // (raw bytes, a table, an array) verbatim, so it is exempt from
            // the per-tag kind check every other attribute goes through.
            let accepted = tag == AttrTag::Data.tag() || expected_kind(tag) == Some(value.kind());
            if accepted {
                values.insert(tag, value);
            }
            // else: unknown tag, or known tag with the wrong wire kind —
            // silently dropped, the frame is still well-formed.
        }

        Ok(AttrSet { values })
    }
}

/// Builds a frame body by encoding `entries` as a top-level attribute table.
pub struct Builder {
    entries: Vec<(u32, Value)>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder { entries: Vec::new() }
    }

    pub fn put(mut self, tag: AttrTag, value: Value) -> Builder {
        self.entries.push((tag.tag(), value));
        self
    }

    pub fn put_raw(mut self, tag: u32, value: Value) -> Builder {
        self.entries.push((tag, value));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        for (tag, value) in &self.entries {
            encode_entry(&mut out, *tag, value);
        }
        out
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

fn expected_kind(tag: u32) -> Option<Kind> {
    if tag == AttrTag::Signature.tag() {
        Some(Kind::Array)
    } else if tag == AttrTag::ObjType.tag() {
        Some(Kind::U32)
    } else if tag == AttrTag::ObjPath.tag() {
        Some(Kind::Str)
    } else if tag == AttrTag::ObjId.tag() {
        Some(Kind::U32)
    } else if tag == AttrTag::Status.tag() {
        Some(Kind::U32)
    } else if tag == AttrTag::Method.tag() {
        Some(Kind::Str)
    } else if tag == AttrTag::Target.tag() {
        Some(Kind::U32)
    } else if tag == AttrTag::NoReply.tag() {
        Some(Kind::U8)
    } else {
        None
    }
}
