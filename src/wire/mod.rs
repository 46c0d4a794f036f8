// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Wire format: the 8-byte frame header (§4.4, §6) plus the frame-type,
//! attribute-tag and status-code vocabularies (§6).

pub mod attr;

use byteorder::{BigEndian, ByteOrder};

/// Size of the fixed frame header: version, type, seq, peer.
pub const HEADER_LEN: usize = 8;

/// Size of the big-endian `u32` body-length prefix that immediately follows
/// the header (§4.4: "immediately followed by a length-prefixed attribute
/// payload").
pub const LEN_PREFIX_LEN: usize = 4;

/// Bytes read before the variable-length body is known: header + length
/// prefix. A connection's phase-1 read fills exactly this many bytes.
pub const PREFIX_LEN: usize = HEADER_LEN + LEN_PREFIX_LEN;

/// Hard ceiling on a frame's attribute payload, independent of whatever a
/// particular deployment configures for `Router::max_body_len` (§4.4).
pub const MAX_BODY_LEN: usize = 4 * 1024 * 1024;

pub fn encode_body_len(out: &mut [u8; LEN_PREFIX_LEN], len: u32) {
    BigEndian::write_u32(out, len);
}

pub fn decode_body_len(buf: &[u8; LEN_PREFIX_LEN]) -> u32 {
    BigEndian::read_u32(buf)
}

/// A header is structurally valid the moment 8 bytes have arrived — the
/// type byte doesn't have to name a recognized [`FrameType`]. Connections
/// decode unconditionally; it's the router's job (§4.5 step 2) to look up a
/// handler for `raw_type` and reply `INVALID_COMMAND` if there isn't one,
/// using the `seq`/`peer` decoded right here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub raw_type: u8,
    pub seq: u16,
    pub peer: u32,
}

impl Header {
    pub fn new(msg_type: FrameType, seq: u16, peer: u32) -> Header {
        Header { version: 0, raw_type: msg_type.as_u8(), seq, peer }
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.raw_type)
    }

    pub fn encode(&self, out: &mut [u8; HEADER_LEN]) {
        out[0] = self.version;
        out[1] = self.raw_type;
        BigEndian::write_u16(&mut out[2..4], self.seq);
        BigEndian::write_u32(&mut out[4..8], self.peer);
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Header {
        Header {
            version: buf[0],
            raw_type: buf[1],
            seq: BigEndian::read_u16(&buf[2..4]),
            peer: BigEndian::read_u32(&buf[4..8]),
        }
    }
}

macro_rules! frame_types {
    ($($variant:ident = $value:expr),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum FrameType {
            $($variant),*
        }

        impl FrameType {
            pub fn as_u8(self) -> u8 {
                match self {
                    $(FrameType::$variant => $value),*
                }
            }

            pub fn from_u8(v: u8) -> Option<FrameType> {
                match v {
                    $($value => Some(FrameType::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

frame_types! {
    Hello = 0,
    Status = 1,
    Data = 2,
    Ping = 3,
    Lookup = 4,
    AddObject = 5,
    RemoveObject = 6,
    Invoke = 7,
    Notify = 8,
    Subscribe = 9,
    Unsubscribe = 10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    InvalidCommand = 1,
    InvalidArgument = 2,
    NotFound = 3,
    PermissionDenied = 4,
    Timeout = 5,
    NoData = 6,
    UnknownError = 7,
}

impl StatusCode {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Attribute tags, addressed within the per-frame-type schema (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum AttrTag {
    Signature = 1,
    ObjType = 2,
    ObjPath = 3,
    ObjId = 4,
    Status = 5,
    Method = 6,
    Data = 7,
    Target = 8,
    NoReply = 9,
}

impl AttrTag {
    pub fn tag(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = Header::new(FrameType::Invoke, 42, 7);
        let mut buf = [0u8; HEADER_LEN];
        h.encode(&mut buf);
        let decoded = Header::decode(&buf);
        assert_eq!(h, decoded);
        assert_eq!(Some(FrameType::Invoke), decoded.frame_type());
    }

    #[test]
    fn unknown_frame_type_is_still_a_valid_header() {
        let mut buf = [0u8; HEADER_LEN];
        buf[1] = 250;
        BigEndian::write_u16(&mut buf[2..4], 7);
        let decoded = Header::decode(&buf);
        assert_eq!(None, decoded.frame_type());
        assert_eq!(7, decoded.seq);
    }
}
