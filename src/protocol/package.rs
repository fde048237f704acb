// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire framing: a fixed binary header followed by a JSON-encoded body.
//!
//! Layout: `total: u32 | pid: u16 | tp: u8 | partid: u32`, big-endian,
//! followed by `total - HEADER_SIZE` bytes of JSON.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;

/// High bit of the type byte: set on responses to a request.
pub const RESPONSE_BIT: u8 = 0x80;

/// Announce this probe to the agentcore; request/response.
pub const REQ_ANNOUNCE: u8 = 1;
/// Fire-and-forget check result.
pub const FAF_DUMP: u8 = 2;
/// Push: replace the whole desired assignment set.
pub const PUSH_SET_ASSETS: u8 = 3;
/// Push: replace assignments for one asset.
pub const PUSH_UPSERT_ASSET: u8 = 4;
/// Push: drop assignments for the given assets.
pub const PUSH_UNSET_ASSETS: u8 = 5;

const KNOWN_TYPES: [u8; 5] =
    [REQ_ANNOUNCE, FAF_DUMP, PUSH_SET_ASSETS, PUSH_UPSERT_ASSET, PUSH_UNSET_ASSETS];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported package type: {0}")]
    UnknownType(u8),
    #[error("failed to decode package body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A fully formed message, ready to serialize or just decoded from the wire.
#[derive(Debug, Clone)]
pub struct Package {
    pub pid: u16,
    pub tp: u8,
    pub partid: u32,
    pub data: Value,
}

impl Package {
    /// Size of the fixed binary header, in bytes.
    pub const HEADER_SIZE: usize = 4 + 2 + 1 + 4;

    /// Builds an outgoing package with `pid = 0`; callers that expect a
    /// response assign a fresh `pid` before transmission.
    pub fn make(tp: u8, partid: u32, data: Value) -> Self {
        Self { pid: 0, tp, partid, data }
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        let body = serde_json::to_vec(&self.data)?;
        let total = Self::HEADER_SIZE + body.len();

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(total as u32);
        buf.put_u16(self.pid);
        buf.put_u8(self.tp);
        buf.put_u32(self.partid);
        buf.put_slice(&body);

        Ok(buf.freeze())
    }

    /// Reads the fixed header from the front of `buf`. Returns `None` if
    /// `buf` is shorter than [`Package::HEADER_SIZE`].
    pub fn parse_header(buf: &[u8]) -> Option<(usize, PartialPackage)> {
        if buf.len() < Self::HEADER_SIZE {
            return None;
        }

        let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let pid = u16::from_be_bytes([buf[4], buf[5]]);
        let tp = buf[6];
        let partid = u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]);

        Some((total, PartialPackage { total, pid, tp, partid }))
    }
}

/// A package whose header has been parsed but whose body has not yet been
/// decoded (the receive buffer may not hold the full body yet).
#[derive(Debug, Clone, Copy)]
pub struct PartialPackage {
    pub total: usize,
    pub pid: u16,
    pub tp: u8,
    pub partid: u32,
}

impl PartialPackage {
    pub fn is_response(&self) -> bool {
        self.tp & RESPONSE_BIT != 0
    }

    /// The type code with the response bit masked off.
    pub fn base_type(&self) -> u8 {
        self.tp & !RESPONSE_BIT
    }

    /// Decodes the JSON body from `buf`, which must hold exactly
    /// `self.total` bytes (header included).
    pub fn extract_body(&self, buf: &[u8]) -> Result<Value, ExtractError> {
        if !KNOWN_TYPES.contains(&self.base_type()) {
            return Err(ExtractError::UnknownType(self.tp));
        }
        let body = &buf[Package::HEADER_SIZE..self.total];
        let value = serde_json::from_slice(body)?;
        Ok(value)
    }

    pub fn into_package(self, data: Value) -> Package {
        Package { pid: self.pid, tp: self.tp, partid: self.partid, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let pkg = Package { pid: 42, tp: REQ_ANNOUNCE, partid: 7, data: serde_json::json!(["a", "b"]) };
        let bytes = pkg.to_bytes().expect("encode");

        let (total, partial) = Package::parse_header(&bytes).expect("header");
        assert_eq!(total, bytes.len());
        assert_eq!(partial.pid, 42);
        assert_eq!(partial.tp, REQ_ANNOUNCE);
        assert_eq!(partial.partid, 7);
        assert!(!partial.is_response());

        let data = partial.extract_body(&bytes).expect("body");
        assert_eq!(data, serde_json::json!(["a", "b"]));
    }

    #[test]
    fn response_bit_roundtrips() {
        let pkg = Package::make(REQ_ANNOUNCE | RESPONSE_BIT, 0, serde_json::json!({}));
        let bytes = pkg.to_bytes().expect("encode");
        let (_, partial) = Package::parse_header(&bytes).expect("header");
        assert!(partial.is_response());
        assert_eq!(partial.base_type(), REQ_ANNOUNCE);
    }

    #[test]
    fn unknown_type_rejected() {
        let pkg = Package::make(0xF0, 0, serde_json::json!(null));
        let bytes = pkg.to_bytes().expect("encode");
        let (_, partial) = Package::parse_header(&bytes).expect("header");
        assert!(matches!(partial.extract_body(&bytes), Err(ExtractError::UnknownType(_))));
    }

    #[test]
    fn short_buffer_has_no_header() {
        assert!(Package::parse_header(&[0u8; 3]).is_none());
    }
}
