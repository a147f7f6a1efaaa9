//! RADIUS Packet Inspection
//!
//! Zero-copy view over the UDP payload of a RADIUS message (RFC 2865
//! framing). Parses the fixed header and walks the attribute TLV stream;
//! attribute semantics beyond what the forwarding decision needs are left
//! alone.

use crate::error::RelayError;

/// Fixed RADIUS header length: code, identifier, length, authenticator
pub const HEADER_LEN: usize = 20;

/// RADIUS packet type code (RFC 2865/2866/5176).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Code(pub u8);

impl Code {
    pub const ACCESS_REQUEST: Self = Self(1);
    pub const ACCESS_ACCEPT: Self = Self(2);
    pub const ACCESS_REJECT: Self = Self(3);
    pub const ACCOUNTING_REQUEST: Self = Self(4);
    pub const ACCOUNTING_RESPONSE: Self = Self(5);
    pub const ACCESS_CHALLENGE: Self = Self(11);
    pub const STATUS_SERVER: Self = Self(12);
    pub const STATUS_CLIENT: Self = Self(13);
    pub const DISCONNECT_REQUEST: Self = Self(40);
    pub const DISCONNECT_ACK: Self = Self(41);
    pub const DISCONNECT_NAK: Self = Self(42);
    pub const COA_REQUEST: Self = Self(43);
    pub const COA_ACK: Self = Self(44);
    pub const COA_NAK: Self = Self(45);
}

/// RADIUS attribute type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrType(pub u8);

impl AttrType {
    pub const USER_NAME: Self = Self(1);
    pub const NAS_IP_ADDRESS: Self = Self(4);
    pub const NAS_PORT: Self = Self(5);
    pub const STATE: Self = Self(24);
}

/// Zero-copy view over one RADIUS message.
///
/// Transient: lives only as long as the backing payload slice.
#[derive(Debug)]
pub struct Packet<'a> {
    pub code: Code,
    pub identifier: u8,
    /// Request authenticator, 16 bytes
    pub authenticator: &'a [u8],
    attrs: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Parse the fixed header of a RADIUS message.
    ///
    /// Fails if the payload is shorter than [`HEADER_LEN`] or the embedded
    /// length field does not match the payload length.
    pub fn parse(payload: &'a [u8]) -> Result<Self, RelayError> {
        if payload.len() < HEADER_LEN {
            return Err(RelayError::TruncatedPacket);
        }
        let length = u16::from_be_bytes([payload[2], payload[3]]) as usize;
        if length != payload.len() {
            return Err(RelayError::LengthMismatch {
                field: length,
                actual: payload.len(),
            });
        }
        Ok(Self {
            code: Code(payload[0]),
            identifier: payload[1],
            authenticator: &payload[4..20],
            attrs: &payload[20..],
        })
    }

    /// Iterate the attribute TLV stream as `(type, value)` pairs.
    pub fn attributes(&self) -> Attributes<'a> {
        Attributes { cursor: self.attrs }
    }
}

/// Iterator over the attributes of a [`Packet`].
///
/// A malformed trailer (length byte below 2 or past the end of the cursor)
/// silently ends iteration; the relay never rejects a packet for it.
pub struct Attributes<'a> {
    cursor: &'a [u8],
}

impl<'a> Iterator for Attributes<'a> {
    type Item = (AttrType, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.len() < 2 {
            return None;
        }
        let length = self.cursor[1] as usize;
        if length < 2 || length > self.cursor.len() {
            return None;
        }
        let (attr, rest) = self.cursor.split_at(length);
        self.cursor = rest;
        Some((AttrType(attr[0]), &attr[2..]))
    }
}

/// Assemble a RADIUS message with a correct length field.
#[cfg(test)]
pub(crate) fn build_packet(code: u8, attrs: &[(u8, &[u8])]) -> Vec<u8> {
    let mut buf = vec![code, 0x42];
    buf.extend_from_slice(&[0, 0]); // length, patched below
    buf.extend_from_slice(&[0xaa; 16]); // authenticator
    for (t, v) in attrs {
        buf.push(*t);
        buf.push((v.len() + 2) as u8);
        buf.extend_from_slice(v);
    }
    let len = buf.len() as u16;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
    buf
}
