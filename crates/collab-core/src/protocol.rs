//! Wire codec (C1) — lib0-style variable-length framing.
//!
//! Every message on the wire is an outer envelope (document name, message
//! kind, payload) followed, for `Sync` messages, by an inner sync-subtype
//! payload, compatible with the Hocuspocus wire format.

use crate::error::CodecError;

/// Message kind byte, first field of every envelope.
pub mod kind {
    pub const SYNC: u8 = 0;
    pub const AWARENESS: u8 = 1;
    pub const AUTH: u8 = 2;
    pub const QUERY_AWARENESS: u8 = 3;
    pub const STATELESS: u8 = 4;
    pub const BROADCAST_STATELESS: u8 = 5;
}

/// Sync message subtype byte, first field of a `Sync` envelope's payload.
pub mod sync_type {
    pub const STEP1: u8 = 0;
    pub const STEP2: u8 = 1;
    pub const UPDATE: u8 = 2;
}

/// lib0 variable-length unsigned integer: 7 bits per byte, little-endian,
/// high bit set on every byte but the last.
pub fn write_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Reads a lib0 uvarint, returning the value and the number of bytes consumed.
pub fn read_uvarint(bytes: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(CodecError::MalformedFrame);
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(CodecError::MalformedFrame)
}

fn write_buf(out: &mut Vec<u8>, buf: &[u8]) {
    write_uvarint(out, buf.len() as u64);
    out.extend_from_slice(buf);
}

fn read_buf<'a>(bytes: &'a [u8], max_size: usize) -> Result<(&'a [u8], usize), CodecError> {
    let (len, header_len) = read_uvarint(bytes)?;
    let len = len as usize;
    if len > max_size {
        return Err(CodecError::FrameTooLarge(len));
    }
    let end = header_len.checked_add(len).ok_or(CodecError::MalformedFrame)?;
    let buf = bytes.get(header_len..end).ok_or(CodecError::MalformedFrame)?;
    Ok((buf, end))
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_buf(out, s.as_bytes());
}

fn read_str<'a>(bytes: &'a [u8], max_size: usize) -> Result<(&'a str, usize), CodecError> {
    let (buf, consumed) = read_buf(bytes, max_size)?;
    let s = std::str::from_utf8(buf).map_err(|_| CodecError::MalformedFrame)?;
    Ok((s, consumed))
}

/// An outer envelope: which document, what kind of message, and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub doc_name: String,
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.doc_name.len() + self.payload.len() + 8);
        write_str(&mut out, &self.doc_name);
        out.push(self.kind);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8], max_frame_size: usize) -> Result<Self, CodecError> {
        if bytes.len() > max_frame_size {
            return Err(CodecError::FrameTooLarge(bytes.len()));
        }
        let (doc_name, consumed) = read_str(bytes, max_frame_size)?;
        let rest = &bytes[consumed..];
        let &kind = rest.first().ok_or(CodecError::MalformedFrame)?;
        let payload = rest[1..].to_vec();
        Ok(Envelope {
            doc_name: doc_name.to_string(),
            kind,
            payload,
        })
    }
}

/// The inner payload of a `Sync`-kind envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPayload {
    Step1 { state_vector: Vec<u8> },
    Step2 { update: Vec<u8> },
    Update { update: Vec<u8> },
}

impl SyncPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            SyncPayload::Step1 { state_vector } => {
                out.push(sync_type::STEP1);
                write_buf(&mut out, state_vector);
            }
            SyncPayload::Step2 { update } => {
                out.push(sync_type::STEP2);
                write_buf(&mut out, update);
            }
            SyncPayload::Update { update } => {
                out.push(sync_type::UPDATE);
                write_buf(&mut out, update);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8], max_frame_size: usize) -> Result<Self, CodecError> {
        let &subtype = bytes.first().ok_or(CodecError::MalformedFrame)?;
        let (buf, _) = read_buf(&bytes[1..], max_frame_size)?;
        match subtype {
            sync_type::STEP1 => Ok(SyncPayload::Step1 {
                state_vector: buf.to_vec(),
            }),
            sync_type::STEP2 => Ok(SyncPayload::Step2 { update: buf.to_vec() }),
            sync_type::UPDATE => Ok(SyncPayload::Update { update: buf.to_vec() }),
            other => Err(CodecError::UnknownMessageKind(other)),
        }
    }
}

/// One entry in an awareness payload: a client's latest state, or a
/// tombstone (`payload: None`) marking it removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u32,
    pub payload: Option<Vec<u8>>,
}

/// Encodes a list of awareness entries as the inner payload of an
/// `Awareness`-kind envelope.
pub fn encode_awareness(entries: &[AwarenessEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    write_uvarint(&mut out, entries.len() as u64);
    for entry in entries {
        write_uvarint(&mut out, entry.client_id);
        write_uvarint(&mut out, entry.clock as u64);
        match &entry.payload {
            Some(payload) => write_buf(&mut out, payload),
            None => write_uvarint(&mut out, 0),
        }
    }
    out
}

pub fn decode_awareness(bytes: &[u8], max_frame_size: usize) -> Result<Vec<AwarenessEntry>, CodecError> {
    let mut offset = 0;
    let (count, consumed) = read_uvarint(&bytes[offset..])?;
    offset += consumed;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (client_id, c1) = read_uvarint(&bytes[offset..])?;
        offset += c1;
        let (clock, c2) = read_uvarint(&bytes[offset..])?;
        offset += c2;
        let (buf, c3) = read_buf(&bytes[offset..], max_frame_size)?;
        let payload = if buf.is_empty() { None } else { Some(buf.to_vec()) };
        offset += c3;
        entries.push(AwarenessEntry {
            client_id,
            clock: clock as u32,
            payload,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uvarint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64] {
            let mut buf = Vec::new();
            write_uvarint(&mut buf, value);
            let (decoded, consumed) = read_uvarint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn envelope_round_trip() {
        let env = Envelope {
            doc_name: "room-1".to_string(),
            kind: kind::SYNC,
            payload: vec![9, 9, 9],
        };
        let encoded = env.encode();
        let decoded = Envelope::decode(&encoded, 1 << 20).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn sync_payload_round_trip() {
        for payload in [
            SyncPayload::Step1 { state_vector: vec![1, 2] },
            SyncPayload::Step2 { update: vec![3, 4, 5] },
            SyncPayload::Update { update: vec![] },
        ] {
            let encoded = payload.encode();
            let decoded = SyncPayload::decode(&encoded, 1 << 20).unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn awareness_round_trip_with_tombstone() {
        let entries = vec![
            AwarenessEntry {
                client_id: 1,
                clock: 3,
                payload: Some(b"cursor".to_vec()),
            },
            AwarenessEntry {
                client_id: 2,
                clock: 4,
                payload: None,
            },
        ];
        let encoded = encode_awareness(&entries);
        let decoded = decode_awareness(&encoded, 1 << 20).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut out = Vec::new();
        write_uvarint(&mut out, 100);
        out.extend(std::iter::repeat(0).take(100));
        let err = read_buf(&out, 10).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(100)));
    }
}
