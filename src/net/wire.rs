//! Wire records and framing.
//!
//! Every record on a peer link is a 4-byte big-endian length followed by a
//! CBOR map keyed by small integer field ids. Three record kinds exist,
//! distinguished by the TYPE field: HANDSHAKE, RELAY, and NEIGHBORS.
//!
//! Decoding is strict: a missing required field, a field of the wrong kind
//! (a boolean is not an integer), or a NEIGHBORS entry that is not a packed
//! IP address all fail with a syntax error, and the connection that produced
//! the record is closed.

use std::fmt;
use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use ciborium::value::{Integer, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::MAX_RECORD_SIZE;
use crate::util::{to_binary_address, to_text_address};

// Field ids of the tagged-record encoding.
const FIELD_TYPE: u64 = 1;
const FIELD_MESSAGE: u64 = 2;
const FIELD_BROADCAST: u64 = 3;
const FIELD_NEIGHBORS: u64 = 4;
const FIELD_ERROR: u64 = 5;

// Record kinds carried in FIELD_TYPE.
const TYPE_HANDSHAKE: u64 = 1;
const TYPE_RELAY: u64 = 2;
const TYPE_NEIGHBORS: u64 = 3;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn syntax(message: impl Into<String>) -> WireError {
    WireError::Syntax(message.into())
}

/// An opaque whiteboard payload plus its flood bookkeeping. The content key
/// is the lowercase hex SHA-256 of the payload and is computed once, on
/// construction. Sequence number and timestamp are assigned by the store.
#[derive(Clone)]
pub struct RelayMessage {
    payload: Bytes,
    key: String,
    pub broadcast: bool,
    pub sequence_number: u64,
    pub timestamp: u64,
}

impl RelayMessage {
    pub fn new(payload: impl Into<Bytes>, broadcast: bool) -> Self {
        let payload = payload.into();
        let key = hex::encode(Sha256::digest(&payload));
        Self {
            payload,
            key,
            broadcast,
            sequence_number: 0,
            timestamp: 0,
        }
    }

    /// Content key: the flood engine's dedup fingerprint.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn mime_type(&self) -> &'static str {
        "application/octet-stream"
    }

    /// Payload as it appears in JSON responses.
    pub fn to_json(&self) -> String {
        BASE64.encode(&self.payload)
    }
}

impl fmt::Debug for RelayMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayMessage")
            .field("key", &self.key)
            .field("size", &self.payload.len())
            .field("broadcast", &self.broadcast)
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

/// One-hop neighbor announcement. Exchanged between peers, never stored.
#[derive(Debug, Clone)]
pub struct NeighborsMessage {
    pub neighbors: Vec<IpAddr>,
}

impl NeighborsMessage {
    pub fn new(neighbors: Vec<IpAddr>) -> Self {
        Self { neighbors }
    }
}

/// Exchanged once per connection in each direction. An absent error means
/// the peering is accepted.
#[derive(Debug, Clone)]
pub struct HandshakeMessage {
    pub error: Option<String>,
}

impl HandshakeMessage {
    pub fn new(error: Option<String>) -> Self {
        Self { error }
    }
}

/// A decoded wire record.
#[derive(Debug, Clone)]
pub enum Record {
    Handshake(HandshakeMessage),
    Relay(RelayMessage),
    Neighbors(NeighborsMessage),
}

fn int_value(n: u64) -> Value {
    Value::Integer(Integer::from(n))
}

fn field<'a>(map: &'a [(Value, Value)], id: u64) -> Option<&'a Value> {
    map.iter().find_map(|(k, v)| match k {
        Value::Integer(i) if i128::from(*i) == id as i128 => Some(v),
        _ => None,
    })
}

impl Record {
    pub fn to_cbor(&self) -> Result<Vec<u8>, WireError> {
        let value = match self {
            Record::Handshake(m) => {
                let mut map = vec![(int_value(FIELD_TYPE), int_value(TYPE_HANDSHAKE))];
                if let Some(error) = &m.error {
                    map.push((int_value(FIELD_ERROR), Value::Text(error.clone())));
                }
                Value::Map(map)
            }
            Record::Relay(m) => Value::Map(vec![
                (int_value(FIELD_TYPE), int_value(TYPE_RELAY)),
                (int_value(FIELD_MESSAGE), Value::Bytes(m.payload().to_vec())),
                (int_value(FIELD_BROADCAST), Value::Bool(m.broadcast)),
            ]),
            Record::Neighbors(m) => {
                let packed = m
                    .neighbors
                    .iter()
                    .map(|a| Value::Bytes(to_binary_address(a)))
                    .collect();
                Value::Map(vec![
                    (int_value(FIELD_TYPE), int_value(TYPE_NEIGHBORS)),
                    (int_value(FIELD_NEIGHBORS), Value::Array(packed)),
                ])
            }
        };
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&value, &mut buf)
            .map_err(|e| syntax(format!("cbor encode: {e}")))?;
        Ok(buf)
    }

    pub fn from_cbor(data: &[u8]) -> Result<Record, WireError> {
        let value: Value =
            ciborium::de::from_reader(data).map_err(|e| syntax(format!("cbor decode: {e}")))?;
        let map = match value {
            Value::Map(map) => map,
            _ => return Err(syntax("not a map")),
        };
        let msg_type = match field(&map, FIELD_TYPE) {
            Some(Value::Integer(i)) => i128::from(*i),
            Some(_) => return Err(syntax("TYPE not an integer")),
            None => return Err(syntax("no type field")),
        };
        match msg_type {
            t if t == TYPE_HANDSHAKE as i128 => Self::handshake_from_fields(&map),
            t if t == TYPE_RELAY as i128 => Self::relay_from_fields(&map),
            t if t == TYPE_NEIGHBORS as i128 => Self::neighbors_from_fields(&map),
            other => Err(syntax(format!("unknown type {other}"))),
        }
    }

    fn handshake_from_fields(map: &[(Value, Value)]) -> Result<Record, WireError> {
        let error = match field(map, FIELD_ERROR) {
            None => None,
            Some(Value::Text(s)) => Some(s.clone()),
            Some(_) => return Err(syntax("ERROR not a str")),
        };
        Ok(Record::Handshake(HandshakeMessage::new(error)))
    }

    fn relay_from_fields(map: &[(Value, Value)]) -> Result<Record, WireError> {
        let payload = match field(map, FIELD_MESSAGE) {
            Some(Value::Bytes(b)) => Bytes::from(b.clone()),
            Some(_) => return Err(syntax("MESSAGE not a bytes")),
            None => return Err(syntax("no MESSAGE field")),
        };
        let broadcast = match field(map, FIELD_BROADCAST) {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(syntax("BROADCAST not a bool")),
        };
        Ok(Record::Relay(RelayMessage::new(payload, broadcast)))
    }

    fn neighbors_from_fields(map: &[(Value, Value)]) -> Result<Record, WireError> {
        let entries = match field(map, FIELD_NEIGHBORS) {
            Some(Value::Array(entries)) => entries,
            Some(_) => return Err(syntax("NEIGHBORS not a list")),
            None => return Err(syntax("no NEIGHBORS field")),
        };
        let mut neighbors = Vec::with_capacity(entries.len());
        for entry in entries {
            let binary = match entry {
                Value::Bytes(b) => b,
                _ => return Err(syntax("neighbor is not a bytes")),
            };
            match to_text_address(binary) {
                Some(address) => neighbors.push(address),
                None => return Err(syntax("neighbor is not an IP address")),
            }
        }
        Ok(Record::Neighbors(NeighborsMessage::new(neighbors)))
    }
}

/// Read one length-prefixed record. `Ok(None)` is a clean end of stream
/// (EOF at the frame boundary, or a zero-length frame).
pub async fn read_record<R>(stream: &mut R) -> Result<Option<Record>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WireError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_RECORD_SIZE {
        return Err(syntax(format!("record of {len} bytes exceeds limit")));
    }
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(Some(Record::from_cbor(&data)?))
}

/// Serialize and send one record with its length prefix.
pub async fn write_record<W>(stream: &mut W, record: &Record) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let data = record.to_cbor()?;
    let mut packet = Vec::with_capacity(4 + data.len());
    packet.extend_from_slice(&(data.len() as u32).to_be_bytes());
    packet.extend_from_slice(&data);
    stream.write_all(&packet).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: &Record) -> Record {
        Record::from_cbor(&record.to_cbor().unwrap()).unwrap()
    }

    fn decode_map(entries: Vec<(u64, Value)>) -> Result<Record, WireError> {
        let map = entries
            .into_iter()
            .map(|(k, v)| (int_value(k), v))
            .collect::<Vec<_>>();
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&Value::Map(map), &mut buf).unwrap();
        Record::from_cbor(&buf)
    }

    #[test]
    fn test_not_map() {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&Value::Array(vec![Value::Text("hi".into())]), &mut buf)
            .unwrap();
        assert!(matches!(
            Record::from_cbor(&buf),
            Err(WireError::Syntax(_))
        ));
        buf.clear();
        ciborium::ser::into_writer(&Value::Integer(1.into()), &mut buf).unwrap();
        assert!(matches!(
            Record::from_cbor(&buf),
            Err(WireError::Syntax(_))
        ));
    }

    #[test]
    fn test_no_type() {
        assert!(decode_map(vec![(100, Value::Text("bar".into()))]).is_err());
    }

    #[test]
    fn test_unknown_type() {
        assert!(decode_map(vec![(FIELD_TYPE, int_value(100))]).is_err());
    }

    #[test]
    fn test_handshake_roundtrip() {
        let m = roundtrip(&Record::Handshake(HandshakeMessage::new(None)));
        match m {
            Record::Handshake(h) => assert_eq!(h.error, None),
            other => panic!("wrong kind: {other:?}"),
        }
        let m = roundtrip(&Record::Handshake(HandshakeMessage::new(Some(
            "badness".into(),
        ))));
        match m {
            Record::Handshake(h) => assert_eq!(h.error.as_deref(), Some("badness")),
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_handshake_bad_error() {
        let r = decode_map(vec![
            (FIELD_TYPE, int_value(TYPE_HANDSHAKE)),
            (FIELD_ERROR, int_value(30)),
        ]);
        assert!(matches!(r, Err(WireError::Syntax(_))));
    }

    #[test]
    fn test_relay_roundtrip() {
        let m = roundtrip(&Record::Relay(RelayMessage::new(&b"hello"[..], true)));
        match m {
            Record::Relay(rm) => {
                assert_eq!(rm.payload().as_ref(), b"hello");
                assert!(rm.broadcast);
            }
            other => panic!("wrong kind: {other:?}"),
        }
        let m = roundtrip(&Record::Relay(RelayMessage::new(&b"world"[..], false)));
        match m {
            Record::Relay(rm) => {
                assert_eq!(rm.payload().as_ref(), b"world");
                assert!(!rm.broadcast);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_relay_message_size() {
        assert_eq!(RelayMessage::new(&b"hello"[..], true).size(), 5);
    }

    #[test]
    fn test_relay_message_key() {
        assert_eq!(
            RelayMessage::new(&b"hello"[..], true).key(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_relay_to_json() {
        assert_eq!(RelayMessage::new(&b"hello"[..], true).to_json(), "aGVsbG8=");
    }

    #[test]
    fn test_relay_broadcast_defaults_false() {
        let r = decode_map(vec![
            (FIELD_TYPE, int_value(TYPE_RELAY)),
            (FIELD_MESSAGE, Value::Bytes(b"hi".to_vec())),
        ])
        .unwrap();
        match r {
            Record::Relay(rm) => assert!(!rm.broadcast),
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_relay_no_message() {
        assert!(decode_map(vec![(FIELD_TYPE, int_value(TYPE_RELAY))]).is_err());
    }

    #[test]
    fn test_relay_bad_message() {
        let r = decode_map(vec![
            (FIELD_TYPE, int_value(TYPE_RELAY)),
            (FIELD_MESSAGE, int_value(30)),
        ]);
        assert!(r.is_err());
    }

    #[test]
    fn test_relay_bad_broadcast() {
        // strict kinds: an integer is not a boolean
        let r = decode_map(vec![
            (FIELD_TYPE, int_value(TYPE_RELAY)),
            (FIELD_MESSAGE, Value::Bytes(b"hi".to_vec())),
            (FIELD_BROADCAST, int_value(30)),
        ]);
        assert!(r.is_err());
    }

    #[test]
    fn test_neighbors_roundtrip() {
        let addrs: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        let m = roundtrip(&Record::Neighbors(NeighborsMessage::new(addrs.clone())));
        match m {
            Record::Neighbors(nm) => assert_eq!(nm.neighbors, addrs),
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_neighbors_v6_roundtrip() {
        let addrs: Vec<IpAddr> = vec!["fd53::1".parse().unwrap()];
        let m = roundtrip(&Record::Neighbors(NeighborsMessage::new(addrs.clone())));
        match m {
            Record::Neighbors(nm) => assert_eq!(nm.neighbors, addrs),
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_neighbors_no_neighbors() {
        assert!(decode_map(vec![(FIELD_TYPE, int_value(TYPE_NEIGHBORS))]).is_err());
    }

    #[test]
    fn test_neighbors_bad_neighbors() {
        assert!(decode_map(vec![
            (FIELD_TYPE, int_value(TYPE_NEIGHBORS)),
            (FIELD_NEIGHBORS, int_value(1)),
        ])
        .is_err());
        assert!(decode_map(vec![
            (FIELD_TYPE, int_value(TYPE_NEIGHBORS)),
            (FIELD_NEIGHBORS, Value::Array(vec![Value::Text("10.0.0.1".into())])),
        ])
        .is_err());
        assert!(decode_map(vec![
            (FIELD_TYPE, int_value(TYPE_NEIGHBORS)),
            (
                FIELD_NEIGHBORS,
                Value::Array(vec![Value::Bytes(b"\x0a\x00\x01".to_vec())]),
            ),
        ])
        .is_err());
    }

    #[tokio::test]
    async fn test_framing_roundtrip() {
        let mut buf = Vec::new();
        write_record(&mut buf, &Record::Relay(RelayMessage::new(&b"hi"[..], true)))
            .await
            .unwrap();
        assert_eq!(&buf[..4], &(buf.len() as u32 - 4).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let record = read_record(&mut cursor).await.unwrap().unwrap();
        assert!(matches!(record, Record::Relay(_)));
        // clean EOF at the frame boundary
        assert!(read_record(&mut cursor).await.unwrap().is_none());
    }
}
