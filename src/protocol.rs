//! Wire formats for discovery, datagram transfers and the stream size token
//!
//! Every binary message starts with the 32-bit magic cookie followed by a
//! one-byte message type. All integers are big-endian.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAGIC_COOKIE: u32 = 0xabcd_dcba;
/// Well-known UDP port servers broadcast offers to
pub const DISCOVERY_PORT: u16 = 13117;
/// Bytes per stream write and per datagram payload
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

pub const OFFER_LEN: usize = 9;
pub const REQUEST_LEN: usize = 13;
pub const PAYLOAD_HEADER_LEN: usize = 21;
/// Longest accepted stream size token, newline included
pub const MAX_SIZE_TOKEN_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Offer = 0x02,
    Request = 0x03,
    Payload = 0x04,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x02 => Ok(MessageType::Offer),
            0x03 => Ok(MessageType::Request),
            0x04 => Ok(MessageType::Payload),
            other => Err(ProtocolError::UnexpectedType(other)),
        }
    }
}

/// Reasons a message is rejected. Receivers drop the message and move on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed message: expected {expected} bytes, got {actual}")]
    Malformed { expected: usize, actual: usize },
    #[error("magic cookie mismatch: {0:#010x}")]
    CookieMismatch(u32),
    #[error("unexpected message type {0:#04x}")]
    UnexpectedType(u8),
    #[error("segment index {index} out of range for {total} segments")]
    SegmentOutOfRange { index: u64, total: u64 },
    #[error("invalid request size {0:?}")]
    InvalidSize(String),
}

/// Checks the cookie and type prefix. Callers check the length first.
fn check_prefix(buffer: &[u8], expected: MessageType) -> Result<(), ProtocolError> {
    let cookie = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    if cookie != MAGIC_COOKIE {
        return Err(ProtocolError::CookieMismatch(cookie));
    }
    let kind = MessageType::try_from(buffer[4])?;
    if kind != expected {
        return Err(ProtocolError::UnexpectedType(buffer[4]));
    }
    Ok(())
}

fn write_prefix(buffer: &mut [u8], kind: MessageType) {
    buffer[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buffer[4] = kind as u8;
}

fn read_u64(buffer: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buffer[..8]);
    u64::from_be_bytes(bytes)
}

/// Discovery broadcast: [cookie:4][0x02][udp_port:2][tcp_port:2]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Offer {
    pub fn encode(&self) -> [u8; OFFER_LEN] {
        let mut buffer = [0u8; OFFER_LEN];
        write_prefix(&mut buffer, MessageType::Offer);
        buffer[5..7].copy_from_slice(&self.udp_port.to_be_bytes());
        buffer[7..9].copy_from_slice(&self.tcp_port.to_be_bytes());
        buffer
    }

    pub fn decode(buffer: &[u8]) -> Result<Self, ProtocolError> {
        if buffer.len() != OFFER_LEN {
            return Err(ProtocolError::Malformed {
                expected: OFFER_LEN,
                actual: buffer.len(),
            });
        }
        check_prefix(buffer, MessageType::Offer)?;
        Ok(Self {
            udp_port: u16::from_be_bytes([buffer[5], buffer[6]]),
            tcp_port: u16::from_be_bytes([buffer[7], buffer[8]]),
        })
    }
}

/// Datagram transfer request: [cookie:4][0x03][requested_size:8]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub requested_size: u64,
}

impl Request {
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut buffer = [0u8; REQUEST_LEN];
        write_prefix(&mut buffer, MessageType::Request);
        buffer[5..13].copy_from_slice(&self.requested_size.to_be_bytes());
        buffer
    }

    pub fn decode(buffer: &[u8]) -> Result<Self, ProtocolError> {
        if buffer.len() != REQUEST_LEN {
            return Err(ProtocolError::Malformed {
                expected: REQUEST_LEN,
                actual: buffer.len(),
            });
        }
        check_prefix(buffer, MessageType::Request)?;
        Ok(Self {
            requested_size: read_u64(&buffer[5..]),
        })
    }
}

/// Header in front of every payload segment:
/// [cookie:4][0x04][total_segments:8][segment_index:8][payload...]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub total_segments: u64,
    pub segment_index: u64,
}

impl PayloadHeader {
    /// Writes the header into the first `PAYLOAD_HEADER_LEN` bytes of `buffer`.
    pub fn encode(&self, buffer: &mut [u8]) {
        write_prefix(buffer, MessageType::Payload);
        buffer[5..13].copy_from_slice(&self.total_segments.to_be_bytes());
        buffer[13..21].copy_from_slice(&self.segment_index.to_be_bytes());
    }

    /// Parses a whole datagram, returning the header and the payload slice.
    pub fn decode(buffer: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if buffer.len() < PAYLOAD_HEADER_LEN {
            return Err(ProtocolError::Malformed {
                expected: PAYLOAD_HEADER_LEN,
                actual: buffer.len(),
            });
        }
        check_prefix(buffer, MessageType::Payload)?;
        let header = Self {
            total_segments: read_u64(&buffer[5..]),
            segment_index: read_u64(&buffer[13..]),
        };
        if header.segment_index >= header.total_segments {
            return Err(ProtocolError::SegmentOutOfRange {
                index: header.segment_index,
                total: header.total_segments,
            });
        }
        Ok((header, &buffer[PAYLOAD_HEADER_LEN..]))
    }
}

/// Stream request sent by the client: the byte count as decimal ASCII plus '\n'.
pub fn encode_size_token(size: u64) -> String {
    format!("{}\n", size)
}

pub fn parse_size_token(line: &str) -> Result<u64, ProtocolError> {
    let token = line.trim();
    if token.is_empty() || token.starts_with('-') {
        return Err(ProtocolError::InvalidSize(token.to_string()));
    }
    token
        .parse::<u64>()
        .map_err(|_| ProtocolError::InvalidSize(token.to_string()))
}

/// Which transport a session ran over
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stream,
    Datagram,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Stream => write!(f, "TCP"),
            Transport::Datagram => write!(f, "UDP"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_layout() {
        let offer = Offer {
            udp_port: 0x1234,
            tcp_port: 0xabcd,
        };
        assert_eq!(
            offer.encode(),
            [0xab, 0xcd, 0xdc, 0xba, 0x02, 0x12, 0x34, 0xab, 0xcd]
        );
    }

    #[test]
    fn test_offer_rejects_wrong_length() {
        let frame = Offer {
            udp_port: 1,
            tcp_port: 2,
        }
        .encode();
        assert_eq!(
            Offer::decode(&frame[..7]),
            Err(ProtocolError::Malformed {
                expected: OFFER_LEN,
                actual: 7
            })
        );
    }

    #[test]
    fn test_request_rejects_offer_type() {
        let mut frame = Request { requested_size: 5 }.encode();
        frame[4] = MessageType::Offer as u8;
        assert_eq!(
            Request::decode(&frame),
            Err(ProtocolError::UnexpectedType(0x02))
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut frame = Request { requested_size: 5 }.encode();
        frame[4] = 0x7f;
        assert_eq!(
            Request::decode(&frame),
            Err(ProtocolError::UnexpectedType(0x7f))
        );
    }

    #[test]
    fn test_payload_header_out_of_range() {
        let mut buffer = [0u8; PAYLOAD_HEADER_LEN];
        PayloadHeader {
            total_segments: 3,
            segment_index: 3,
        }
        .encode(&mut buffer);
        assert_eq!(
            PayloadHeader::decode(&buffer),
            Err(ProtocolError::SegmentOutOfRange { index: 3, total: 3 })
        );
    }

    #[test]
    fn test_size_token() {
        assert_eq!(encode_size_token(2048), "2048\n");
        assert_eq!(parse_size_token("2048\n"), Ok(2048));
        assert_eq!(parse_size_token(" 7 \r\n"), Ok(7));
        assert!(matches!(
            parse_size_token("-5\n"),
            Err(ProtocolError::InvalidSize(_))
        ));
        assert!(matches!(
            parse_size_token("FileSize:1024"),
            Err(ProtocolError::InvalidSize(_))
        ));
        assert!(parse_size_token("\n").is_err());
    }

    #[test]
    fn test_transport_display() {
        assert_eq!(Transport::Stream.to_string(), "TCP");
        assert_eq!(Transport::Datagram.to_string(), "UDP");
    }
}
