//! DTLS 1.2 record layer framing (RFC 6347 section 4.1)

use bytes::{BufMut, BytesMut};

use crate::error::TransportError;

pub const CHANGE_CIPHER_SPEC: u8 = 20;
pub const ALERT: u8 = 21;
pub const HANDSHAKE: u8 = 22;
pub const APPLICATION_DATA: u8 = 23;

pub const DTLS_1_2: [u8; 2] = [0xFE, 0xFD];
/// Servers may answer the first ClientHello with the DTLS 1.0 version
const DTLS_1_0: [u8; 2] = [0xFE, 0xFF];

pub const HEADER_LEN: usize = 13;
/// Sequence numbers are 48 bits on the wire
pub const MAX_SEQUENCE: u64 = (1 << 48) - 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<'a> {
    pub content_type: u8,
    pub epoch: u16,
    pub sequence: u64,
    pub fragment: &'a [u8],
}

pub fn encode_record(content_type: u8, epoch: u16, sequence: u64, fragment: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + fragment.len());
    buf.put_u8(content_type);
    buf.put_slice(&DTLS_1_2);
    buf.put_u16(epoch);
    buf.put_slice(&sequence.to_be_bytes()[2..]);
    buf.put_u16(fragment.len() as u16);
    buf.put_slice(fragment);
    buf.to_vec()
}

/// Split a datagram into its records
pub fn parse_records(datagram: &[u8]) -> Result<Vec<Record<'_>>, TransportError> {
    let mut records = Vec::new();
    let mut rest = datagram;
    while !rest.is_empty() {
        if rest.len() < HEADER_LEN {
            return Err(TransportError::Malformed(format!(
                "truncated record header ({} bytes)",
                rest.len()
            )));
        }
        let version = [rest[1], rest[2]];
        if version != DTLS_1_2 && version != DTLS_1_0 {
            return Err(TransportError::Malformed(format!(
                "unsupported record version {:02X}{:02X}",
                version[0], version[1]
            )));
        }
        let epoch = u16::from_be_bytes([rest[3], rest[4]]);
        let sequence = rest[5..11]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64);
        let len = u16::from_be_bytes([rest[11], rest[12]]) as usize;
        let fragment = rest.get(HEADER_LEN..HEADER_LEN + len).ok_or_else(|| {
            TransportError::Malformed(format!("record claims {} bytes", len))
        })?;
        records.push(Record {
            content_type: rest[0],
            epoch,
            sequence,
            fragment,
        });
        rest = &rest[HEADER_LEN + len..];
    }
    Ok(records)
}

/// Anti-replay sliding window (RFC 6347 section 4.1.2.6)
#[derive(Debug, Default)]
pub struct ReplayWindow {
    latest: Option<u64>,
    bitmap: u64,
}

impl ReplayWindow {
    const SIZE: u64 = 64;

    /// Whether `sequence` is new and inside the window
    pub fn check(&self, sequence: u64) -> bool {
        match self.latest {
            None => true,
            Some(latest) if sequence > latest => true,
            Some(latest) => {
                let offset = latest - sequence;
                offset < Self::SIZE && self.bitmap & (1 << offset) == 0
            }
        }
    }

    /// Record `sequence` as received, after it authenticated
    pub fn update(&mut self, sequence: u64) {
        match self.latest {
            None => {
                self.latest = Some(sequence);
                self.bitmap = 1;
            }
            Some(latest) if sequence > latest => {
                let shift = sequence - latest;
                self.bitmap = if shift >= Self::SIZE {
                    1
                } else {
                    (self.bitmap << shift) | 1
                };
                self.latest = Some(sequence);
            }
            Some(latest) => {
                let offset = latest - sequence;
                if offset < Self::SIZE {
                    self.bitmap |= 1 << offset;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_round_trip() {
        let mut datagram = encode_record(HANDSHAKE, 0, 3, &[1, 2, 3]);
        datagram.extend(encode_record(APPLICATION_DATA, 1, 0x0102_0304_0506, &[9]));
        let records = parse_records(&datagram).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 3);
        assert_eq!(records[0].fragment, &[1, 2, 3]);
        assert_eq!(records[1].epoch, 1);
        assert_eq!(records[1].sequence, 0x0102_0304_0506);
    }

    #[test]
    fn test_truncated_record() {
        let datagram = encode_record(HANDSHAKE, 0, 0, &[1, 2, 3]);
        assert!(parse_records(&datagram[..14]).is_err());
        assert!(parse_records(&datagram[..5]).is_err());
    }

    #[test]
    fn test_replay_window() {
        let mut window = ReplayWindow::default();
        assert!(window.check(5));
        window.update(5);
        assert!(!window.check(5));
        assert!(window.check(4));
        window.update(4);
        assert!(!window.check(4));
        window.update(100);
        assert!(!window.check(36));
        assert!(window.check(37));
        assert!(window.check(101));
    }
}
