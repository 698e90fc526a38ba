//! PSK handshake messages (RFC 6347 section 4.2, RFC 4279)

use bytes::{BufMut, BytesMut};

use super::crypto::RANDOM_LEN;
use super::record::DTLS_1_2;
use crate::error::TransportError;

pub const CLIENT_HELLO: u8 = 1;
pub const SERVER_HELLO: u8 = 2;
pub const HELLO_VERIFY_REQUEST: u8 = 3;
pub const SERVER_KEY_EXCHANGE: u8 = 12;
pub const SERVER_HELLO_DONE: u8 = 14;
pub const CLIENT_KEY_EXCHANGE: u8 = 16;
pub const FINISHED: u8 = 20;

pub const TLS_PSK_WITH_AES_128_CCM_8: u16 = 0xC0A8;

pub const HANDSHAKE_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake<'a> {
    pub msg_type: u8,
    pub message_seq: u16,
    pub body: &'a [u8],
    /// Header plus body, as hashed into the transcript
    pub raw: &'a [u8],
}

fn put_u24(buf: &mut BytesMut, value: usize) {
    buf.put_slice(&(value as u32).to_be_bytes()[1..]);
}

fn u24(bytes: &[u8]) -> usize {
    ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize
}

fn malformed(what: &str) -> TransportError {
    TransportError::Handshake(format!("malformed {}", what))
}

/// Frame a complete, unfragmented handshake message
pub fn encode_handshake(msg_type: u8, message_seq: u16, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_HEADER_LEN + body.len());
    buf.put_u8(msg_type);
    put_u24(&mut buf, body.len());
    buf.put_u16(message_seq);
    put_u24(&mut buf, 0);
    put_u24(&mut buf, body.len());
    buf.put_slice(body);
    buf.to_vec()
}

/// Split a handshake record into messages
///
/// Fragmented messages are rejected; PSK flights fit in a single datagram.
pub fn parse_handshakes(fragment: &[u8]) -> Result<Vec<Handshake<'_>>, TransportError> {
    let mut messages = Vec::new();
    let mut rest = fragment;
    while !rest.is_empty() {
        if rest.len() < HANDSHAKE_HEADER_LEN {
            return Err(malformed("handshake header"));
        }
        let length = u24(&rest[1..4]);
        let offset = u24(&rest[6..9]);
        let frag_len = u24(&rest[9..12]);
        if offset != 0 || frag_len != length {
            return Err(TransportError::Handshake(
                "fragmented handshake messages are not supported".into(),
            ));
        }
        let end = HANDSHAKE_HEADER_LEN + length;
        if rest.len() < end {
            return Err(malformed("handshake body"));
        }
        messages.push(Handshake {
            msg_type: rest[0],
            message_seq: u16::from_be_bytes([rest[4], rest[5]]),
            body: &rest[HANDSHAKE_HEADER_LEN..end],
            raw: &rest[..end],
        });
        rest = &rest[end..];
    }
    Ok(messages)
}

pub fn client_hello(random: &[u8; RANDOM_LEN], cookie: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(48 + cookie.len());
    buf.put_slice(&DTLS_1_2);
    buf.put_slice(random);
    buf.put_u8(0); // session id
    buf.put_u8(cookie.len() as u8);
    buf.put_slice(cookie);
    buf.put_u16(2);
    buf.put_u16(TLS_PSK_WITH_AES_128_CCM_8);
    buf.put_u8(1);
    buf.put_u8(0); // null compression
    buf.to_vec()
}

pub fn parse_hello_verify(body: &[u8]) -> Result<Vec<u8>, TransportError> {
    let len = *body.get(2).ok_or_else(|| malformed("HelloVerifyRequest"))? as usize;
    body.get(3..3 + len)
        .map(|c| c.to_vec())
        .ok_or_else(|| malformed("HelloVerifyRequest cookie"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub random: [u8; RANDOM_LEN],
    pub cipher_suite: u16,
}

pub fn parse_server_hello(body: &[u8]) -> Result<ServerHello, TransportError> {
    let random_end = 2 + RANDOM_LEN;
    let mut random = [0u8; RANDOM_LEN];
    random.copy_from_slice(
        body.get(2..random_end)
            .ok_or_else(|| malformed("ServerHello random"))?,
    );
    let sid_len = *body
        .get(random_end)
        .ok_or_else(|| malformed("ServerHello session id"))? as usize;
    let suite_at = random_end + 1 + sid_len;
    let suite = body
        .get(suite_at..suite_at + 2)
        .ok_or_else(|| malformed("ServerHello cipher suite"))?;
    Ok(ServerHello {
        random,
        cipher_suite: u16::from_be_bytes([suite[0], suite[1]]),
    })
}

pub fn parse_psk_hint(body: &[u8]) -> Result<Vec<u8>, TransportError> {
    if body.len() < 2 {
        return Err(malformed("ServerKeyExchange"));
    }
    let len = u16::from_be_bytes([body[0], body[1]]) as usize;
    body.get(2..2 + len)
        .map(|h| h.to_vec())
        .ok_or_else(|| malformed("PSK identity hint"))
}

pub fn client_key_exchange(identity: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(2 + identity.len());
    buf.put_u16(identity.len() as u16);
    buf.put_slice(identity);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_client_hello_layout() {
        let body = client_hello(&[0x11; 32], &[0xC0, 0x0C]);
        assert_eq!(&body[..2], &DTLS_1_2);
        assert_eq!(body[34], 0);
        assert_eq!(&body[35..38], &[2, 0xC0, 0x0C]);
        assert_eq!(&body[38..], &[0, 2, 0xC0, 0xA8, 1, 0]);
    }

    #[test]
    fn test_handshake_framing() {
        let mut flight = encode_handshake(SERVER_HELLO_DONE, 4, &[]);
        flight.extend(encode_handshake(FINISHED, 5, &[0xAB; 12]));
        let messages = parse_handshakes(&flight).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].msg_type, SERVER_HELLO_DONE);
        assert_eq!(messages[0].raw.len(), 12);
        assert_eq!(messages[1].message_seq, 5);
        assert_eq!(messages[1].body, &[0xAB; 12]);
    }

    #[test]
    fn test_rejects_fragments() {
        let mut msg = encode_handshake(FINISHED, 0, &[0; 12]);
        msg[11] = 6;
        assert!(parse_handshakes(&msg).is_err());
    }

    #[test]
    fn test_parse_server_messages() {
        let mut sh = vec![0xFE, 0xFD];
        sh.extend([0x22; 32]);
        sh.push(4);
        sh.extend([9, 9, 9, 9]);
        sh.extend([0xC0, 0xA8, 0]);
        let parsed = parse_server_hello(&sh).unwrap();
        assert_eq!(parsed.random, [0x22; 32]);
        assert_eq!(parsed.cipher_suite, TLS_PSK_WITH_AES_128_CCM_8);

        assert_eq!(parse_hello_verify(&[0xFE, 0xFF, 2, 7, 8]).unwrap(), vec![7, 8]);
        assert_eq!(parse_psk_hint(&[0, 3, b'h', b'u', b'b']).unwrap(), b"hub");
        assert!(parse_psk_hint(&[0, 3, b'h']).is_err());
    }
}
