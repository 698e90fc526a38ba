//! TLS 1.2 PRF, PSK key derivation and the AES-128-CCM-8 record cipher

use aes::Aes128;
use ccm::{
    aead::{generic_array::GenericArray, Aead, Payload},
    consts::{U12, U8},
    Ccm, KeyInit,
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::record::DTLS_1_2;
use crate::error::TransportError;

type HmacSha256 = Hmac<Sha256>;
type Aes128Ccm8 = Ccm<Aes128, U8, U12>;

pub const RANDOM_LEN: usize = 32;
pub const MASTER_SECRET_LEN: usize = 48;
pub const VERIFY_DATA_LEN: usize = 12;
pub const KEY_LEN: usize = 16;
pub const FIXED_IV_LEN: usize = 4;
pub const EXPLICIT_NONCE_LEN: usize = 8;
pub const TAG_LEN: usize = 8;

fn hmac(secret: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, TransportError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|e| TransportError::Handshake(format!("hmac key: {}", e)))?;
    for part in parts {
        Mac::update(&mut mac, part);
    }
    Ok(Mac::finalize(mac).into_bytes().to_vec())
}

/// `PRF(secret, label, seed)` per RFC 5246 section 5, P_SHA256
pub fn prf(secret: &[u8], label: &[u8], seed: &[u8], len: usize) -> Result<Vec<u8>, TransportError> {
    let mut out = Vec::with_capacity(len + 32);
    let mut a = hmac(secret, &[label, seed])?;
    while out.len() < len {
        out.extend_from_slice(&hmac(secret, &[&a, label, seed])?);
        a = hmac(secret, &[&a])?;
    }
    out.truncate(len);
    Ok(out)
}

/// Pre-master secret for plain PSK (RFC 4279 section 2)
pub fn psk_premaster(psk: &[u8]) -> Vec<u8> {
    let n = psk.len() as u16;
    let mut pre = Vec::with_capacity(4 + 2 * psk.len());
    pre.extend_from_slice(&n.to_be_bytes());
    pre.extend(std::iter::repeat(0u8).take(psk.len()));
    pre.extend_from_slice(&n.to_be_bytes());
    pre.extend_from_slice(psk);
    pre
}

pub fn master_secret(
    premaster: &[u8],
    client_random: &[u8],
    server_random: &[u8],
) -> Result<Vec<u8>, TransportError> {
    let seed = [client_random, server_random].concat();
    prf(premaster, b"master secret", &seed, MASTER_SECRET_LEN)
}

pub struct KeyBlock {
    pub client_key: [u8; KEY_LEN],
    pub server_key: [u8; KEY_LEN],
    pub client_iv: [u8; FIXED_IV_LEN],
    pub server_iv: [u8; FIXED_IV_LEN],
}

pub fn key_block(
    master: &[u8],
    client_random: &[u8],
    server_random: &[u8],
) -> Result<KeyBlock, TransportError> {
    let seed = [server_random, client_random].concat();
    let block = prf(master, b"key expansion", &seed, 2 * KEY_LEN + 2 * FIXED_IV_LEN)?;
    let mut keys = KeyBlock {
        client_key: [0; KEY_LEN],
        server_key: [0; KEY_LEN],
        client_iv: [0; FIXED_IV_LEN],
        server_iv: [0; FIXED_IV_LEN],
    };
    keys.client_key.copy_from_slice(&block[..16]);
    keys.server_key.copy_from_slice(&block[16..32]);
    keys.client_iv.copy_from_slice(&block[32..36]);
    keys.server_iv.copy_from_slice(&block[36..40]);
    Ok(keys)
}

/// Finished `verify_data` over the running handshake transcript
pub fn verify_data(master: &[u8], label: &[u8], transcript: &[u8]) -> Result<Vec<u8>, TransportError> {
    let hash = Sha256::digest(transcript);
    prf(master, label, &hash, VERIFY_DATA_LEN)
}

/// One direction of the record protection
pub struct CipherState {
    cipher: Aes128Ccm8,
    iv: [u8; FIXED_IV_LEN],
}

impl CipherState {
    pub fn new(key: &[u8; KEY_LEN], iv: &[u8; FIXED_IV_LEN]) -> Self {
        Self {
            cipher: Aes128Ccm8::new(GenericArray::from_slice(key)),
            iv: *iv,
        }
    }

    fn explicit(epoch: u16, sequence: u64) -> [u8; EXPLICIT_NONCE_LEN] {
        let mut explicit = [0u8; EXPLICIT_NONCE_LEN];
        explicit[..2].copy_from_slice(&epoch.to_be_bytes());
        explicit[2..].copy_from_slice(&sequence.to_be_bytes()[2..]);
        explicit
    }

    fn aad(explicit: &[u8], content_type: u8, len: usize) -> Vec<u8> {
        let mut aad = Vec::with_capacity(13);
        aad.extend_from_slice(explicit);
        aad.push(content_type);
        aad.extend_from_slice(&DTLS_1_2);
        aad.extend_from_slice(&(len as u16).to_be_bytes());
        aad
    }

    /// Encrypt a record body; the result is `explicit nonce || ciphertext || tag`
    pub fn seal(
        &self,
        epoch: u16,
        sequence: u64,
        content_type: u8,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let explicit = Self::explicit(epoch, sequence);
        let nonce = [&self.iv[..], &explicit[..]].concat();
        let aad = Self::aad(&explicit, content_type, plaintext.len());
        let sealed = self
            .cipher
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| TransportError::SendFailed("record encryption failed".into()))?;
        Ok([&explicit[..], &sealed[..]].concat())
    }

    /// Decrypt and authenticate a record body produced by [`seal`](Self::seal)
    pub fn open(
        &self,
        epoch: u16,
        sequence: u64,
        content_type: u8,
        fragment: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        if fragment.len() < EXPLICIT_NONCE_LEN + TAG_LEN {
            return Err(TransportError::Malformed("record shorter than nonce and tag".into()));
        }
        let (explicit, sealed) = fragment.split_at(EXPLICIT_NONCE_LEN);
        let nonce = [&self.iv[..], explicit].concat();
        // The AAD uses the record header's sequence, not the explicit nonce
        let header_seq = Self::explicit(epoch, sequence);
        let aad = Self::aad(&header_seq, content_type, sealed.len() - TAG_LEN);
        self.cipher
            .decrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| TransportError::Malformed("record authentication failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_premaster_layout() {
        let pre = psk_premaster(&[0xAA, 0xBB]);
        assert_eq!(pre, vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x02, 0xAA, 0xBB]);
    }

    #[test]
    fn test_prf_lengths_and_determinism() {
        let a = prf(b"secret", b"label", b"seed", 100).unwrap();
        let b = prf(b"secret", b"label", b"seed", 40).unwrap();
        assert_eq!(a.len(), 100);
        assert_eq!(&a[..40], &b[..]);
        assert_ne!(a, prf(b"secret", b"other", b"seed", 100).unwrap());
    }

    #[test]
    fn test_key_block_split() {
        let master = master_secret(&psk_premaster(b"key"), &[1; 32], &[2; 32]).unwrap();
        assert_eq!(master.len(), MASTER_SECRET_LEN);
        let keys = key_block(&master, &[1; 32], &[2; 32]).unwrap();
        let raw = prf(&master, b"key expansion", &[[2u8; 32], [1u8; 32]].concat(), 40).unwrap();
        assert_eq!(&keys.client_key[..], &raw[..16]);
        assert_eq!(&keys.server_iv[..], &raw[36..40]);
    }

    #[test]
    fn test_seal_open() {
        let state = CipherState::new(&[7; 16], &[1, 2, 3, 4]);
        let fragment = state.seal(1, 5, 23, b"hello coap").unwrap();
        assert_eq!(fragment.len(), 8 + 10 + 8);
        assert_eq!(&fragment[..2], &[0, 1]);
        assert_eq!(state.open(1, 5, 23, &fragment).unwrap(), b"hello coap");
    }

    #[test]
    fn test_open_rejects_tampering() {
        let state = CipherState::new(&[7; 16], &[1, 2, 3, 4]);
        let mut fragment = state.seal(1, 5, 23, b"hello coap").unwrap();
        // Wrong sequence in the header changes the AAD
        assert!(state.open(1, 6, 23, &fragment).is_err());
        // Wrong content type
        assert!(state.open(1, 5, 21, &fragment).is_err());
        let last = fragment.len() - 1;
        fragment[last] ^= 0x01;
        assert!(state.open(1, 5, 23, &fragment).is_err());
        assert!(state.open(1, 5, 23, &[0u8; 10]).is_err());
    }
}
