//! Block-wise transfer (RFC 7959)
//!
//! Block1 carries request bodies in pieces (package push); Block2 carries
//! response bodies in pieces (large reads and pull downloads).

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::error::MessageError;
use crate::message::Code;

/// Largest size exponent, 1024 byte blocks
pub const MAX_SZX: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOption {
    pub num: u32,
    pub more: bool,
    pub szx: u8,
}

impl BlockOption {
    pub fn new(num: u32, more: bool, szx: u8) -> Self {
        Self { num, more, szx }
    }

    /// Block size in bytes, `2^(szx + 4)`
    pub fn size(&self) -> usize {
        1usize << (self.szx as usize + 4)
    }

    pub fn offset(&self) -> usize {
        self.num as usize * self.size()
    }

    pub fn encode(&self) -> Vec<u8> {
        let value = (self.num << 4) | ((self.more as u32) << 3) | (self.szx as u32 & 0x07);
        crate::message::encode_uint(value)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() > 3 {
            return Err(MessageError::InvalidBlock(format!("{} byte value", bytes.len())));
        }
        let value = bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32);
        let szx = (value & 0x07) as u8;
        if szx == 7 {
            return Err(MessageError::InvalidBlock("reserved szx 7".into()));
        }
        Ok(Self {
            num: value >> 4,
            more: value & 0x08 != 0,
            szx,
        })
    }
}

/// Slice block `num` of `body`, returning the chunk and whether more follow
pub fn slice_block(body: &[u8], num: u32, szx: u8) -> Option<(&[u8], bool)> {
    let size = 1usize << (szx as usize + 4);
    let start = num as usize * size;
    if start > body.len() || (start == body.len() && num > 0) {
        return None;
    }
    let end = (start + size).min(body.len());
    Some((&body[start..end], end < body.len()))
}

/// Split `body` into Block1 pieces for an outbound request
pub fn split_blocks(body: &[u8], szx: u8) -> Vec<(BlockOption, Vec<u8>)> {
    let size = 1usize << (szx as usize + 4);
    if body.is_empty() {
        return vec![(BlockOption::new(0, false, szx), Vec::new())];
    }
    let count = body.len().div_ceil(size);
    body.chunks(size)
        .enumerate()
        .map(|(i, chunk)| {
            (
                BlockOption::new(i as u32, i + 1 < count, szx),
                chunk.to_vec(),
            )
        })
        .collect()
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Block {got} out of sequence, expected {expected}")]
    Incomplete { expected: u32, got: u32 },

    #[error("Block size changed mid-transfer")]
    SizeChanged,

    #[error("Block {num} has {len} bytes, expected {expected}")]
    InvalidSize { num: u32, len: usize, expected: usize },

    #[error("Transfer exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

impl BlockError {
    pub fn code(&self) -> Code {
        match self {
            BlockError::Incomplete { .. } | BlockError::SizeChanged => {
                Code::REQUEST_ENTITY_INCOMPLETE
            }
            BlockError::InvalidSize { .. } => Code::BAD_REQUEST,
            BlockError::TooLarge { .. } => Code::REQUEST_ENTITY_TOO_LARGE,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Block accepted, reply 2.31 echoing the block option
    Continue(BlockOption),
    /// Final block accepted, full body assembled
    Complete(Vec<u8>),
}

struct Transfer {
    next: u32,
    szx: u8,
    buffer: Vec<u8>,
    touched: Instant,
}

/// Reassembles Block1 request bodies keyed by token
pub struct Block1Assembler {
    transfers: HashMap<Vec<u8>, Transfer>,
    max_size: usize,
    idle_timeout: Duration,
}

impl Block1Assembler {
    pub fn new(max_size: usize, idle_timeout: Duration) -> Self {
        Self {
            transfers: HashMap::new(),
            max_size,
            idle_timeout,
        }
    }

    pub fn in_progress(&self, key: &[u8]) -> bool {
        self.transfers.contains_key(key)
    }

    /// Feed one block; any error drops the transfer
    pub fn accept(
        &mut self,
        key: &[u8],
        block: BlockOption,
        payload: &[u8],
        now: Instant,
    ) -> Result<BlockOutcome, BlockError> {
        let result = self.accept_inner(key, block, payload, now);
        if result.is_err() {
            self.transfers.remove(key);
        }
        result
    }

    fn accept_inner(
        &mut self,
        key: &[u8],
        block: BlockOption,
        payload: &[u8],
        now: Instant,
    ) -> Result<BlockOutcome, BlockError> {
        if block.num == 0 {
            if self.transfers.remove(key).is_some() {
                debug!(key = ?key, "Restarting block1 transfer");
            }
            self.transfers.insert(
                key.to_vec(),
                Transfer {
                    next: 0,
                    szx: block.szx,
                    buffer: Vec::new(),
                    touched: now,
                },
            );
        }

        let transfer = self
            .transfers
            .get_mut(key)
            .ok_or(BlockError::Incomplete {
                expected: 0,
                got: block.num,
            })?;

        if block.num != transfer.next {
            return Err(BlockError::Incomplete {
                expected: transfer.next,
                got: block.num,
            });
        }
        if block.szx != transfer.szx {
            return Err(BlockError::SizeChanged);
        }
        if block.more && payload.len() != block.size() {
            return Err(BlockError::InvalidSize {
                num: block.num,
                len: payload.len(),
                expected: block.size(),
            });
        }
        if transfer.buffer.len() + payload.len() > self.max_size {
            return Err(BlockError::TooLarge {
                limit: self.max_size,
            });
        }

        transfer.buffer.extend_from_slice(payload);
        transfer.next += 1;
        transfer.touched = now;

        if block.more {
            Ok(BlockOutcome::Continue(block))
        } else {
            let done = self.transfers.remove(key).map(|t| t.buffer).unwrap_or_default();
            Ok(BlockOutcome::Complete(done))
        }
    }

    pub fn abort(&mut self, key: &[u8]) {
        self.transfers.remove(key);
    }

    /// Drop transfers idle longer than the configured timeout
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.transfers.len();
        let timeout = self.idle_timeout;
        self.transfers
            .retain(|_, t| now.saturating_duration_since(t.touched) < timeout);
        before - self.transfers.len()
    }
}

/// A response body held while a peer walks it with Block2
#[derive(Debug, Clone)]
pub struct CachedBody {
    pub payload: Vec<u8>,
    pub content_format: u16,
    stored: Instant,
}

/// Response bodies keyed by transfer, so every block of a transfer is cut
/// from the same snapshot
pub struct Block2Cache<K> {
    bodies: HashMap<K, CachedBody>,
    lifetime: Duration,
}

impl<K: Hash + Eq> Block2Cache<K> {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            bodies: HashMap::new(),
            lifetime,
        }
    }

    pub fn store(&mut self, key: K, payload: Vec<u8>, content_format: u16, now: Instant) {
        self.bodies.insert(
            key,
            CachedBody {
                payload,
                content_format,
                stored: now,
            },
        );
    }

    pub fn get(&self, key: &K, now: Instant) -> Option<&CachedBody> {
        self.bodies.get(key).filter(|b| self.is_live(b, now))
    }

    /// First live body whose key satisfies `matches`
    pub fn find(&self, now: Instant, mut matches: impl FnMut(&K) -> bool) -> Option<&CachedBody> {
        self.bodies
            .iter()
            .find(|(k, b)| matches(k) && self.is_live(b, now))
            .map(|(_, b)| b)
    }

    pub fn remove(&mut self, key: &K) {
        self.bodies.remove(key);
    }

    pub fn expire(&mut self, now: Instant) {
        let lifetime = self.lifetime;
        self.bodies
            .retain(|_, b| now.saturating_duration_since(b.stored) < lifetime);
    }

    fn is_live(&self, body: &CachedBody, now: Instant) -> bool {
        now.saturating_duration_since(body.stored) < self.lifetime
    }
}
