//! CoAP message framing (RFC 7252)
//!
//! ```text
//!  0                   1                   2                   3
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! |   Token (if any, TKL bytes) ...
//! |   Options (if any) ...
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! ```

use std::collections::BTreeMap;
use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::block::BlockOption;
use crate::error::MessageError;

/// Message code, `class << 5 | detail`
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0x00);

    pub const GET: Code = Code(0x01);
    pub const POST: Code = Code(0x02);
    pub const PUT: Code = Code(0x03);
    pub const DELETE: Code = Code(0x04);

    pub const CREATED: Code = Code(0x41);
    pub const DELETED: Code = Code(0x42);
    pub const VALID: Code = Code(0x43);
    pub const CHANGED: Code = Code(0x44);
    pub const CONTENT: Code = Code(0x45);
    pub const CONTINUE: Code = Code(0x5F);

    pub const BAD_REQUEST: Code = Code(0x80);
    pub const UNAUTHORIZED: Code = Code(0x81);
    pub const BAD_OPTION: Code = Code(0x82);
    pub const FORBIDDEN: Code = Code(0x83);
    pub const NOT_FOUND: Code = Code(0x84);
    pub const METHOD_NOT_ALLOWED: Code = Code(0x85);
    pub const NOT_ACCEPTABLE: Code = Code(0x86);
    pub const REQUEST_ENTITY_INCOMPLETE: Code = Code(0x88);
    pub const REQUEST_ENTITY_TOO_LARGE: Code = Code(0x8D);
    pub const UNSUPPORTED_CONTENT_FORMAT: Code = Code(0x8F);

    pub const INTERNAL_SERVER_ERROR: Code = Code(0xA0);
    pub const NOT_IMPLEMENTED: Code = Code(0xA1);
    pub const SERVICE_UNAVAILABLE: Code = Code(0xA3);
    pub const GATEWAY_TIMEOUT: Code = Code(0xA4);

    pub fn class(&self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(&self) -> u8 {
        self.0 & 0x1F
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_request(&self) -> bool {
        self.class() == 0 && self.0 != 0
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// Option numbers used by LwM2M
pub mod option {
    pub const IF_MATCH: u16 = 1;
    pub const URI_HOST: u16 = 3;
    pub const ETAG: u16 = 4;
    pub const OBSERVE: u16 = 6;
    pub const URI_PORT: u16 = 7;
    pub const LOCATION_PATH: u16 = 8;
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const MAX_AGE: u16 = 14;
    pub const URI_QUERY: u16 = 15;
    pub const ACCEPT: u16 = 17;
    pub const LOCATION_QUERY: u16 = 20;
    pub const BLOCK2: u16 = 23;
    pub const BLOCK1: u16 = 27;
    pub const SIZE2: u16 = 28;
    pub const SIZE1: u16 = 60;
}

/// Content-Format registry values
pub struct ContentFormat;

impl ContentFormat {
    pub const TEXT: u16 = 0;
    pub const LINK_FORMAT: u16 = 40;
    pub const OPAQUE: u16 = 42;
    pub const TLV: u16 = 11542;
    pub const JSON: u16 = 11543;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mtype: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    options: BTreeMap<u16, Vec<Vec<u8>>>,
    pub payload: Vec<u8>,
}

/// Minimal big-endian encoding of an unsigned option value
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub fn decode_uint(bytes: &[u8]) -> Option<u32> {
    if bytes.len() > 4 {
        return None;
    }
    Some(bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

impl Message {
    pub fn new(mtype: MessageType, code: Code) -> Self {
        Self {
            mtype,
            code,
            message_id: 0,
            token: Vec::new(),
            options: BTreeMap::new(),
            payload: Vec::new(),
        }
    }

    /// Confirmable request to `path`, e.g. `"rd"` or `"rd/5a3f"`
    pub fn request(code: Code, path: &str) -> Self {
        let mut msg = Self::new(MessageType::Confirmable, code);
        msg.set_uri_path(path);
        msg
    }

    /// Response skeleton carrying the request's token
    ///
    /// The endpoint fixes up type and message id when the response is sent.
    pub fn response(request: &Message, code: Code) -> Self {
        let mtype = if request.mtype == MessageType::Confirmable {
            MessageType::Acknowledgement
        } else {
            MessageType::NonConfirmable
        };
        let mut msg = Self::new(mtype, code);
        msg.token = request.token.clone();
        msg.message_id = request.message_id;
        msg
    }

    pub fn empty_ack(message_id: u16) -> Self {
        let mut msg = Self::new(MessageType::Acknowledgement, Code::EMPTY);
        msg.message_id = message_id;
        msg
    }

    pub fn reset(message_id: u16) -> Self {
        let mut msg = Self::new(MessageType::Reset, Code::EMPTY);
        msg.message_id = message_id;
        msg
    }

    pub fn is_confirmable(&self) -> bool {
        self.mtype == MessageType::Confirmable
    }

    // =========================================================================
    // Options
    // =========================================================================

    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        self.options.entry(number).or_default().push(value);
    }

    pub fn set_option(&mut self, number: u16, value: Vec<u8>) {
        self.options.insert(number, vec![value]);
    }

    pub fn remove_option(&mut self, number: u16) {
        self.options.remove(&number);
    }

    pub fn option(&self, number: u16) -> Option<&[u8]> {
        self.options
            .get(&number)
            .and_then(|v| v.first())
            .map(|v| v.as_slice())
    }

    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .get(&number)
            .into_iter()
            .flatten()
            .map(|v| v.as_slice())
    }

    pub fn uint_option(&self, number: u16) -> Option<u32> {
        self.option(number).and_then(decode_uint)
    }

    pub fn set_uint_option(&mut self, number: u16, value: u32) {
        self.set_option(number, encode_uint(value));
    }

    fn string_options(&self, number: u16) -> Vec<String> {
        self.option_values(number)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn set_uri_path(&mut self, path: &str) {
        self.remove_option(option::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(option::URI_PATH, segment.as_bytes().to_vec());
        }
    }

    pub fn uri_path(&self) -> Vec<String> {
        self.string_options(option::URI_PATH)
    }

    pub fn add_uri_query(&mut self, query: &str) {
        self.add_option(option::URI_QUERY, query.as_bytes().to_vec());
    }

    pub fn uri_query(&self) -> Vec<String> {
        self.string_options(option::URI_QUERY)
    }

    pub fn location_path(&self) -> Vec<String> {
        self.string_options(option::LOCATION_PATH)
    }

    pub fn content_format(&self) -> Option<u16> {
        self.uint_option(option::CONTENT_FORMAT).map(|v| v as u16)
    }

    pub fn set_content_format(&mut self, format: u16) {
        self.set_uint_option(option::CONTENT_FORMAT, format as u32);
    }

    pub fn accept(&self) -> Option<u16> {
        self.uint_option(option::ACCEPT).map(|v| v as u16)
    }

    pub fn observe(&self) -> Option<u32> {
        self.uint_option(option::OBSERVE)
    }

    /// Observe sequence numbers are 24 bits on the wire
    pub fn set_observe(&mut self, sequence: u32) {
        self.set_uint_option(option::OBSERVE, sequence & 0xFF_FFFF);
    }

    pub fn block1(&self) -> Option<Result<BlockOption, MessageError>> {
        self.option(option::BLOCK1).map(BlockOption::decode)
    }

    pub fn block2(&self) -> Option<Result<BlockOption, MessageError>> {
        self.option(option::BLOCK2).map(BlockOption::decode)
    }

    pub fn set_block1(&mut self, block: BlockOption) {
        self.set_option(option::BLOCK1, block.encode());
    }

    pub fn set_block2(&mut self, block: BlockOption) {
        self.set_option(option::BLOCK2, block.encode());
    }

    // =========================================================================
    // Wire format
    // =========================================================================

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16 + self.token.len() + self.payload.len());
        let tkl = self.token.len().min(8) as u8;
        buf.put_u8(0x40 | (self.mtype.bits() << 4) | tkl);
        buf.put_u8(self.code.0);
        buf.put_u16(self.message_id);
        buf.put_slice(&self.token[..tkl as usize]);

        let mut previous = 0u16;
        for (number, values) in &self.options {
            for value in values {
                let delta = number - previous;
                previous = *number;
                let (delta_nibble, delta_ext) = option_nibble(delta as usize);
                let (len_nibble, len_ext) = option_nibble(value.len());
                buf.put_u8((delta_nibble << 4) | len_nibble);
                buf.put_slice(&delta_ext);
                buf.put_slice(&len_ext);
                buf.put_slice(value);
            }
        }

        if !self.payload.is_empty() {
            buf.put_u8(0xFF);
            buf.put_slice(&self.payload);
        }
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Message, MessageError> {
        if data.len() < 4 {
            return Err(MessageError::TooShort(data.len()));
        }
        let version = data[0] >> 6;
        if version != 1 {
            return Err(MessageError::BadVersion(version));
        }
        let mtype = MessageType::from_bits(data[0] >> 4);
        let tkl = data[0] & 0x0F;
        if tkl > 8 {
            return Err(MessageError::BadTokenLength(tkl));
        }
        let code = Code(data[1]);
        let message_id = u16::from_be_bytes([data[2], data[3]]);
        let mut pos = 4usize;
        let token = data
            .get(pos..pos + tkl as usize)
            .ok_or(MessageError::TooShort(data.len()))?
            .to_vec();
        pos += tkl as usize;

        let mut msg = Message {
            mtype,
            code,
            message_id,
            token,
            options: BTreeMap::new(),
            payload: Vec::new(),
        };

        let mut number = 0u16;
        while pos < data.len() {
            let byte = data[pos];
            pos += 1;
            if byte == 0xFF {
                if pos >= data.len() {
                    return Err(MessageError::EmptyPayload);
                }
                msg.payload = data[pos..].to_vec();
                break;
            }
            let delta = read_extended(data, &mut pos, byte >> 4)?;
            let len = read_extended(data, &mut pos, byte & 0x0F)?;
            number = u16::try_from(number as usize + delta)
                .map_err(|_| MessageError::BadOption(format!("option number overflow at {}", number)))?;
            let value = data
                .get(pos..pos + len)
                .ok_or_else(|| MessageError::BadOption(format!("option {} overruns message", number)))?;
            pos += len;
            msg.add_option(number, value.to_vec());
        }
        Ok(msg)
    }
}

fn option_nibble(value: usize) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, ((value - 269) as u16).to_be_bytes().to_vec())
    }
}

fn read_extended(data: &[u8], pos: &mut usize, nibble: u8) -> Result<usize, MessageError> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            let b = *data
                .get(*pos)
                .ok_or_else(|| MessageError::BadOption("truncated extended value".into()))?;
            *pos += 1;
            Ok(b as usize + 13)
        }
        14 => {
            let b = data
                .get(*pos..*pos + 2)
                .ok_or_else(|| MessageError::BadOption("truncated extended value".into()))?;
            *pos += 2;
            Ok(u16::from_be_bytes([b[0], b[1]]) as usize + 269)
        }
        _ => Err(MessageError::BadOption("reserved nibble 15".into())),
    }
}
