//! The payment intent we embed in OP_RETURN outputs.
//!
//! Layout, big-endian:
//! ```text
//! byte 0        : version
//! bytes 1..9    : creator id (8 raw bytes)
//! byte 9        : payment type
//! bytes 10..14  : content id (u32)
//! bytes 14..    : metadata (opaque)
//! ```
//! On chain it is pushed right after the opcode: `0x6a <len> <payload>`.

use bitcoin::hashes::hex::{FromHex, ToHex};

use std::{convert::TryInto, fmt, str::FromStr};

pub const PAYLOAD_VERSION: u8 = 1;
/// Everything before the metadata.
pub const HEADER_LEN: usize = 14;
pub const OP_RETURN: u8 = 0x6a;
/// The push length is a single byte.
pub const MAX_PAYLOAD_LEN: usize = 255;

#[derive(Debug, PartialEq, Eq)]
pub enum PayloadError {
    /// The caller gave us something we can't encode.
    InvalidArgument(String),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::InvalidArgument(s) => write!(f, "Invalid argument: {}", s),
        }
    }
}

impl std::error::Error for PayloadError {}

/// 8 raw bytes identifying a creator, displayed as 16 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CreatorId(pub [u8; 8]);

impl FromStr for CreatorId {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(PayloadError::InvalidArgument(format!(
                "creator id must be 16 hex characters, got {}",
                s.len()
            )));
        }
        let bytes = Vec::<u8>::from_hex(s).map_err(|e| {
            PayloadError::InvalidArgument(format!("creator id '{}' is not hex: {}", s, e))
        })?;
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| PayloadError::InvalidArgument("creator id must be 8 bytes".into()))?;

        Ok(CreatorId(raw))
    }
}

impl fmt::Display for CreatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0[..].to_hex())
    }
}

impl serde::Serialize for CreatorId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// What the rest of the platform understands. The codec itself carries any byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentType {
    Tip = 1,
    Unlock = 2,
    Subscription = 3,
}

impl PaymentType {
    pub fn from_u8(value: u8) -> Option<PaymentType> {
        match value {
            1 => Some(PaymentType::Tip),
            2 => Some(PaymentType::Unlock),
            3 => Some(PaymentType::Subscription),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub version: u8,
    pub creator_id: CreatorId,
    pub payment_type: u8,
    pub content_id: u32,
    pub metadata: Vec<u8>,
}

impl Payload {
    /// A version 1 payload with no content id and no metadata.
    pub fn new(creator_id_hex: &str, payment_type: u8) -> Result<Payload, PayloadError> {
        Ok(Payload {
            version: PAYLOAD_VERSION,
            creator_id: CreatorId::from_str(creator_id_hex)?,
            payment_type,
            content_id: 0,
            metadata: Vec::new(),
        })
    }

    pub fn with_content_id(mut self, content_id: u32) -> Self {
        self.content_id = content_id;
        self
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.metadata.len());
        buf.push(self.version);
        buf.extend_from_slice(&self.creator_id.0);
        buf.push(self.payment_type);
        buf.extend_from_slice(&self.content_id.to_be_bytes());
        buf.extend_from_slice(&self.metadata);
        buf
    }

    /// Purely structural: returns `None` for anything shorter than the header and never
    /// looks at what the fields mean.
    pub fn decode(bytes: &[u8]) -> Option<Payload> {
        if bytes.len() < HEADER_LEN {
            return None;
        }

        let creator_id = CreatorId(bytes[1..9].try_into().ok()?);
        let content_id = u32::from_be_bytes(bytes[10..14].try_into().ok()?);

        Some(Payload {
            version: bytes[0],
            creator_id,
            payment_type: bytes[9],
            content_id,
            metadata: bytes[HEADER_LEN..].to_vec(),
        })
    }

    /// The full output script, `0x6a <len> <payload>`.
    pub fn op_return_script(&self) -> Result<Vec<u8>, PayloadError> {
        let payload = self.encode();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(PayloadError::InvalidArgument(format!(
                "payload is {} bytes, at most {} fit in an OP_RETURN push",
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }

        let mut script = Vec::with_capacity(payload.len() + 2);
        script.push(OP_RETURN);
        script.push(payload.len() as u8);
        script.extend_from_slice(&payload);
        Ok(script)
    }
}

/// Get the pushed bytes out of an OP_RETURN script. `None` if it's not an OP_RETURN or if
/// the script is shorter than the declared push.
pub fn op_return_data(script: &[u8]) -> Option<&[u8]> {
    if script.first() != Some(&OP_RETURN) {
        return None;
    }
    let len = *script.get(1)? as usize;

    script.get(2..2 + len)
}

/// Decode the payload out of an output script, if it carries one of ours.
pub fn decode_script(script: &[u8]) -> Option<Payload> {
    op_return_data(script).and_then(Payload::decode)
}
