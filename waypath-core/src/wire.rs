//! Framing: 4 bytes LE total size (header included) + 2 bytes LE message type + bincode body.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::*;

const SIZE_LEN: usize = 4;
const TYPE_LEN: usize = 2;
/// Size of the common frame header.
pub const HEADER_LEN: usize = SIZE_LEN + TYPE_LEN;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Wire type codes.
pub mod msg_type {
    pub const CORE_DATA: u16 = 1;
    pub const DV_LEARN: u16 = 2;
    pub const DV_BOX: u16 = 3;
    pub const FRAGMENT: u16 = 4;
    pub const RELIABILITY_BOX: u16 = 5;
    pub const RELIABILITY_ACK: u16 = 6;
    pub const BACKCHANNEL: u16 = 7;
    pub const VALIDATION_CHALLENGE: u16 = 8;
    pub const VALIDATION_RESPONSE: u16 = 9;
}

impl Message {
    pub fn type_code(&self) -> u16 {
        match self {
            Message::CoreData(_) => msg_type::CORE_DATA,
            Message::DvLearn(_) => msg_type::DV_LEARN,
            Message::DvBox(_) => msg_type::DV_BOX,
            Message::Fragment(_) => msg_type::FRAGMENT,
            Message::ReliabilityBox(_) => msg_type::RELIABILITY_BOX,
            Message::ReliabilityAck(_) => msg_type::RELIABILITY_ACK,
            Message::Backchannel(_) => msg_type::BACKCHANNEL,
            Message::ValidationChallenge(_) => msg_type::VALIDATION_CHALLENGE,
            Message::ValidationResponse(_) => msg_type::VALIDATION_RESPONSE,
        }
    }
}

fn body(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    match msg {
        Message::CoreData(m) => bincode::serialize(m),
        Message::DvLearn(m) => bincode::serialize(m),
        Message::DvBox(m) => bincode::serialize(m),
        Message::Fragment(m) => bincode::serialize(m),
        Message::ReliabilityBox(m) => bincode::serialize(m),
        Message::ReliabilityAck(m) => bincode::serialize(m),
        Message::Backchannel(m) => bincode::serialize(m),
        Message::ValidationChallenge(m) => bincode::serialize(m),
        Message::ValidationResponse(m) => bincode::serialize(m),
    }
}

/// Encode a message into a single frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = body(msg).map_err(FrameEncodeError::Encode)?;
    let total = HEADER_LEN + payload.len();
    if total > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&msg.type_code().to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Encoded size of a message, header included.
pub fn encoded_len(msg: &Message) -> Result<usize, FrameEncodeError> {
    let size = match msg {
        Message::CoreData(m) => bincode::serialized_size(m),
        Message::DvLearn(m) => bincode::serialized_size(m),
        Message::DvBox(m) => bincode::serialized_size(m),
        Message::Fragment(m) => bincode::serialized_size(m),
        Message::ReliabilityBox(m) => bincode::serialized_size(m),
        Message::ReliabilityAck(m) => bincode::serialized_size(m),
        Message::Backchannel(m) => bincode::serialized_size(m),
        Message::ValidationChallenge(m) => bincode::serialized_size(m),
        Message::ValidationResponse(m) => bincode::serialized_size(m),
    }
    .map_err(FrameEncodeError::Encode)?;
    Ok(HEADER_LEN + size as usize)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, FrameDecodeError> {
    bincode::deserialize(body).map_err(FrameDecodeError::Decode)
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameDecodeError::NeedMore);
    }
    let total = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if total > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let total = total as usize;
    if total < HEADER_LEN {
        return Err(FrameDecodeError::BadSize);
    }
    if bytes.len() < total {
        return Err(FrameDecodeError::NeedMore);
    }
    let code = u16::from_le_bytes([bytes[4], bytes[5]]);
    let b = &bytes[HEADER_LEN..total];
    let msg = match code {
        msg_type::CORE_DATA => Message::CoreData(decode_body(b)?),
        msg_type::DV_LEARN => Message::DvLearn(decode_body(b)?),
        msg_type::DV_BOX => Message::DvBox(decode_body(b)?),
        msg_type::FRAGMENT => Message::Fragment(decode_body(b)?),
        msg_type::RELIABILITY_BOX => Message::ReliabilityBox(decode_body(b)?),
        msg_type::RELIABILITY_ACK => Message::ReliabilityAck(decode_body(b)?),
        msg_type::BACKCHANNEL => Message::Backchannel(decode_body(b)?),
        msg_type::VALIDATION_CHALLENGE => Message::ValidationChallenge(decode_body(b)?),
        msg_type::VALIDATION_RESPONSE => Message::ValidationResponse(decode_body(b)?),
        other => return Err(FrameDecodeError::UnknownType(other)),
    };
    Ok((msg, total))
}

/// Decode a buffer that must hold exactly one frame.
pub fn decode_exact(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    let (msg, n) = decode_frame(bytes)?;
    if n != bytes.len() {
        return Err(FrameDecodeError::TrailingBytes);
    }
    Ok(msg)
}

/// Serialize a non-frame value (peer store blobs, DV plaintext).
pub fn to_blob<T: Serialize>(v: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(v)
}

pub fn from_blob<T: DeserializeOwned>(b: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(b)
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("size field smaller than header")]
    BadSize,
    #[error("trailing bytes after frame")]
    TrailingBytes,
    #[error("unknown message type {0}")]
    UnknownType(u16),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
