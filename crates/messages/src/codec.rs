//! Message encoding and decoding for transport.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][tag: u8][payload: bincode-encoded variant body]
//! ```
//!
//! - Version is currently `1`
//! - The tag names the [`Message`] variant, so each body decodes with its
//!   own type and an unknown tag fails before any payload is read.

use crate::message::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

const TAG_CLIENT_BATCH: u8 = 1;
const TAG_PROPOSAL: u8 = 2;
const TAG_PREPARE_VOTE: u8 = 3;
const TAG_COMMIT_VOTE: u8 = 4;
const TAG_EXECUTE_SIGNAL: u8 = 5;
const TAG_CHECKPOINT_VOTE: u8 = 6;
const TAG_VIEW_CHANGE_VOTE: u8 = 7;
const TAG_NEW_VIEW: u8 = 8;
const TAG_CLIENT_RESPONSE: u8 = 9;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("Message too short")]
    MessageTooShort,

    #[error("Unknown message tag: {0}")]
    UnknownTag(u8),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

fn body<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(payload).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Encode a message to wire format.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, CodecError> {
    let (tag, payload) = match message {
        Message::ClientBatch(m) => (TAG_CLIENT_BATCH, body(m)?),
        Message::Proposal(m) => (TAG_PROPOSAL, body(m)?),
        Message::PrepareVote(m) => (TAG_PREPARE_VOTE, body(m)?),
        Message::CommitVote(m) => (TAG_COMMIT_VOTE, body(m)?),
        Message::ExecuteSignal(m) => (TAG_EXECUTE_SIGNAL, body(m)?),
        Message::CheckpointVote(m) => (TAG_CHECKPOINT_VOTE, body(m)?),
        Message::ViewChangeVote(m) => (TAG_VIEW_CHANGE_VOTE, body(m)?),
        Message::NewView(m) => (TAG_NEW_VIEW, body(m)?),
        Message::ClientResponse(m) => (TAG_CLIENT_RESPONSE, body(m)?),
    };

    let mut bytes = Vec::with_capacity(2 + payload.len());
    bytes.push(WIRE_VERSION);
    bytes.push(tag);
    bytes.extend(payload);
    Ok(bytes)
}

/// Decode a message from wire format.
pub fn decode_message(data: &[u8]) -> Result<Message, CodecError> {
    let (&version, rest) = data.split_first().ok_or(CodecError::MessageTooShort)?;
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    let (&tag, payload) = rest.split_first().ok_or(CodecError::MessageTooShort)?;

    Ok(match tag {
        TAG_CLIENT_BATCH => Message::ClientBatch(parse(payload)?),
        TAG_PROPOSAL => Message::Proposal(parse(payload)?),
        TAG_PREPARE_VOTE => Message::PrepareVote(parse(payload)?),
        TAG_COMMIT_VOTE => Message::CommitVote(parse(payload)?),
        TAG_EXECUTE_SIGNAL => Message::ExecuteSignal(parse(payload)?),
        TAG_CHECKPOINT_VOTE => Message::CheckpointVote(parse(payload)?),
        TAG_VIEW_CHANGE_VOTE => Message::ViewChangeVote(parse(payload)?),
        TAG_NEW_VIEW => Message::NewView(parse(payload)?),
        TAG_CLIENT_RESPONSE => Message::ClientResponse(parse(payload)?),
        other => return Err(CodecError::UnknownTag(other)),
    })
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode_message(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        decode_message(data)
    }
}
