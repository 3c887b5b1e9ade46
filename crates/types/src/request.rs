//! Client requests and their canonical byte encoding.
//!
//! Canonical bytes are a fixed little-endian layout with length-prefixed
//! strings. They feed digests and signatures, so the layout must never
//! depend on the serializer used for the wire.

use crate::{ClientId, Digest};
use serde::{Deserialize, Serialize};

/// Operation carried by a single client request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Store `value` under `key`.
    Put { key: String, value: Vec<u8> },
    /// Read the value stored under `key`.
    Get { key: String },
    /// Move `amount` units between two balance accounts.
    Transfer {
        from: String,
        to: String,
        amount: u64,
    },
    /// Placeholder that fills a sequence position without touching state.
    Noop,
}

impl Operation {
    fn write_canonical(&self, out: &mut Vec<u8>) {
        match self {
            Operation::Put { key, value } => {
                out.push(0);
                put_bytes(out, key.as_bytes());
                put_bytes(out, value);
            }
            Operation::Get { key } => {
                out.push(1);
                put_bytes(out, key.as_bytes());
            }
            Operation::Transfer { from, to, amount } => {
                out.push(2);
                put_bytes(out, from.as_bytes());
                put_bytes(out, to.as_bytes());
                out.extend_from_slice(&amount.to_le_bytes());
            }
            Operation::Noop => out.push(3),
        }
    }
}

/// A single transaction submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client: ClientId,
    /// Client-local timestamp; distinguishes otherwise identical requests.
    pub timestamp: u64,
    pub operation: Operation,
}

impl ClientRequest {
    pub fn new(client: ClientId, timestamp: u64, operation: Operation) -> Self {
        Self {
            client,
            timestamp,
            operation,
        }
    }

    /// Null request used to fill unassigned positions after a view change.
    pub fn noop(timestamp: u64) -> Self {
        Self::new(ClientId::SYSTEM, timestamp, Operation::Noop)
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.operation, Operation::Noop)
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.client.0.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        self.operation.write_canonical(&mut out);
        out
    }
}

/// Order-sensitive digest over a batch's request list.
///
/// Reordering, adding or removing any request changes the digest.
pub fn batch_digest(requests: &[ClientRequest]) -> Digest {
    let mut out = Vec::with_capacity(requests.len() * 64 + 8);
    out.extend_from_slice(&(requests.len() as u64).to_le_bytes());
    for request in requests {
        put_bytes(&mut out, &request.canonical_bytes());
    }
    Digest::from_bytes(&out)
}

/// Outcome of executing one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationResult {
    Stored,
    Value(Option<Vec<u8>>),
    Transferred,
    InsufficientFunds,
    /// Optimistic validation rejected this request.
    Aborted,
    /// Request belonged to a batch that was already executed.
    Duplicate,
    Noop,
}

impl OperationResult {
    pub fn write_canonical(&self, out: &mut Vec<u8>) {
        match self {
            OperationResult::Stored => out.push(0),
            OperationResult::Value(None) => out.push(1),
            OperationResult::Value(Some(value)) => {
                out.push(2);
                put_bytes(out, value);
            }
            OperationResult::Transferred => out.push(3),
            OperationResult::InsufficientFunds => out.push(4),
            OperationResult::Aborted => out.push(5),
            OperationResult::Duplicate => out.push(6),
            OperationResult::Noop => out.push(7),
        }
    }
}

/// Keys read (with the value observed) and written while speculatively
/// executing one request against a state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadWriteSet {
    pub reads: Vec<(String, Option<Vec<u8>>)>,
    pub writes: Vec<(String, Vec<u8>)>,
}

impl ReadWriteSet {
    pub fn write_canonical(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.reads.len() as u64).to_le_bytes());
        for (key, value) in &self.reads {
            put_bytes(out, key.as_bytes());
            match value {
                Some(value) => {
                    out.push(1);
                    put_bytes(out, value);
                }
                None => out.push(0),
            }
        }
        out.extend_from_slice(&(self.writes.len() as u64).to_le_bytes());
        for (key, value) in &self.writes {
            put_bytes(out, key.as_bytes());
            put_bytes(out, value);
        }
    }

    /// Value observed for `key`, if the key was read.
    pub fn observed(&self, key: &str) -> Option<&Option<Vec<u8>>> {
        self.reads.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}
