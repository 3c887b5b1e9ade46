//! Network messages for the replication protocol.
//!
//! Every message is a plain value type. [`Message`] is the closed sum of all
//! of them, and [`codec`] turns it into versioned wire bytes.

pub mod batch;
pub mod codec;
pub mod message;
pub mod response;
pub mod view_change;
pub mod vote;

pub use batch::{ClientBatch, Proposal};
pub use codec::{decode_message, encode_message, CodecError, WIRE_VERSION};
pub use message::{Message, StaleKey};
pub use response::ClientResponse;
pub use view_change::{NewView, PreparedCertificate, ViewChangeVote};
pub use vote::{CheckpointVote, ExecuteSignal, Vote};
