//! Wire vocabulary shared by the session engine and its collaborators.
//!
//! Every frame on the duplex channel is a JSON object tagged by `type`.
pub mod error;
pub mod ids;
pub mod message;

pub use error::{ProtocolError, ProtocolResult};
pub use ids::{ConversationId, RecordId, SessionId};
pub use message::{
    Attachment, ClientMessage, ContentPart, ConversationRef, ImageUrl, Inbound, ServerMessage,
    TokenUsage,
};
