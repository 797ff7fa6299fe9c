//! Shared protocol definitions for the Mapmo chat service.
//! Socket frames and REST payloads live here so the client runtime and any
//! tooling agree on one set of message shapes.

pub mod frame;
pub mod rest;
pub mod time;

pub use frame::{
    decode, ChatMessage, ClientFrame, ConversationEnded, CountdownState, Decoded, Envelope,
    FrameError, KeepStatus, MatchFound, MatchedUser, ServerFrame, TypingStatus,
};

pub type UserId = i64;
pub type ConversationId = i64;
pub type ServerMessageId = i64;
