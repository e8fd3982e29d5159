//! Client for the murmur chat server.
//!
//! [`ChatClient`] covers the plain routes. [`StreamSession`] runs one streamed
//! turn: it decodes the event stream with [`FrameDecoder`], applies each
//! fragment to a shared [`ChatStateStore`] and reports progress to a
//! [`StreamObserver`].

mod consumer;
mod decoder;
mod error;
mod state;

pub use consumer::{
    ChatClient, NoopObserver, SessionHandle, SessionOutcome, SharedChatState, StreamObserver,
    StreamSession, UNEXPECTED_END_MESSAGE,
};
pub use decoder::{FrameDecoder, SseFrame, decode_fragment};
pub use error::{ClientError, ClientResult};
pub use state::{
    ChatStateStore, ClientChat, ClientMessage, FragmentEffect, MessageStatus, Role,
    StreamSessionId, StreamState, StreamTransition, StreamTransitionRejection,
    StreamTransitionResult, TurnTicket, reconcile_messages,
};
