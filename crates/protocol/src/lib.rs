//! Wire contract shared by the chat server and its streaming clients.
//!
//! A streaming turn is a sequence of server-sent events. Each event is named
//! after the fragment it carries and its `data:` line is the JSON encoding of
//! that [`Fragment`].

mod api;
mod category;
mod fragment;

pub use api::{
    ChatDetailView, ChatSummaryView, ChatView, CreateMessageRequest, ErrorBody, MessageView,
    RenameChatRequest,
};
pub use category::ErrorCategory;
pub use fragment::{
    COMPLETION_EVENT, CONTENT_EVENT, ERROR_EVENT, Fragment, TEMPORARY_ID_PREFIX,
    is_temporary_id,
};
