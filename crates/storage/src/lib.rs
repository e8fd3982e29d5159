//! Durable chats and messages.
//!
//! [`ConversationStore`] is the only writer of chat state. Appending a message,
//! advancing the chat timestamp and deriving its title happen in one transaction.

use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ChatId, MessageId};
pub use sqlite::SqliteStorage;
pub use types::{
    ChatRecord, ChatSummary, ChatTranscript, DEFAULT_CHAT_TITLE, DERIVED_TITLE_MAX_CHARS,
    MessageRecord, MessageRole, NewMessage, TITLE_ELLIPSIS, derive_title,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ConversationStore: Send + Sync {
    /// All chats, most recently updated first.
    fn list_chats(&self) -> BoxFuture<'_, StorageResult<Vec<ChatSummary>>>;

    fn get_chat(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<ChatTranscript>>;

    fn create_chat(&self) -> BoxFuture<'_, StorageResult<ChatRecord>>;

    /// Inserts the message, advances `updated_at` and names a still-default chat
    /// after its first user message, all or nothing.
    fn append_message(
        &self,
        chat_id: ChatId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;

    fn rename_chat(&self, chat_id: ChatId, title: String)
    -> BoxFuture<'_, StorageResult<ChatRecord>>;

    /// Removes the chat and every message it owns.
    fn delete_chat(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<()>>;
}
