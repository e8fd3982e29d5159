use std::fmt;
use std::str::FromStr;

use super::error::{InvalidInputSnafu, StorageError, StorageResult};
use super::ids::{ChatId, MessageId};

/// Title every chat starts with until its first user message names it.
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

/// Number of characters kept when a title is derived from message text.
pub const DERIVED_TITLE_MAX_CHARS: usize = 30;

pub const TITLE_ELLIPSIS: &str = "...";

pub const PREVIEW_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => InvalidInputSnafu {
                stage: "message-role-parse",
                details: format!("unknown message role '{raw}'"),
            }
            .fail(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRecord {
    pub id: ChatId,
    pub title: String,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

/// Listing entry: chat metadata plus a short look at the newest message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSummary {
    pub chat: ChatRecord,
    pub message_count: u64,
    pub preview: Option<String>,
}

/// A chat with its full history in creation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTranscript {
    pub chat: ChatRecord,
    pub messages: Vec<MessageRecord>,
}

impl ChatTranscript {
    pub fn find_message(&self, message_id: MessageId) -> Option<&MessageRecord> {
        self.messages.iter().find(|message| message.id == message_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub seq: u64,
    pub role: MessageRole,
    pub content: String,
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Title derived from the first user message: whitespace collapsed, then cut to
/// [`DERIVED_TITLE_MAX_CHARS`] characters with an ellipsis only when something was cut.
pub fn derive_title(content: &str) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, DERIVED_TITLE_MAX_CHARS)
}

pub(crate) fn preview_text(content: &str) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, PREVIEW_MAX_CHARS)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{TITLE_ELLIPSIS}", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_content_becomes_title_verbatim() {
        assert_eq!(derive_title("Hello"), "Hello");
    }

    #[test]
    fn content_at_limit_gets_no_ellipsis() {
        let exact = "a".repeat(DERIVED_TITLE_MAX_CHARS);
        assert_eq!(derive_title(&exact), exact);
    }

    #[test]
    fn long_content_is_cut_with_ellipsis() {
        let long = "b".repeat(DERIVED_TITLE_MAX_CHARS + 1);
        let title = derive_title(&long);
        assert_eq!(title, format!("{}...", "b".repeat(DERIVED_TITLE_MAX_CHARS)));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let long = "é".repeat(DERIVED_TITLE_MAX_CHARS + 5);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), DERIVED_TITLE_MAX_CHARS + TITLE_ELLIPSIS.len());
    }

    #[test]
    fn newlines_collapse_into_single_spaces() {
        assert_eq!(derive_title("  plan\n\nthe   trip "), "plan the trip");
    }

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!("Assistant".parse::<MessageRole>().expect("role"), MessageRole::Assistant);
        assert!("tool".parse::<MessageRole>().is_err());
    }
}
