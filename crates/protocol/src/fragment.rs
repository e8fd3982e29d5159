use serde::{Deserialize, Serialize};

use super::category::ErrorCategory;

pub const CONTENT_EVENT: &str = "content";
pub const COMPLETION_EVENT: &str = "completion";
pub const ERROR_EVENT: &str = "error";

/// Prefix reserved for client-minted message ids that the store has not acknowledged.
pub const TEMPORARY_ID_PREFIX: &str = "temp-";

pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMPORARY_ID_PREFIX)
}

/// One unit of a streamed turn as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fragment {
    Content {
        text: String,
    },
    Completion {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Error {
        message: String,
        #[serde(default)]
        category: ErrorCategory,
    },
}

impl Fragment {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content { text: text.into() }
    }

    pub fn completion(message_id: impl Into<String>) -> Self {
        Self::Completion {
            message_id: message_id.into(),
        }
    }

    /// Error fragment carrying the sanitized text for `category`.
    pub fn error(category: ErrorCategory) -> Self {
        Self::Error {
            message: category.user_message().to_string(),
            category,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Content { .. } => CONTENT_EVENT,
            Self::Completion { .. } => COMPLETION_EVENT,
            Self::Error { .. } => ERROR_EVENT,
        }
    }

    /// Completion and error end a stream; nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Content { .. })
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain strings, so encoding cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            String::from(r#"{"type":"error","message":"unencodable fragment","category":"unknown"}"#)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_uses_camel_case_message_id() {
        let json = Fragment::completion("abc").to_json();
        assert_eq!(json, r#"{"type":"completion","messageId":"abc"}"#);
    }

    #[test]
    fn error_without_category_decodes_as_unknown() {
        let fragment: Fragment =
            serde_json::from_str(r#"{"type":"error","message":"boom"}"#).expect("decodes");
        assert_eq!(
            fragment,
            Fragment::Error {
                message: "boom".to_string(),
                category: ErrorCategory::Unknown,
            }
        );
        assert!(fragment.is_terminal());
    }

    #[test]
    fn content_is_not_terminal() {
        let fragment = Fragment::content("Hi");
        assert_eq!(fragment.event_name(), CONTENT_EVENT);
        assert!(!fragment.is_terminal());
    }

    #[test]
    fn temporary_ids_are_detected_by_prefix() {
        assert!(is_temporary_id("temp-1"));
        assert!(!is_temporary_id("0190a5b2-7c4e-7000-8000-000000000000"));
    }
}
