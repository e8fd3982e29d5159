use serde::{Deserialize, Serialize};

use super::category::ErrorCategory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    pub id: String,
    pub title: String,
    /// Unix milliseconds.
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummaryView {
    #[serde(flatten)]
    pub chat: ChatView,
    pub message_count: u64,
    #[serde(default)]
    pub preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: String,
    pub chat_id: String,
    pub seq: u64,
    pub role: String,
    pub content: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDetailView {
    #[serde(flatten)]
    pub chat: ChatView,
    pub messages: Vec<MessageView>,
}

/// Body of `POST /chats/{id}/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// When set the reply is streamed back as server-sent events.
    #[serde(default)]
    pub stream: bool,
}

impl CreateMessageRequest {
    pub fn streamed(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            role: None,
            stream: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameChatRequest {
    pub title: String,
}

/// JSON body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub category: ErrorCategory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_flattens_chat_fields() {
        let summary = ChatSummaryView {
            chat: ChatView {
                id: "c1".to_string(),
                title: "New Chat".to_string(),
                created_at: 1,
                updated_at: 2,
            },
            message_count: 0,
            preview: None,
        };
        let value = serde_json::to_value(&summary).expect("encode");
        assert_eq!(value["id"], "c1");
        assert_eq!(value["updatedAt"], 2);
        assert_eq!(value["messageCount"], 0);
    }

    #[test]
    fn message_request_defaults_to_a_plain_user_message() {
        let request: CreateMessageRequest =
            serde_json::from_str(r#"{"content":"hi"}"#).expect("decode");
        assert_eq!(request.role, None);
        assert!(!request.stream);
    }
}
