use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use murmur_core::{ChatOrchestrator, TurnOutcome};
use murmur_protocol::{
    ChatDetailView, ChatSummaryView, ChatView, CreateMessageRequest, MessageView,
    RenameChatRequest,
};
use murmur_storage::{
    ChatId, ChatRecord, ChatSummary, ChatTranscript, MessageRecord, MessageRole, NewMessage,
};
use snafu::{ResultExt, ensure};

use super::error::{ApiResult, BadRequestSnafu, ChatNotFoundSnafu, StorageSnafu, TurnSnafu};
use super::transport;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ChatOrchestrator,
}

impl AppState {
    pub fn new(orchestrator: ChatOrchestrator) -> Self {
        Self { orchestrator }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chats", get(list_chats).post(create_chat))
        .route(
            "/chats/{id}",
            get(get_chat).patch(rename_chat).delete(delete_chat),
        )
        .route("/chats/{id}/messages", post(create_message))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn list_chats(State(state): State<AppState>) -> ApiResult<Json<Vec<ChatSummaryView>>> {
    let chats = state
        .orchestrator
        .store()
        .list_chats()
        .await
        .context(StorageSnafu {
            stage: "route-list-chats",
        })?;

    Ok(Json(chats.iter().map(summary_view).collect()))
}

async fn create_chat(State(state): State<AppState>) -> ApiResult<(StatusCode, Json<ChatView>)> {
    let chat = state
        .orchestrator
        .store()
        .create_chat()
        .await
        .context(StorageSnafu {
            stage: "route-create-chat",
        })?;

    tracing::info!(chat_id = %chat.id, "chat created");
    Ok((StatusCode::CREATED, Json(chat_view(&chat))))
}

async fn get_chat(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<ChatDetailView>> {
    let chat_id = parse_chat_id(&raw_id)?;
    let transcript = state
        .orchestrator
        .store()
        .get_chat(chat_id)
        .await
        .context(StorageSnafu {
            stage: "route-get-chat",
        })?;

    Ok(Json(detail_view(&transcript)))
}

async fn rename_chat(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Json(body): Json<RenameChatRequest>,
) -> ApiResult<Json<ChatView>> {
    let chat_id = parse_chat_id(&raw_id)?;
    ensure!(
        !body.title.trim().is_empty(),
        BadRequestSnafu {
            stage: "route-rename-chat",
            details: "title must not be empty",
        }
    );

    let chat = state
        .orchestrator
        .store()
        .rename_chat(chat_id, body.title)
        .await
        .context(StorageSnafu {
            stage: "route-rename-chat",
        })?;

    Ok(Json(chat_view(&chat)))
}

async fn delete_chat(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> ApiResult<StatusCode> {
    let chat_id = parse_chat_id(&raw_id)?;
    state
        .orchestrator
        .store()
        .delete_chat(chat_id)
        .await
        .context(StorageSnafu {
            stage: "route-delete-chat",
        })?;

    tracing::info!(chat_id = %chat_id, "chat deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn create_message(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Json(body): Json<CreateMessageRequest>,
) -> ApiResult<Response> {
    let chat_id = parse_chat_id(&raw_id)?;
    ensure!(
        !body.content.trim().is_empty(),
        BadRequestSnafu {
            stage: "route-create-message",
            details: "content must not be empty",
        }
    );

    let role = match body.role.as_deref() {
        None => MessageRole::User,
        Some(raw) => raw.parse::<MessageRole>().context(StorageSnafu {
            stage: "route-create-message-role",
        })?,
    };

    if !body.stream {
        let message = state
            .orchestrator
            .append_only(chat_id, NewMessage::new(role, body.content))
            .await
            .context(TurnSnafu {
                stage: "route-append-message",
            })?;
        return Ok((StatusCode::CREATED, Json(message_view(&message))).into_response());
    }

    ensure!(
        role == MessageRole::User,
        BadRequestSnafu {
            stage: "route-stream-message",
            details: "only user messages can start a streamed reply",
        }
    );

    let turn = state
        .orchestrator
        .start_turn(chat_id, body.content)
        .await
        .context(TurnSnafu {
            stage: "route-start-turn",
        })?;
    tracing::info!(
        chat_id = %chat_id,
        user_message_id = %turn.user_message.id,
        "streaming turn started"
    );

    let task = turn.task;
    tokio::spawn(async move {
        match task.await {
            Ok(TurnOutcome::Failed { category }) => {
                tracing::warn!(chat_id = %chat_id, category = %category, "turn failed");
            }
            Ok(_) => {}
            Err(error) => {
                tracing::error!(chat_id = %chat_id, error = %error, "turn relay task crashed");
            }
        }
    });

    Ok(transport::sse_response(turn.fragments))
}

fn parse_chat_id(raw: &str) -> ApiResult<ChatId> {
    // A malformed id cannot name an existing chat.
    ChatId::parse(raw).map_err(|_| {
        ChatNotFoundSnafu {
            stage: "route-parse-chat-id",
            id: raw,
        }
        .build()
    })
}

pub fn chat_view(chat: &ChatRecord) -> ChatView {
    ChatView {
        id: chat.id.to_string(),
        title: chat.title.clone(),
        created_at: chat.created_at_unix_ms,
        updated_at: chat.updated_at_unix_ms,
    }
}

pub fn summary_view(summary: &ChatSummary) -> ChatSummaryView {
    ChatSummaryView {
        chat: chat_view(&summary.chat),
        message_count: summary.message_count,
        preview: summary.preview.clone(),
    }
}

pub fn message_view(message: &MessageRecord) -> MessageView {
    MessageView {
        id: message.id.to_string(),
        chat_id: message.chat_id.to_string(),
        seq: message.seq,
        role: message.role.to_string(),
        content: message.content.clone(),
        created_at: message.created_at_unix_ms,
    }
}

pub fn detail_view(transcript: &ChatTranscript) -> ChatDetailView {
    ChatDetailView {
        chat: chat_view(&transcript.chat),
        messages: transcript.messages.iter().map(message_view).collect(),
    }
}
