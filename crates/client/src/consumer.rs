use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use murmur_protocol::{
    ChatDetailView, ChatSummaryView, ChatView, CreateMessageRequest, ErrorBody, ErrorCategory,
    Fragment, MessageView, RenameChatRequest,
};
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::decoder::{FrameDecoder, decode_fragment};
use super::error::{ClientError, ClientResult, HttpSnafu, StatusSnafu};
use super::state::{ChatStateStore, FragmentEffect, TurnTicket};

pub const UNEXPECTED_END_MESSAGE: &str = "stream ended unexpectedly";

/// Thin typed wrapper over the murmur HTTP routes.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http_client(reqwest::Client::new(), base_url)
    }

    pub fn with_http_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn health(&self) -> ClientResult<()> {
        let response = self
            .http
            .get(self.url("/health"))
            .send()
            .await
            .context(HttpSnafu { stage: "health" })?;
        ensure_success(response, "health").await.map(|_| ())
    }

    pub async fn list_chats(&self) -> ClientResult<Vec<ChatSummaryView>> {
        let response = self
            .http
            .get(self.url("/chats"))
            .send()
            .await
            .context(HttpSnafu {
                stage: "list-chats",
            })?;
        read_json(response, "list-chats").await
    }

    pub async fn create_chat(&self) -> ClientResult<ChatView> {
        let response = self
            .http
            .post(self.url("/chats"))
            .send()
            .await
            .context(HttpSnafu {
                stage: "create-chat",
            })?;
        read_json(response, "create-chat").await
    }

    pub async fn get_chat(&self, chat_id: &str) -> ClientResult<ChatDetailView> {
        let response = self
            .http
            .get(self.url(&format!("/chats/{chat_id}")))
            .send()
            .await
            .context(HttpSnafu { stage: "get-chat" })?;
        read_json(response, "get-chat").await
    }

    pub async fn rename_chat(&self, chat_id: &str, title: &str) -> ClientResult<ChatView> {
        let response = self
            .http
            .patch(self.url(&format!("/chats/{chat_id}")))
            .json(&RenameChatRequest {
                title: title.to_string(),
            })
            .send()
            .await
            .context(HttpSnafu {
                stage: "rename-chat",
            })?;
        read_json(response, "rename-chat").await
    }

    pub async fn delete_chat(&self, chat_id: &str) -> ClientResult<()> {
        let response = self
            .http
            .delete(self.url(&format!("/chats/{chat_id}")))
            .send()
            .await
            .context(HttpSnafu {
                stage: "delete-chat",
            })?;
        ensure_success(response, "delete-chat").await.map(|_| ())
    }

    /// Stores a message without asking the model for a reply.
    pub async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
        role: Option<&str>,
    ) -> ClientResult<MessageView> {
        let request = CreateMessageRequest {
            content: content.to_string(),
            role: role.map(str::to_string),
            stream: false,
        };
        let response = self
            .http
            .post(self.url(&format!("/chats/{chat_id}/messages")))
            .json(&request)
            .send()
            .await
            .context(HttpSnafu {
                stage: "send-message",
            })?;
        read_json(response, "send-message").await
    }

    /// Opens a streamed turn. The response body is the raw event stream.
    pub async fn stream_message(
        &self,
        chat_id: &str,
        content: &str,
    ) -> ClientResult<reqwest::Response> {
        let response = self
            .http
            .post(self.url(&format!("/chats/{chat_id}/messages")))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&CreateMessageRequest::streamed(content))
            .send()
            .await
            .context(HttpSnafu {
                stage: "stream-message",
            })?;
        ensure_success(response, "stream-message").await
    }
}

async fn ensure_success(
    response: reqwest::Response,
    stage: &'static str,
) -> ClientResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.json::<ErrorBody>().await.ok();
    StatusSnafu {
        stage,
        status: status.as_u16(),
        body,
    }
    .fail()
}

async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    stage: &'static str,
) -> ClientResult<T> {
    ensure_success(response, stage)
        .await?
        .json::<T>()
        .await
        .context(HttpSnafu { stage })
}

/// Callbacks for one streamed turn. None of them fire after cancellation.
pub trait StreamObserver: Send + 'static {
    fn on_content(&mut self, _text: &str) {}
    fn on_complete(&mut self, _message_id: &str) {}
    fn on_error(&mut self, _message: &str) {}
}

/// Observer that ignores every callback.
pub struct NoopObserver;

impl StreamObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed { message_id: String },
    Failed { message: String },
    Cancelled,
}

/// Cancels a running [`StreamSession`]. Dropping the handle cancels as well.
#[must_use = "dropping the handle cancels the session"]
pub struct SessionHandle {
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl SessionHandle {
    /// Aborts the connection. Returns false when the session already ended.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

pub type SharedChatState = Arc<Mutex<ChatStateStore>>;

/// One streamed turn applied to a shared [`ChatStateStore`].
pub struct StreamSession {
    client: ChatClient,
    state: SharedChatState,
    ticket: TurnTicket,
    content: String,
}

impl StreamSession {
    /// Adds the local placeholders, then spawns the task that reads the stream.
    /// The stream runs only while the returned [`SessionHandle`] is alive.
    pub fn start(
        client: ChatClient,
        state: SharedChatState,
        chat_id: &str,
        content: &str,
        observer: impl StreamObserver,
    ) -> ClientResult<(SessionHandle, JoinHandle<SessionOutcome>)> {
        let ticket = lock(&state).begin_turn(chat_id, content).map_err(|rejection| {
            tracing::debug!(chat_id, ?rejection, "turn refused locally");
            ClientError::AlreadyStreaming {
                stage: "stream-session-start",
                chat_id: chat_id.to_string(),
            }
        })?;

        let session = Self {
            client,
            state,
            ticket,
            content: content.to_string(),
        };
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(session.run(observer, cancel_rx));

        Ok((
            SessionHandle {
                cancel_tx: Some(cancel_tx),
            },
            task,
        ))
    }

    async fn run(
        self,
        observer: impl StreamObserver,
        cancel_rx: oneshot::Receiver<()>,
    ) -> SessionOutcome {
        tokio::select! {
            // Dropping `drive` drops the response body, which closes the connection.
            _ = cancel_rx => {
                lock(&self.state).cancel_turn(&self.ticket);
                tracing::debug!(chat_id = %self.ticket.chat_id, "stream session cancelled");
                SessionOutcome::Cancelled
            }
            outcome = self.drive(observer) => outcome,
        }
    }

    async fn drive(&self, mut observer: impl StreamObserver) -> SessionOutcome {
        let response = match self
            .client
            .stream_message(&self.ticket.chat_id, &self.content)
            .await
        {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(chat_id = %self.ticket.chat_id, error = %error, "stream request failed");
                let message = error.user_message();
                lock(&self.state).fail_turn(&self.ticket, &message);
                observer.on_error(&message);
                return SessionOutcome::Failed { message };
            }
        };

        let mut body = response.bytes_stream();
        let mut decoder = FrameDecoder::new();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    tracing::warn!(chat_id = %self.ticket.chat_id, error = %error, "stream body failed");
                    break;
                }
            };

            for frame in decoder.push(&chunk) {
                let fragment = match decode_fragment(&frame) {
                    Ok(fragment) => fragment,
                    Err(error) => {
                        tracing::warn!(
                            chat_id = %self.ticket.chat_id,
                            event = frame.event_name(),
                            error = %error,
                            "skipping malformed frame"
                        );
                        continue;
                    }
                };

                if let Some(outcome) = self.apply(&fragment, &mut observer) {
                    return outcome;
                }
            }
        }

        let fragment = Fragment::Error {
            message: UNEXPECTED_END_MESSAGE.to_string(),
            category: ErrorCategory::Unknown,
        };
        self.apply(&fragment, &mut observer)
            .unwrap_or(SessionOutcome::Failed {
                message: UNEXPECTED_END_MESSAGE.to_string(),
            })
    }

    /// Returns the outcome once a terminal fragment was applied.
    fn apply(
        &self,
        fragment: &Fragment,
        observer: &mut impl StreamObserver,
    ) -> Option<SessionOutcome> {
        let effect = lock(&self.state).apply_fragment(&self.ticket, fragment);
        match effect {
            FragmentEffect::Appended => {
                if let Fragment::Content { text } = fragment {
                    observer.on_content(text);
                }
                None
            }
            FragmentEffect::Completed { message_id } => {
                observer.on_complete(&message_id);
                Some(SessionOutcome::Completed { message_id })
            }
            FragmentEffect::Failed { message } => {
                observer.on_error(&message);
                Some(SessionOutcome::Failed { message })
            }
            FragmentEffect::Stale => {
                tracing::debug!(chat_id = %self.ticket.chat_id, "ignoring fragment for an inactive session");
                None
            }
        }
    }
}

fn lock(state: &SharedChatState) -> std::sync::MutexGuard<'_, ChatStateStore> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
