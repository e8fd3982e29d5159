use std::sync::Arc;

use dashmap::DashSet;
use murmur_llm::{
    LlmProvider, ProviderEventStream, ProviderMessage, Role, StreamEventPayload, StreamRequest,
};
use murmur_protocol::{ErrorCategory, Fragment};
use murmur_storage::{
    ChatId, ConversationStore, MessageRecord, MessageRole, NewMessage, StorageError,
};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::mpsc;

use super::error::{CoreResult, EmptyContentSnafu, StoreSnafu, TurnInProgressSnafu};
use super::turn::{TurnGuard, TurnHandle, TurnOutcome, TurnPhase};

/// Fragments buffered between the relay task and the transport.
pub const FRAGMENT_CHANNEL_CAPACITY: usize = 64;

pub const UNEXPECTED_END_MESSAGE: &str = "stream ended unexpectedly";

/// Drives one user turn: persist the prompt, stream the reply, persist the answer.
#[derive(Clone)]
pub struct ChatOrchestrator {
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn LlmProvider>,
    active_turns: Arc<DashSet<ChatId>>,
}

impl ChatOrchestrator {
    pub fn new(store: Arc<dyn ConversationStore>, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            store,
            provider,
            active_turns: Arc::new(DashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn is_turn_active(&self, chat_id: ChatId) -> bool {
        self.active_turns.contains(&chat_id)
    }

    /// Persists the user message and spawns the relay task.
    ///
    /// Errors returned here happen before any model call: the chat is busy, the
    /// content is empty, or the store refused the prompt.
    pub async fn start_turn(&self, chat_id: ChatId, content: String) -> CoreResult<TurnHandle> {
        ensure!(
            !content.trim().is_empty(),
            EmptyContentSnafu {
                stage: "start-turn-validate",
            }
        );

        let guard = TurnGuard::acquire(&self.active_turns, chat_id).context(
            TurnInProgressSnafu {
                stage: "start-turn-guard",
                chat_id,
            },
        )?;

        tracing::debug!(chat_id = %chat_id, phase = %TurnPhase::PersistingUser, "turn started");
        let user_message = self
            .store
            .append_message(chat_id, NewMessage::user(content))
            .await
            .context(StoreSnafu {
                stage: "start-turn-persist-user",
            })?;

        let (sink, fragments) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        let relay = TurnRelay {
            chat_id,
            store: Arc::clone(&self.store),
            provider: Arc::clone(&self.provider),
            sink,
        };
        let task = tokio::spawn(async move {
            let outcome = relay.run().await;
            drop(guard);
            outcome
        });

        Ok(TurnHandle {
            user_message,
            fragments,
            task,
        })
    }

    /// Stores one message without involving the model.
    pub async fn append_only(
        &self,
        chat_id: ChatId,
        message: NewMessage,
    ) -> CoreResult<MessageRecord> {
        self.store
            .append_message(chat_id, message)
            .await
            .context(StoreSnafu {
                stage: "append-only",
            })
    }
}

struct TurnRelay {
    chat_id: ChatId,
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn LlmProvider>,
    sink: mpsc::Sender<Fragment>,
}

enum RelayEnd {
    Answer(String),
    Stopped(TurnOutcome),
}

impl TurnRelay {
    async fn run(self) -> TurnOutcome {
        let outcome = match self.relay().await {
            RelayEnd::Answer(answer) => self.persist_answer(answer).await,
            RelayEnd::Stopped(outcome) => outcome,
        };

        tracing::info!(chat_id = %self.chat_id, phase = %outcome.phase(), "turn finished");
        outcome
    }

    async fn relay(&self) -> RelayEnd {
        let chat_id = self.chat_id;
        tracing::debug!(chat_id = %chat_id, phase = %TurnPhase::AwaitingModel, "loading history");

        let transcript = match self.store.get_chat(chat_id).await {
            Ok(transcript) => transcript,
            Err(error) => {
                tracing::error!(
                    chat_id = %chat_id,
                    stage = error.stage(),
                    error = %error,
                    "failed to load chat history"
                );
                let category = if error.is_not_found() {
                    ErrorCategory::NotFound
                } else {
                    ErrorCategory::Unknown
                };
                return RelayEnd::Stopped(self.fail(Fragment::error(category)).await);
            }
        };

        let messages = transcript
            .messages
            .iter()
            .map(|message| ProviderMessage::new(provider_role(message.role), &message.content))
            .collect::<Vec<_>>();
        let request = StreamRequest::new(
            chat_id.to_string(),
            self.provider.default_model(),
            messages,
        );

        let handle = match self.provider.stream_chat(request) {
            Ok(handle) => handle,
            Err(error) => {
                let category = error.category();
                tracing::error!(
                    chat_id = %chat_id,
                    provider_id = %self.provider.id(),
                    category = %category,
                    error = %error,
                    "provider refused stream request"
                );
                return RelayEnd::Stopped(self.fail(Fragment::error(category)).await);
            }
        };
        tokio::spawn(handle.worker);

        self.relay_events(handle.stream).await
    }

    async fn relay_events(&self, mut stream: ProviderEventStream) -> RelayEnd {
        let chat_id = self.chat_id;
        tracing::debug!(chat_id = %chat_id, phase = %TurnPhase::Relaying, "relaying model output");

        let mut accumulated = String::new();
        let mut fragments: usize = 0;

        loop {
            let event = tokio::select! {
                _ = self.sink.closed() => {
                    stream.cancel();
                    tracing::info!(chat_id = %chat_id, fragments, "client left mid-stream");
                    return RelayEnd::Stopped(TurnOutcome::Cancelled);
                }
                event = stream.recv() => event,
            };

            match event {
                Some(StreamEventPayload::Delta(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    accumulated.push_str(&text);
                    fragments += 1;
                    if self.sink.send(Fragment::content(text)).await.is_err() {
                        stream.cancel();
                        tracing::info!(chat_id = %chat_id, fragments, "client left mid-stream");
                        return RelayEnd::Stopped(TurnOutcome::Cancelled);
                    }
                }
                Some(StreamEventPayload::Done) => break,
                Some(StreamEventPayload::Error(failure)) => {
                    tracing::warn!(
                        chat_id = %chat_id,
                        category = %failure.category,
                        fragments,
                        discarded_chars = accumulated.chars().count(),
                        "model stream failed; partial answer discarded"
                    );
                    let fragment = Fragment::Error {
                        message: failure.message,
                        category: failure.category,
                    };
                    return RelayEnd::Stopped(self.fail(fragment).await);
                }
                None => {
                    tracing::warn!(chat_id = %chat_id, fragments, "model stream closed without a terminal event");
                    let fragment = Fragment::Error {
                        message: UNEXPECTED_END_MESSAGE.to_string(),
                        category: ErrorCategory::Unknown,
                    };
                    return RelayEnd::Stopped(self.fail(fragment).await);
                }
            }
        }

        if accumulated.trim().is_empty() {
            tracing::warn!(chat_id = %chat_id, "model finished without producing text");
            return RelayEnd::Stopped(self.fail(Fragment::error(ErrorCategory::Unknown)).await);
        }

        if self.sink.is_closed() {
            tracing::info!(chat_id = %chat_id, fragments, "client left before the answer was stored");
            return RelayEnd::Stopped(TurnOutcome::Cancelled);
        }

        tracing::debug!(chat_id = %chat_id, fragments, "model stream done");
        RelayEnd::Answer(accumulated)
    }

    async fn persist_answer(&self, answer: String) -> TurnOutcome {
        let chat_id = self.chat_id;
        tracing::debug!(chat_id = %chat_id, phase = %TurnPhase::PersistingAssistant, "storing answer");

        match self
            .store
            .append_message(chat_id, NewMessage::assistant(answer))
            .await
        {
            Ok(record) => {
                let _ = self
                    .sink
                    .send(Fragment::completion(record.id.to_string()))
                    .await;
                TurnOutcome::Completed {
                    message_id: record.id,
                }
            }
            Err(error) => {
                log_persist_failure(chat_id, &error);
                self.fail(Fragment::error(ErrorCategory::PersistenceFailure))
                    .await
            }
        }
    }

    async fn fail(&self, fragment: Fragment) -> TurnOutcome {
        let category = match &fragment {
            Fragment::Error { category, .. } => *category,
            Fragment::Content { .. } | Fragment::Completion { .. } => ErrorCategory::Unknown,
        };
        let _ = self.sink.send(fragment).await;
        TurnOutcome::Failed { category }
    }
}

fn provider_role(role: MessageRole) -> Role {
    match role {
        MessageRole::System => Role::System,
        MessageRole::User => Role::User,
        MessageRole::Assistant => Role::Assistant,
    }
}

fn log_persist_failure(chat_id: ChatId, error: &StorageError) {
    tracing::error!(
        chat_id = %chat_id,
        stage = error.stage(),
        error = %error,
        "answer was generated but could not be stored"
    );
}
