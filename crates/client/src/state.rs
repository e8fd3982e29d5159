use std::collections::{HashMap, HashSet};

use murmur_protocol::{ChatDetailView, Fragment, MessageView, TEMPORARY_ID_PREFIX, is_temporary_id};

/// Identifier for one streaming turn on the client.
///
/// This must change on every submit/retry so stale fragments can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Streaming(StreamSessionId),
    Done,
    /// The turn failed; the text is what the user should be told.
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    /// Durable id, or a `temp-` id until the server acknowledges the message.
    pub id: String,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
}

impl ClientMessage {
    pub fn new(
        id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        status: MessageStatus,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            status,
        }
    }

    /// Durable message as returned by the server. Unknown roles are shown as assistant text.
    pub fn from_view(view: &MessageView) -> Self {
        let role = Role::from_wire(&view.role).unwrap_or(Role::Assistant);
        Self::new(view.id.clone(), role, view.content.clone(), MessageStatus::Done)
    }

    pub fn is_temporary(&self) -> bool {
        is_temporary_id(&self.id)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, MessageStatus::Failed(_))
    }
}

/// Stream state boundary for one chat.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming(StreamSessionId),
    Done(StreamSessionId),
    Error {
        session: StreamSessionId,
        message: String,
    },
    Cancelled(StreamSessionId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamSessionId),
    Complete(StreamSessionId),
    Fail {
        session: StreamSessionId,
        message: String,
    },
    Cancel(StreamSessionId),
    ResetToIdle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: StreamSessionId,
        attempted: StreamSessionId,
    },
    NoActiveStream,
    SessionMismatch {
        active: StreamSessionId,
        attempted: StreamSessionId,
    },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    pub fn active_session(&self) -> Option<StreamSessionId> {
        match self {
            Self::Streaming(session) => Some(*session),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => None,
        }
    }

    pub fn accepts(&self, session: StreamSessionId) -> bool {
        matches!(self, Self::Streaming(active) if *active == session)
    }

    /// Non-streaming states may start a new session directly. Terminal
    /// transitions must name the active session exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(session) => match self {
                Self::Streaming(active) if *active != session => {
                    Err(StreamTransitionRejection::AlreadyStreaming {
                        active: *active,
                        attempted: session,
                    })
                }
                Self::Streaming(_) => Ok(self.clone()),
                _ => Ok(Self::Streaming(session)),
            },
            StreamTransition::Complete(session) => {
                self.finish(session, || Self::Done(session))
            }
            StreamTransition::Fail { session, message } => {
                self.finish(session, || Self::Error { session, message })
            }
            StreamTransition::Cancel(session) => self.finish(session, || Self::Cancelled(session)),
            StreamTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn finish(
        &self,
        session: StreamSessionId,
        next: impl FnOnce() -> Self,
    ) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == session => Ok(next()),
            Self::Streaming(active) => Err(StreamTransitionRejection::SessionMismatch {
                active: *active,
                attempted: session,
            }),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientChat {
    pub title: String,
    pub messages: Vec<ClientMessage>,
    pub stream_state: StreamState,
}

impl ClientChat {
    pub fn message(&self, id: &str) -> Option<&ClientMessage> {
        self.messages.iter().find(|message| message.id == id)
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut ClientMessage> {
        self.messages.iter_mut().find(|message| message.id == id)
    }

    fn remove_message(&mut self, id: &str) {
        self.messages.retain(|message| message.id != id);
    }
}

/// Identifies the local messages that belong to one streaming turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnTicket {
    pub chat_id: String,
    pub session: StreamSessionId,
    pub user_message_id: String,
    /// Temporary id of the placeholder until `completion` swaps it.
    pub assistant_message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentEffect {
    Appended,
    Completed { message_id: String },
    Failed { message: String },
    /// Fragment for a session that is no longer active.
    Stale,
}

/// Client-side view of every chat the user has opened.
#[derive(Debug, Default)]
pub struct ChatStateStore {
    chats: HashMap<String, ClientChat>,
    next_sequence: u64,
}

impl ChatStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chat(&self, chat_id: &str) -> Option<&ClientChat> {
        self.chats.get(chat_id)
    }

    fn next_id(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn temporary_id(&mut self) -> String {
        format!("{TEMPORARY_ID_PREFIX}{}", self.next_id())
    }

    /// Adds the pending user message and an empty assistant placeholder.
    pub fn begin_turn(
        &mut self,
        chat_id: &str,
        content: &str,
    ) -> Result<TurnTicket, StreamTransitionRejection> {
        let session = StreamSessionId(self.next_id());
        let user_message_id = self.temporary_id();
        let assistant_message_id = self.temporary_id();

        let chat = self.chats.entry(chat_id.to_string()).or_default();
        chat.stream_state = chat.stream_state.apply(StreamTransition::Start(session))?;
        chat.messages.push(ClientMessage::new(
            user_message_id.clone(),
            Role::User,
            content,
            MessageStatus::Pending,
        ));
        chat.messages.push(ClientMessage::new(
            assistant_message_id.clone(),
            Role::Assistant,
            String::new(),
            MessageStatus::Streaming(session),
        ));

        Ok(TurnTicket {
            chat_id: chat_id.to_string(),
            session,
            user_message_id,
            assistant_message_id,
        })
    }

    pub fn apply_fragment(&mut self, ticket: &TurnTicket, fragment: &Fragment) -> FragmentEffect {
        let Some(chat) = self.chats.get_mut(&ticket.chat_id) else {
            return FragmentEffect::Stale;
        };
        if !chat.stream_state.accepts(ticket.session) {
            return FragmentEffect::Stale;
        }

        match fragment {
            Fragment::Content { text } => {
                if let Some(placeholder) = chat.message_mut(&ticket.assistant_message_id) {
                    placeholder.content.push_str(text);
                }
                FragmentEffect::Appended
            }
            Fragment::Completion { message_id } => {
                if let Some(user) = chat.message_mut(&ticket.user_message_id) {
                    user.status = MessageStatus::Done;
                }
                if let Some(placeholder) = chat.message_mut(&ticket.assistant_message_id) {
                    placeholder.id = message_id.clone();
                    placeholder.status = MessageStatus::Done;
                }
                chat.stream_state = StreamState::Done(ticket.session);
                FragmentEffect::Completed {
                    message_id: message_id.clone(),
                }
            }
            Fragment::Error { message, .. } => {
                // The server stored the prompt before the stream opened.
                if let Some(user) = chat.message_mut(&ticket.user_message_id) {
                    user.status = MessageStatus::Done;
                }
                settle_placeholder(chat, ticket, MessageStatus::Failed(message.clone()));
                chat.stream_state = StreamState::Error {
                    session: ticket.session,
                    message: message.clone(),
                };
                FragmentEffect::Failed {
                    message: message.clone(),
                }
            }
        }
    }

    /// The request failed before any stream opened, so the prompt was not stored either.
    pub fn fail_turn(&mut self, ticket: &TurnTicket, message: &str) {
        let Some(chat) = self.chats.get_mut(&ticket.chat_id) else {
            return;
        };
        let transition = StreamTransition::Fail {
            session: ticket.session,
            message: message.to_string(),
        };
        let Ok(next_state) = chat.stream_state.apply(transition) else {
            return;
        };

        if let Some(user) = chat.message_mut(&ticket.user_message_id) {
            user.status = MessageStatus::Failed(message.to_string());
        }
        settle_placeholder(chat, ticket, MessageStatus::Failed(message.to_string()));
        chat.stream_state = next_state;
    }

    pub fn cancel_turn(&mut self, ticket: &TurnTicket) {
        let Some(chat) = self.chats.get_mut(&ticket.chat_id) else {
            return;
        };
        let Ok(next_state) = chat.stream_state.apply(StreamTransition::Cancel(ticket.session))
        else {
            return;
        };

        settle_placeholder(chat, ticket, MessageStatus::Cancelled);
        chat.stream_state = next_state;
    }

    /// Replaces the chat's messages with the server's copy, keeping local
    /// temporaries the server has not acknowledged yet.
    pub fn reconcile(&mut self, detail: &ChatDetailView) {
        let chat = self.chats.entry(detail.chat.id.clone()).or_default();
        chat.title = detail.chat.title.clone();
        chat.messages = reconcile_messages(&chat.messages, &detail.messages);
    }
}

/// Drops an empty placeholder, otherwise keeps its partial text under `status`.
fn settle_placeholder(chat: &mut ClientChat, ticket: &TurnTicket, status: MessageStatus) {
    let is_empty = chat
        .message(&ticket.assistant_message_id)
        .is_some_and(|placeholder| placeholder.content.is_empty());
    if is_empty {
        chat.remove_message(&ticket.assistant_message_id);
    } else if let Some(placeholder) = chat.message_mut(&ticket.assistant_message_id) {
        placeholder.status = status;
    }
}

/// Merges fetched durable messages with local temporaries.
///
/// Fetched messages are authoritative and come first, in server order. A
/// temporary is dropped when a fetched message the client had not seen before
/// has the same role and content; every other temporary is kept after them.
pub fn reconcile_messages(local: &[ClientMessage], fetched: &[MessageView]) -> Vec<ClientMessage> {
    let known_durable = local
        .iter()
        .filter(|message| !message.is_temporary())
        .map(|message| message.id.as_str())
        .collect::<HashSet<_>>();

    let mut unclaimed = fetched
        .iter()
        .filter(|view| !known_durable.contains(view.id.as_str()))
        .map(ClientMessage::from_view)
        .collect::<Vec<_>>();

    let mut merged = fetched.iter().map(ClientMessage::from_view).collect::<Vec<_>>();
    for message in local.iter().filter(|message| message.is_temporary()) {
        let claimed = unclaimed
            .iter()
            .position(|durable| durable.role == message.role && durable.content == message.content);
        match claimed {
            Some(index) => {
                unclaimed.remove(index);
            }
            None => merged.push(message.clone()),
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use murmur_protocol::ErrorCategory;

    use super::*;

    fn view(id: &str, role: &str, content: &str) -> MessageView {
        MessageView {
            id: id.to_string(),
            chat_id: "c".to_string(),
            seq: 0,
            role: role.to_string(),
            content: content.to_string(),
            created_at: 0,
        }
    }

    #[test]
    fn completion_swaps_the_temporary_id() {
        let mut store = ChatStateStore::new();
        let ticket = store.begin_turn("c", "Hello").expect("idle chat starts");
        assert!(is_temporary_id(&ticket.assistant_message_id));

        store.apply_fragment(&ticket, &Fragment::content("Hi"));
        store.apply_fragment(&ticket, &Fragment::content(" there"));
        let effect = store.apply_fragment(&ticket, &Fragment::completion("m-2"));
        assert_eq!(
            effect,
            FragmentEffect::Completed {
                message_id: "m-2".to_string()
            }
        );

        let chat = store.chat("c").expect("chat exists");
        let answer = chat.message("m-2").expect("durable id applied");
        assert_eq!(answer.content, "Hi there");
        assert_eq!(answer.status, MessageStatus::Done);
        assert_eq!(chat.stream_state, StreamState::Done(ticket.session));
    }

    #[test]
    fn second_turn_is_rejected_while_streaming() {
        let mut store = ChatStateStore::new();
        store.begin_turn("c", "one").expect("first turn");
        assert!(matches!(
            store.begin_turn("c", "two"),
            Err(StreamTransitionRejection::AlreadyStreaming { .. })
        ));
    }

    #[test]
    fn error_drops_an_empty_placeholder() {
        let mut store = ChatStateStore::new();
        let ticket = store.begin_turn("c", "Hello").expect("turn");
        store.apply_fragment(&ticket, &Fragment::error(ErrorCategory::Timeout));

        let chat = store.chat("c").expect("chat exists");
        assert_eq!(chat.messages.len(), 1);
        assert!(chat.message(&ticket.assistant_message_id).is_none());
    }

    #[test]
    fn error_keeps_partial_text_flagged_as_failed() {
        let mut store = ChatStateStore::new();
        let ticket = store.begin_turn("c", "Hello").expect("turn");
        store.apply_fragment(&ticket, &Fragment::content("Partial"));
        store.apply_fragment(&ticket, &Fragment::error(ErrorCategory::RateLimited));

        let chat = store.chat("c").expect("chat exists");
        let placeholder = chat
            .message(&ticket.assistant_message_id)
            .expect("partial text kept");
        assert!(placeholder.is_failed());
        assert_eq!(placeholder.content, "Partial");
    }

    #[test]
    fn fragments_after_cancel_are_stale() {
        let mut store = ChatStateStore::new();
        let ticket = store.begin_turn("c", "Hello").expect("turn");
        store.apply_fragment(&ticket, &Fragment::content("a"));
        store.cancel_turn(&ticket);

        assert_eq!(
            store.apply_fragment(&ticket, &Fragment::content("b")),
            FragmentEffect::Stale
        );
        let chat = store.chat("c").expect("chat exists");
        let placeholder = chat.message(&ticket.assistant_message_id).expect("kept");
        assert_eq!(placeholder.content, "a");
        assert_eq!(placeholder.status, MessageStatus::Cancelled);
    }

    #[test]
    fn reconcile_claims_acknowledged_temporaries_and_keeps_failed_ones() {
        let local = vec![
            ClientMessage::new("m-1", Role::User, "old", MessageStatus::Done),
            ClientMessage::new("temp-1", Role::User, "Hello", MessageStatus::Done),
            ClientMessage::new(
                "temp-2",
                Role::Assistant,
                "Partial",
                MessageStatus::Failed("rate limited".to_string()),
            ),
        ];
        let fetched = vec![view("m-1", "user", "old"), view("m-3", "user", "Hello")];

        let merged = reconcile_messages(&local, &fetched);
        let ids = merged.iter().map(|message| message.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["m-1", "m-3", "temp-2"]);
        assert!(merged[2].is_failed());
    }

    #[test]
    fn reconcile_does_not_claim_with_an_already_known_message() {
        let local = vec![
            ClientMessage::new("m-1", Role::User, "again", MessageStatus::Done),
            ClientMessage::new("temp-9", Role::User, "again", MessageStatus::Pending),
        ];
        let fetched = vec![view("m-1", "user", "again")];

        let merged = reconcile_messages(&local, &fetched);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].id, "temp-9");
    }
}
