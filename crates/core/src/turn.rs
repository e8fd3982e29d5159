use std::fmt;
use std::sync::Arc;

use dashmap::DashSet;
use murmur_protocol::{ErrorCategory, Fragment};
use murmur_storage::{ChatId, MessageId, MessageRecord};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Where a streamed turn currently is. `Failed` and `Cancelled` can follow any
/// non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// No turn is running for the chat.
    Idle,
    PersistingUser,
    AwaitingModel,
    Relaying,
    PersistingAssistant,
    Completed,
    Failed,
    Cancelled,
}

impl TurnPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PersistingUser => "persisting-user",
            Self::AwaitingModel => "awaiting-model",
            Self::Relaying => "relaying",
            Self::PersistingAssistant => "persisting-assistant",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { message_id: MessageId },
    Failed { category: ErrorCategory },
    /// The reader went away; nothing was persisted for the reply.
    Cancelled,
}

impl TurnOutcome {
    pub fn phase(&self) -> TurnPhase {
        match self {
            Self::Completed { .. } => TurnPhase::Completed,
            Self::Failed { .. } => TurnPhase::Failed,
            Self::Cancelled => TurnPhase::Cancelled,
        }
    }
}

/// A running turn. Dropping `fragments` cancels the model call.
pub struct TurnHandle {
    pub user_message: MessageRecord,
    pub fragments: mpsc::Receiver<Fragment>,
    pub task: JoinHandle<TurnOutcome>,
}

/// Marks a chat busy for as long as it lives.
pub(crate) struct TurnGuard {
    chat_id: ChatId,
    active: Arc<DashSet<ChatId>>,
}

impl TurnGuard {
    pub(crate) fn acquire(active: &Arc<DashSet<ChatId>>, chat_id: ChatId) -> Option<Self> {
        if !active.insert(chat_id) {
            return None;
        }

        Some(Self {
            chat_id,
            active: Arc::clone(active),
        })
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.active.remove(&self.chat_id);
        tracing::trace!(chat_id = %self.chat_id, phase = %TurnPhase::Idle, "chat released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_guard_for_the_same_chat_is_refused_until_release() {
        let active = Arc::new(DashSet::new());
        let chat_id = ChatId::generate();

        let first = TurnGuard::acquire(&active, chat_id).expect("first guard");
        assert!(TurnGuard::acquire(&active, chat_id).is_none());
        assert!(TurnGuard::acquire(&active, ChatId::generate()).is_some());

        drop(first);
        assert!(TurnGuard::acquire(&active, chat_id).is_some());
    }

    #[test]
    fn outcomes_map_to_terminal_phases() {
        let outcomes = [
            TurnOutcome::Completed {
                message_id: MessageId::generate(),
            },
            TurnOutcome::Failed {
                category: ErrorCategory::Timeout,
            },
            TurnOutcome::Cancelled,
        ];
        assert!(outcomes.iter().all(|outcome| outcome.phase().is_terminal()));
        assert!(!TurnPhase::Relaying.is_terminal());
        assert!(!TurnPhase::Idle.is_terminal());
    }
}
