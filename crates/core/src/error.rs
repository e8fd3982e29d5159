use murmur_storage::{ChatId, StorageError};
use snafu::Snafu;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoreError {
    #[snafu(display("chat '{chat_id}' already has a reply in progress"))]
    TurnInProgress { stage: &'static str, chat_id: ChatId },
    #[snafu(display("message content must not be empty"))]
    EmptyContent { stage: &'static str },
    #[snafu(display("conversation store failed on `{stage}`, {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store { source, .. } if source.is_not_found())
    }

    pub fn is_invalid_input(&self) -> bool {
        match self {
            Self::EmptyContent { .. } => true,
            Self::Store { source, .. } => source.is_invalid_input(),
            Self::TurnInProgress { .. } => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::TurnInProgress { .. })
    }
}
