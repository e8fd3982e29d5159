//! Turn orchestration between the conversation store and the model gateway.

mod error;
mod orchestrator;
mod turn;

pub use error::{CoreError, CoreResult};
pub use orchestrator::{ChatOrchestrator, FRAGMENT_CHANNEL_CAPACITY, UNEXPECTED_END_MESSAGE};
pub use turn::{TurnHandle, TurnOutcome, TurnPhase};
