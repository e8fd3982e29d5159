//! In-process provider that replays canned steps instead of calling a model.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use murmur_protocol::ErrorCategory;
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    EmptyMessageSetSnafu, GatewayFailure, LlmProvider, ProviderResult, ProviderStreamHandle,
    ProviderWorker, StreamEventPayload, StreamRequest, make_event_stream, with_persona,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Delta(String),
    Done,
    Error(ErrorCategory),
    /// Close the channel without a terminal event.
    EndSilently,
    /// Block until the reader cancels.
    Hang,
    Pause(Duration),
}

impl ScriptStep {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta(text.into())
    }
}

/// Replays one script per `stream_chat` call, in the order they were queued.
/// When the queue runs dry the fallback script is used.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    fallback: Vec<ScriptStep>,
    persona: String,
    requests: Arc<Mutex<Vec<StreamRequest>>>,
}

impl ScriptedProvider {
    pub fn new(fallback: Vec<ScriptStep>) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback,
            persona: String::new(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Streams `chunks` then `Done` on every call.
    pub fn replying(chunks: &[&str]) -> Self {
        let mut steps = chunks
            .iter()
            .map(|chunk| ScriptStep::delta(*chunk))
            .collect::<Vec<_>>();
        steps.push(ScriptStep::Done);
        Self::new(steps)
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push_back(steps);
        }
    }

    /// Every request received so far, persona already applied.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn next_script(&self) -> Vec<ScriptStep> {
        self.scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }

    async fn replay(
        steps: Vec<ScriptStep>,
        event_tx: mpsc::Sender<StreamEventPayload>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for step in steps {
            let payload = match step {
                ScriptStep::Delta(text) => StreamEventPayload::Delta(text),
                ScriptStep::Done => StreamEventPayload::Done,
                ScriptStep::Error(category) => {
                    StreamEventPayload::Error(GatewayFailure::new(category))
                }
                ScriptStep::EndSilently => return,
                ScriptStep::Hang => {
                    let _ = (&mut cancel_rx).await;
                    tracing::debug!("scripted stream released by cancel");
                    return;
                }
                ScriptStep::Pause(duration) => {
                    tokio::select! {
                        _ = &mut cancel_rx => return,
                        _ = tokio::time::sleep(duration) => continue,
                    }
                }
            };

            let terminal = payload.is_terminal();
            tokio::select! {
                _ = &mut cancel_rx => return,
                sent = event_tx.send(payload) => {
                    if sent.is_err() || terminal {
                        return;
                    }
                }
            }
        }
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn persona(&self) -> &str {
        &self.persona
    }

    fn stream_chat(&self, mut request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        snafu::ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "scripted-stream-chat",
                trace_id: request.trace_id.clone(),
            }
        );

        request.messages = with_persona(request.messages, &self.persona);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(Self::replay(self.next_script(), event_tx, cancel_rx));
        Ok(ProviderStreamHandle { stream, worker })
    }
}
