use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use murmur_protocol::ErrorCategory;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::classify::{classify_detail, error_chain_text};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_PERSONA: &str =
    "You are a helpful assistant. Answer clearly and concisely, using Markdown when it helps.";

/// Events buffered between the provider worker and its reader. Small on purpose:
/// a slow reader should hold the upstream back rather than pile up text.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub persona: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_id: "openai".to_string(),
            api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            persona: DEFAULT_PERSONA.to_string(),
            request_timeout: Duration::from_secs(60),
            max_retries: 2,
        }
    }
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().trim_end_matches('/').to_string(),
            model: model.into().trim().to_string(),
            ..Self::default()
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    /// Caller-side label carried into provider logs, usually the chat id.
    pub trace_id: String,
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
}

impl StreamRequest {
    pub fn new(
        trace_id: impl Into<String>,
        model_id: impl Into<String>,
        messages: Vec<ProviderMessage>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            model_id: model_id.into(),
            messages,
        }
    }
}

/// Prepends the persona as a system message unless the history already has one.
pub fn with_persona(messages: Vec<ProviderMessage>, persona: &str) -> Vec<ProviderMessage> {
    let persona = persona.trim();
    let has_system = messages
        .iter()
        .any(|message| message.role == Role::System);

    if has_system || persona.is_empty() {
        return messages;
    }

    let mut with_system = Vec::with_capacity(messages.len() + 1);
    with_system.push(ProviderMessage::new(Role::System, persona));
    with_system.extend(messages);
    with_system
}

/// Sanitized failure as seen by callers: a category plus text safe to show users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayFailure {
    pub category: ErrorCategory,
    pub message: String,
}

impl GatewayFailure {
    pub fn new(category: ErrorCategory) -> Self {
        Self {
            category,
            message: category.user_message().to_string(),
        }
    }
}

impl From<&ProviderError> for GatewayFailure {
    fn from(error: &ProviderError) -> Self {
        Self::new(error.category())
    }
}

/// What a provider stream yields. Exactly one `Done` or `Error` ends every stream
/// that was not cancelled by its reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error(GatewayFailure),
}

impl StreamEventPayload {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta(_))
    }
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request '{trace_id}' has no user or assistant messages"))]
    EmptyMessageSet {
        stage: &'static str,
        trace_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("provider did not respond within {timeout_ms} ms on `{stage}`"))]
    TimedOut { stage: &'static str, timeout_ms: u128 },
}

impl ProviderError {
    /// Folds the failure into the user-facing taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingApiKey { .. } => ErrorCategory::Authentication,
            Self::UnsupportedProvider { .. } | Self::EmptyMessageSet { .. } => {
                ErrorCategory::Unknown
            }
            Self::TimedOut { .. } => ErrorCategory::Timeout,
            Self::HttpClient { source, .. } => classify_detail(&error_chain_text(source)),
            Self::CompletionsFailed { source, .. } => classify_detail(&error_chain_text(source)),
        }
    }
}

pub struct ProviderEventStream {
    events: mpsc::Receiver<StreamEventPayload>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    fn new(events: mpsc::Receiver<StreamEventPayload>, cancel_tx: oneshot::Sender<()>) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    /// Next event, or `None` once the worker is gone.
    pub async fn recv(&mut self) -> Option<StreamEventPayload> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    /// Model used when a request does not name one.
    fn default_model(&self) -> &str;
    /// Persona injected ahead of histories that carry no system message.
    fn persona(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Wires a bounded event channel to a reader-owned cancel signal.
pub fn make_event_stream() -> (
    mpsc::Sender<StreamEventPayload>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}
