use std::time::Duration;

use futures::StreamExt;
use rig::completion::{CompletionError, CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, GatewayFailure, HttpClientSnafu, LlmProvider,
    MissingApiKeySnafu, ProviderConfig, ProviderError, ProviderMessage, ProviderResult,
    ProviderStreamHandle, ProviderWorker, Role, StreamEventPayload, StreamRequest,
    make_event_stream, with_persona,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

const RETRY_BACKOFF: Duration = Duration::from_millis(250);

type RigFinalResponse = openai::responses_api::streaming::StreamingCompletionResponse;
type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<RigFinalResponse>;
type RigStreamItem = Result<StreamedAssistantContent<RigFinalResponse>, CompletionError>;

/// A stream whose request went through, with the item that proved it.
struct OpenedStream {
    stream: RigStreamingResponse,
    first_item: Option<RigStreamItem>,
}

pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    /// Builds the adapter even without a credential so the server can start;
    /// each stream request then fails with an authentication error.
    pub fn new(config: ProviderConfig) -> Self {
        if !config.has_api_key() {
            tracing::warn!(
                provider_id = %config.provider_id,
                endpoint = %config.endpoint,
                "no API key configured; completions will fail until one is provided"
            );
        }

        Self { config }
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    /// Rig takes one preamble, so every system message is folded into it.
    fn merged_preamble(messages: &[ProviderMessage]) -> Option<String> {
        let preamble_parts = messages
            .iter()
            .filter(|message| message.role == Role::System && !message.content.trim().is_empty())
            .map(|message| message.content.clone())
            .collect::<Vec<_>>();

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                trace_id = %request.trace_id,
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                trace_id: request.trace_id.clone(),
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(&request.messages) {
            builder = builder.preamble(preamble);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    /// Rig sends the HTTP request lazily, so connect errors and bad statuses
    /// arrive as the first stream item. One attempt therefore runs until that
    /// item is in hand.
    async fn open_attempt(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<OpenedStream> {
        let mut stream = Self::open_stream(config, request).await?;
        match stream.next().await {
            Some(Err(source)) => {
                stream.cancel();
                Err(ProviderError::CompletionsFailed {
                    stage: "open-stream-first-item",
                    source,
                })
            }
            first_item => Ok(OpenedStream { stream, first_item }),
        }
    }

    /// Opens the upstream stream, retrying only network-level failures.
    async fn open_stream_with_retry(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<OpenedStream> {
        let mut attempt: u32 = 0;

        loop {
            let opened =
                tokio::time::timeout(config.request_timeout, Self::open_attempt(config, request))
                    .await;
            let outcome = match opened {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::TimedOut {
                    stage: "open-stream",
                    timeout_ms: config.request_timeout.as_millis(),
                }),
            };

            let error = match outcome {
                Ok(opened) => return Ok(opened),
                Err(error) => error,
            };

            let category = error.category();
            if !category.is_transient() || attempt >= config.max_retries {
                return Err(error);
            }

            attempt += 1;
            tracing::warn!(
                trace_id = %request.trace_id,
                attempt,
                max_retries = config.max_retries,
                category = %category,
                error = %error,
                "transient provider failure; retrying"
            );
            tokio::time::sleep(RETRY_BACKOFF * attempt).await;
        }
    }

    async fn emit_error_event(
        event_tx: &mpsc::Sender<StreamEventPayload>,
        trace_id: &str,
        error: ProviderError,
    ) {
        let failure = GatewayFailure::from(&error);
        tracing::error!(
            trace_id = %trace_id,
            category = %failure.category,
            error = %error,
            "provider stream failed"
        );
        let _ = event_tx.send(StreamEventPayload::Error(failure)).await;
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamEventPayload>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(StreamEventPayload::Delta(text.text))
            }
            // Reasoning, tool calls and the final usage record are not part of the answer text.
            _ => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::Sender<StreamEventPayload>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let trace_id = request.trace_id.clone();

        let opened = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(trace_id = %trace_id, "provider stream cancelled before opening");
                return;
            }
            opened = Self::open_stream_with_retry(&config, &request) => opened,
        };

        let OpenedStream {
            mut stream,
            first_item,
        } = match opened {
            Ok(opened) => opened,
            Err(error) => {
                Self::emit_error_event(&event_tx, &trace_id, error).await;
                return;
            }
        };

        let mut delta_count: usize = 0;
        let mut buffered = Some(first_item);

        loop {
            let next_item = match buffered.take() {
                Some(item) => Ok(item),
                None => tokio::select! {
                    _ = &mut cancel_rx => {
                        // Cancel the upstream Rig stream so provider IO stops promptly.
                        tracing::debug!(trace_id = %trace_id, delta_count, "provider stream cancelled");
                        stream.cancel();
                        return;
                    }
                    next_item = tokio::time::timeout(config.request_timeout, stream.next()) => next_item,
                },
            };

            match next_item {
                Err(_) => {
                    stream.cancel();
                    let error = ProviderError::TimedOut {
                        stage: "stream-idle",
                        timeout_ms: config.request_timeout.as_millis(),
                    };
                    Self::emit_error_event(&event_tx, &trace_id, error).await;
                    return;
                }
                Ok(Some(Ok(item))) => {
                    let Some(payload) = Self::map_stream_item(item) else {
                        continue;
                    };
                    delta_count += 1;
                    if event_tx.send(payload).await.is_err() {
                        stream.cancel();
                        return;
                    }
                }
                Ok(Some(Err(source))) => {
                    let error = ProviderError::CompletionsFailed {
                        stage: "stream-chunk",
                        source,
                    };
                    Self::emit_error_event(&event_tx, &trace_id, error).await;
                    return;
                }
                Ok(None) => break,
            }
        }

        tracing::debug!(trace_id = %trace_id, delta_count, "provider stream finished");
        let _ = event_tx.send(StreamEventPayload::Done).await;
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }

    fn persona(&self) -> &str {
        &self.config.persona
    }

    fn stream_chat(&self, mut request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            self.config.has_api_key(),
            MissingApiKeySnafu {
                stage: "stream-chat",
                provider_id: self.config.provider_id.clone(),
            }
        );
        ensure!(
            request
                .messages
                .iter()
                .any(|message| message.role != Role::System),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                trace_id: request.trace_id.clone(),
            }
        );

        if request.model_id.trim().is_empty() {
            request.model_id = self.config.model.clone();
        }
        request.messages = with_persona(request.messages, &self.config.persona);

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use murmur_protocol::ErrorCategory;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn request(messages: Vec<ProviderMessage>) -> StreamRequest {
        StreamRequest::new("chat-1", "", messages)
    }

    /// Local endpoint that counts accepted connections. With a canned reply it
    /// answers every request with it; without one it never answers.
    async fn counting_endpoint(reply: Option<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut silent = Vec::new();
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let Some(reply) = reply else {
                    silent.push(socket);
                    continue;
                };
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buffer = [0_u8; 4096];
                    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                        match socket.read(&mut buffer).await {
                            Ok(0) | Err(_) => return,
                            Ok(read) => head.extend_from_slice(&buffer[..read]),
                        }
                    }
                    let _ = socket.write_all(reply.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{address}/v1"), accepted)
    }

    async fn single_terminal_error(adapter: &RigProviderAdapter) -> GatewayFailure {
        let handle = adapter
            .stream_chat(request(vec![ProviderMessage::new(Role::User, "Hello")]))
            .expect("request is well formed");
        let mut stream = handle.stream;
        tokio::spawn(handle.worker);

        let first = stream.recv().await.expect("one terminal event");
        let StreamEventPayload::Error(failure) = first else {
            panic!("expected error, got {first:?}");
        };
        assert!(stream.recv().await.is_none());
        failure
    }

    #[test]
    fn stream_without_key_fails_with_authentication() {
        let adapter = RigProviderAdapter::new(ProviderConfig::default());
        let Err(error) =
            adapter.stream_chat(request(vec![ProviderMessage::new(Role::User, "Hello")]))
        else {
            panic!("missing key must fail");
        };
        assert_eq!(error.category(), ErrorCategory::Authentication);
    }

    #[test]
    fn system_only_history_is_rejected() {
        let config = ProviderConfig::new("openai", "sk-test", "http://127.0.0.1:9", "m");
        let adapter = RigProviderAdapter::new(config);
        let result = adapter.stream_chat(request(vec![ProviderMessage::new(
            Role::System,
            "persona only",
        )]));
        assert!(matches!(result, Err(ProviderError::EmptyMessageSet { .. })));
    }

    #[test]
    fn preamble_joins_every_system_message() {
        let messages = vec![
            ProviderMessage::new(Role::System, "first"),
            ProviderMessage::new(Role::User, "hi"),
            ProviderMessage::new(Role::System, "second"),
        ];
        assert_eq!(
            RigProviderAdapter::merged_preamble(&messages).as_deref(),
            Some("first\n\nsecond")
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_ends_with_one_classified_error() {
        let config = ProviderConfig::new("openai", "sk-test", "http://127.0.0.1:9/v1", "m")
            .with_request_timeout(Duration::from_secs(5))
            .with_max_retries(0);
        let adapter = RigProviderAdapter::new(config);

        let failure = single_terminal_error(&adapter).await;
        assert_ne!(failure.category, ErrorCategory::PersistenceFailure);
    }

    #[tokio::test]
    async fn silent_endpoint_is_retried_up_to_the_limit() {
        let (endpoint, accepted) = counting_endpoint(None).await;
        let config = ProviderConfig::new("openai", "sk-test", endpoint, "m")
            .with_request_timeout(Duration::from_millis(200))
            .with_max_retries(2);
        let adapter = RigProviderAdapter::new(config);

        let failure = single_terminal_error(&adapter).await;
        assert_eq!(failure.category, ErrorCategory::Timeout);
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejected_credentials_are_not_retried() {
        let (endpoint, accepted) = counting_endpoint(Some(
            "HTTP/1.1 401 Unauthorized\r\n\
             content-type: application/json\r\n\
             content-length: 2\r\n\
             connection: close\r\n\r\n{}",
        ))
        .await;
        let config = ProviderConfig::new("openai", "sk-test", endpoint, "m")
            .with_request_timeout(Duration::from_secs(5))
            .with_max_retries(2);
        let adapter = RigProviderAdapter::new(config);

        let failure = single_terminal_error(&adapter).await;
        assert_eq!(failure.category, ErrorCategory::Authentication);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }
}
