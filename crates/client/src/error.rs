use murmur_protocol::ErrorBody;
use snafu::Snafu;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("http request failed on `{stage}`: {source}"))]
    Http {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("server answered {status} on `{stage}`"))]
    Status {
        stage: &'static str,
        status: u16,
        body: Option<ErrorBody>,
    },
    #[snafu(display("event '{event}' carried an unreadable payload on `{stage}`: {source}"))]
    FramePayload {
        stage: &'static str,
        event: String,
        source: serde_json::Error,
    },
    #[snafu(display("event '{event}' carried a '{payload_type}' fragment"))]
    FrameEventMismatch {
        stage: &'static str,
        event: String,
        payload_type: String,
    },
    #[snafu(display("chat '{chat_id}' already has a reply streaming"))]
    AlreadyStreaming { stage: &'static str, chat_id: String },
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http { source, .. } => source.status().map(|status| status.as_u16()),
            _ => None,
        }
    }

    /// Text suitable for showing next to the failed message.
    pub fn user_message(&self) -> String {
        match self {
            Self::Status {
                body: Some(body), ..
            } => body.error.clone(),
            Self::Status { status, .. } => format!("request failed with status {status}"),
            _ => self.to_string(),
        }
    }
}
