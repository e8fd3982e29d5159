use std::convert::Infallible;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use murmur_core::UNEXPECTED_END_MESSAGE;
use murmur_protocol::{ErrorCategory, Fragment};
use tokio::sync::mpsc;

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

pub fn fragment_event(fragment: &Fragment) -> Event {
    Event::default()
        .event(fragment.event_name())
        .data(fragment.to_json())
}

/// Yields relay fragments up to and including the first terminal one.
///
/// A relay that stops without a terminal fragment (panic, dropped sender) is
/// reported to the client as one generic error before the stream closes.
pub fn guarded_fragments(fragments: mpsc::Receiver<Fragment>) -> impl Stream<Item = Fragment> {
    futures::stream::unfold(Some(fragments), |state| async move {
        let mut fragments = state?;
        match fragments.recv().await {
            Some(fragment) if fragment.is_terminal() => Some((fragment, None)),
            Some(fragment) => Some((fragment, Some(fragments))),
            None => {
                tracing::warn!("relay stopped without a terminal fragment");
                let fragment = Fragment::Error {
                    message: UNEXPECTED_END_MESSAGE.to_string(),
                    category: ErrorCategory::Unknown,
                };
                Some((fragment, None))
            }
        }
    })
}

pub fn sse_response(fragments: mpsc::Receiver<Fragment>) -> Response {
    let events = guarded_fragments(fragments)
        .map(|fragment| Ok::<_, Infallible>(fragment_event(&fragment)));

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response();

    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    response
}
