use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};

use crate::normalized::{NormalizedEvent, event_json, event_name};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Turn a stream of normalized events into an SSE response.
///
/// Each frame carries the event kind as `event:` so `EventSource` listeners
/// can subscribe per kind.
pub fn build_sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send>
where
    S: Stream<Item = NormalizedEvent> + Send + 'static,
{
    let stream = stream.map(|event| {
        Ok(Event::default()
            .event(event_name(&event))
            .data(event_json(&event)))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

/// SSE response for plain reload notifications.
pub fn build_notification_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send>
where
    S: Stream<Item = String> + Send + 'static,
{
    let stream = stream.map(|payload| Ok(Event::default().event("reload").data(payload)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}
