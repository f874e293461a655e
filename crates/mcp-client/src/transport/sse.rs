use crate::error::{ClientError, Result};
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::fmt::Display;
use tracing::debug;

/// Read an event stream until the JSON-RPC response for `id` arrives
pub async fn read_response(response: reqwest::Response, id: &Value) -> Result<Value> {
    read_events(response.bytes_stream(), id).await
}

async fn read_events<S, B, E>(body: S, id: &Value) -> Result<Value>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<ClientError> + Display,
{
    let stream = body.eventsource();
    futures::pin_mut!(stream);

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(EventStreamError::Transport(e)) => return Err(e.into()),
            Err(e) => return Err(ClientError::protocol(format!("Invalid event stream: {}", e))),
        };
        if let Some(message) = match_response(&event, id) {
            return Ok(message);
        }
    }

    Err(ClientError::protocol(
        "Event stream ended without a response",
    ))
}

fn match_response(event: &Event, id: &Value) -> Option<Value> {
    if !event.event.is_empty() && event.event != "message" {
        debug!("Ignoring SSE event: {}", event.event);
        return None;
    }
    let message: Value = match serde_json::from_str(&event.data) {
        Ok(message) => message,
        Err(e) => {
            debug!("Ignoring non-JSON SSE data: {}", e);
            return None;
        }
    };
    if message.get("id") == Some(id)
        && (message.get("result").is_some() || message.get("error").is_some())
    {
        Some(message)
    } else {
        debug!("Ignoring server message while waiting for response: {}", message);
        None
    }
}
