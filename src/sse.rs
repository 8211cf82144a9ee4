//! Server-sent event types for chat completion streaming.
//!
//! Follows `sweetmcp-daemon`'s `service::sse::encoder::SseEncoder`
//! wire-format encoding (`event:`, `data:` per line, blank line
//! terminator) and its `service::sse::events::SseEvent` shape. The one
//! addition is `node_assigned`, which must appear first and exactly
//! once — modeled as its own variant so the dispatcher cannot
//! accidentally reorder it relative to data frames.

use axum::response::sse::Event;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct NodeAssigned {
    pub node_id: u32,
    pub node_name: String,
}

/// Build the mandatory first event of a streaming chat response:
/// `event: node_assigned` / `data: {"node_id":...}`.
pub fn node_assigned_event(node_id: u32, node_name: &str) -> Event {
    let payload = NodeAssigned {
        node_id,
        node_name: node_name.to_string(),
    };
    Event::default()
        .event("node_assigned")
        .json_data(payload)
        .expect("NodeAssigned always serializes")
}

/// Forward a raw upstream chunk (a JSON object, one per line, as produced
/// by the LLM daemon) as a `data:` frame.
pub fn data_event(raw_json: &str) -> Event {
    Event::default().data(raw_json.to_string())
}

/// Terminal `data: [DONE]` frame on clean upstream end-of-stream.
pub fn done_event() -> Event {
    Event::default().data("[DONE]")
}

/// In-band error frame emitted when the upstream connection breaks mid
/// stream. Partial output has already reached the client; this is not a
/// failover signal, just a terminal notice.
pub fn error_event(message: &str) -> Event {
    Event::default().data(
        serde_json::json!({ "error": message }).to_string(),
    )
}
