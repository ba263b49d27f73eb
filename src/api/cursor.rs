// Opaque pagination cursors: base64-packed JSON `{id, ts}`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AgentTraceError, Result};
use crate::storage::CursorPosition;

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    id: String,
    ts: DateTime<Utc>,
}

pub fn encode_cursor(position: &CursorPosition) -> String {
    let payload = CursorPayload {
        id: position.id.clone(),
        ts: position.ts,
    };
    // serialization of a two-field struct cannot fail
    let json = serde_json::to_vec(&payload).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

pub fn decode_cursor(cursor: &str) -> Result<CursorPosition> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| AgentTraceError::validation("malformed cursor"))?;
    let payload: CursorPayload = serde_json::from_slice(&bytes)
        .map_err(|_| AgentTraceError::validation("malformed cursor"))?;
    Ok(CursorPosition {
        id: payload.id,
        ts: payload.ts,
    })
}
