//! Frame codec for the process transport.
//!
//! One frame per boundary crossing: a little-endian u32 length followed by
//! that many bytes of JSON. Requests are bare envelopes; replies are a
//! [`Frame`] so the context can answer a malformed or out-of-order request
//! with a diagnostic instead of a payload. The shape is opaque above the
//! backend layer.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, Result};
use crate::protocol::Envelope;

/// Reply wrapper: either a response envelope or a context-side error.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body")]
pub enum Frame {
    Envelope(Envelope),
    Error { message: String },
}

/// Upper bound on a single frame. A context answering with more than this
/// is misbehaving, not chatty.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| BackendError::Transport(format!("failed to encode frame: {e}")))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| BackendError::Transport("frame exceeds u32 length".to_string()))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(BackendError::Transport(format!(
            "frame length {len} exceeds limit {MAX_FRAME_LEN}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    serde_json::from_slice(&payload)
        .map_err(|e| BackendError::Transport(format!("failed to decode frame: {e}")))
}
