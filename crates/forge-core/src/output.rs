//! Container log collection.
//!
//! stdout and stderr are merged into one buffer in arrival order; which
//! stream a byte came from is not kept.

use forge_types::{ForgeError, LogChunk, Result, StreamKind};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::runtime::LogStream;

/// Size of the header preceding every multiplexed frame.
const FRAME_HEADER_LEN: usize = 8;

/// Merged output of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedOutput {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

/// Drain `stream` into a single buffer of at most `max_bytes`.
///
/// Reading stops at the limit and the result is flagged as truncated.
pub async fn collect_output(mut stream: LogStream, max_bytes: usize) -> Result<CollectedOutput> {
    let mut out = CollectedOutput::default();

    while let Some(item) = stream.next().await {
        let chunk = item.map_err(|e| match e {
            ForgeError::LogFetch(_) => e,
            other => ForgeError::LogFetch(other.to_string()),
        })?;
        if chunk.stream == StreamKind::Stdin {
            continue;
        }

        let room = max_bytes.saturating_sub(out.bytes.len());
        if chunk.data.len() > room {
            out.bytes.extend_from_slice(&chunk.data[..room]);
            out.truncated = true;
            warn!(limit = max_bytes, "Container output truncated");
            break;
        }
        out.bytes.extend_from_slice(&chunk.data);
    }

    debug!(bytes = out.bytes.len(), truncated = out.truncated, "Collected container output");
    Ok(out)
}

/// Split a raw multiplexed log stream into frames.
///
/// Each frame is an 8-byte header (stream id, three padding bytes, big-endian
/// u32 payload length) followed by the payload. Stream id 3 carries a daemon
/// error message and fails the whole decode.
pub fn demux_frames(raw: &[u8]) -> Result<Vec<LogChunk>> {
    let mut chunks = Vec::new();
    let mut rest = raw;

    while !rest.is_empty() {
        if rest.len() < FRAME_HEADER_LEN {
            return Err(ForgeError::LogFetch(format!(
                "truncated frame header ({} bytes)",
                rest.len()
            )));
        }
        let (header, body) = rest.split_at(FRAME_HEADER_LEN);
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if body.len() < len {
            return Err(ForgeError::LogFetch(format!(
                "truncated frame: expected {len} bytes, got {}",
                body.len()
            )));
        }
        let (payload, tail) = body.split_at(len);

        let stream = match header[0] {
            0 => StreamKind::Stdin,
            1 => StreamKind::Stdout,
            2 => StreamKind::Stderr,
            3 => {
                return Err(ForgeError::LogFetch(format!(
                    "daemon error in log stream: {}",
                    String::from_utf8_lossy(payload)
                )))
            }
            other => {
                return Err(ForgeError::LogFetch(format!(
                    "unrecognized stream id {other}"
                )))
            }
        };
        chunks.push(LogChunk {
            stream,
            data: payload.to_vec(),
        });
        rest = tail;
    }

    Ok(chunks)
}
