//! Newline-delimited JSON framing for discovery streams

use crate::{Result, ServerError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time;

/// Default upper bound for a single frame, newline excluded
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Reads one JSON value per line.
///
/// `next_frame` is cancel safe: bytes read before a cancellation stay buffered
/// and are completed by the next call.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Next decoded frame, or `None` once the peer closed the stream.
    /// Blank lines are skipped.
    pub async fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            let remaining = (self.max_frame_bytes + 1).saturating_sub(self.buf.len()) as u64;
            let read = (&mut self.inner)
                .take(remaining)
                .read_until(b'\n', &mut self.buf)
                .await?;

            let terminated = self.buf.last() == Some(&b'\n');
            if !terminated {
                if self.buf.len() > self.max_frame_bytes {
                    self.buf.clear();
                    return Err(ServerError::ProtocolViolation(format!(
                        "frame exceeds {} bytes",
                        self.max_frame_bytes
                    )));
                }
                if read > 0 {
                    // Unterminated tail before EOF, the next read returns 0
                    continue;
                }
                if self.buf.iter().all(u8::is_ascii_whitespace) {
                    self.buf.clear();
                    return Ok(None);
                }
            }

            let frame = std::mem::take(&mut self.buf);
            let line = std::str::from_utf8(&frame)
                .map_err(|_| ServerError::ProtocolViolation("frame is not UTF-8".to_string()))?
                .trim();
            if line.is_empty() {
                continue;
            }

            return serde_json::from_str(line)
                .map(Some)
                .map_err(|e| ServerError::ProtocolViolation(format!("malformed frame: {}", e)));
        }
    }
}

/// Write one frame, bounded by `timeout`. Failures are reported as
/// [`ServerError::PushDeliveryFailure`].
pub async fn write_frame<W, T>(writer: &mut W, message: &T, timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');

    let write = async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    };

    match time::timeout(timeout, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ServerError::PushDeliveryFailure(e.to_string())),
        Err(_) => Err(ServerError::PushDeliveryFailure(format!(
            "write timed out after {:?}",
            timeout
        ))),
    }
}
