//! LSP message framing layer
//!
//! Frames messages as `Header\r\n\r\nBody`. Only `Content-Length` is
//! required; header names are matched case-insensitively on read and
//! `Content-Type` is never emitted on write.

use crate::io::transport::Transport;
use tracing::trace;

/// Maximum message size to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Error types for LSP framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError<T: std::error::Error + Send + Sync + 'static> {
    #[error("transport error: {0}")]
    Transport(T),

    #[error("invalid LSP header: {0}")]
    InvalidHeader(String),

    #[error("missing Content-Length header")]
    MissingContentLength,

    #[error("invalid content length: {0}")]
    InvalidContentLength(String),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("stream ended mid-message: {buffered} bytes buffered")]
    TruncatedMessage { buffered: usize },

    #[error("message body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

impl<T: std::error::Error + Send + Sync + 'static> FramingError<T> {
    /// Whether this error is the peer closing the stream between
    /// messages, as opposed to a protocol violation
    pub fn is_disconnect(&self) -> bool {
        matches!(self, FramingError::Transport(_))
    }
}

/// LSP message framing codec over any transport
///
/// The read side accumulates raw byte chunks and splits out complete
/// framed messages; the write side prepends the `Content-Length` header
/// and sends header plus body as one atomic transport write.
pub struct FrameCodec<T: Transport> {
    transport: T,
    receive_buffer: Vec<u8>,
}

impl<T: Transport> FrameCodec<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            receive_buffer: Vec::new(),
        }
    }

    /// Get a reference to the underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Encode and send one message
    pub async fn send(&mut self, payload: &str) -> Result<(), FramingError<T::Error>> {
        let framed = format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload);

        trace!(
            "FrameCodec: sending framed message ({} bytes content)",
            payload.len()
        );

        self.transport
            .send(&framed)
            .await
            .map_err(FramingError::Transport)
    }

    /// Receive the next complete message body
    ///
    /// A transport error with an empty buffer is a clean end of stream;
    /// with a partial frame buffered it is reported as
    /// [`FramingError::TruncatedMessage`].
    pub async fn receive(&mut self) -> Result<String, FramingError<T::Error>> {
        loop {
            if let Some(message) = self.try_parse_message()? {
                return Ok(message);
            }

            match self.transport.receive().await {
                Ok(chunk) => self.receive_buffer.extend_from_slice(&chunk),
                Err(e) => {
                    if self.receive_buffer.is_empty() {
                        return Err(FramingError::Transport(e));
                    }
                    return Err(FramingError::TruncatedMessage {
                        buffered: self.receive_buffer.len(),
                    });
                }
            }
        }
    }

    /// Close only the write side of the underlying transport
    pub async fn shutdown_write(&mut self) -> Result<(), FramingError<T::Error>> {
        self.transport
            .shutdown_write()
            .await
            .map_err(FramingError::Transport)
    }

    /// Close the underlying transport
    pub async fn close(&mut self) -> Result<(), FramingError<T::Error>> {
        self.transport
            .close()
            .await
            .map_err(FramingError::Transport)
    }

    /// Try to split one complete message off the front of the buffer
    fn try_parse_message(&mut self) -> Result<Option<String>, FramingError<T::Error>> {
        let Some(header_end) = find_header_end(&self.receive_buffer) else {
            return Ok(None);
        };

        let header = String::from_utf8_lossy(&self.receive_buffer[..header_end]);
        let content_length = parse_content_length::<T::Error>(&header)?;
        let content_start = header_end + 4;

        if content_length > MAX_MESSAGE_SIZE {
            return Err(FramingError::MessageTooLarge {
                size: content_length,
                max: MAX_MESSAGE_SIZE,
            });
        }

        if self.receive_buffer.len() - content_start < content_length {
            trace!(
                "FrameCodec: incomplete message - need {} more bytes",
                content_length - (self.receive_buffer.len() - content_start)
            );
            return Ok(None);
        }

        let body: Vec<u8> = self
            .receive_buffer
            .drain(..content_start + content_length)
            .skip(content_start)
            .collect();

        let message = String::from_utf8(body)?;
        trace!("FrameCodec: parsed complete message ({} bytes)", content_length);
        Ok(Some(message))
    }
}

/// Locate the `\r\n\r\n` header terminator
fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse the Content-Length value out of a header block.
///
/// Header names are matched case-insensitively; unknown headers
/// (including `Content-Type`) are skipped.
fn parse_content_length<E: std::error::Error + Send + Sync + 'static>(
    header: &str,
) -> Result<usize, FramingError<E>> {
    for line in header.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(FramingError::InvalidHeader(line.to_string()));
        };

        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            return value
                .parse::<usize>()
                .map_err(|_| FramingError::InvalidContentLength(value.to_string()));
        }
    }

    Err(FramingError::MissingContentLength)
}
