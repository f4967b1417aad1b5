//! Frame encoding for the stdio protocol.
//!
//! Two framings are supported:
//! - `newline`: one JSON object per line (blank lines and `\r\n` tolerated)
//! - `content_length`: `Content-Length: N` header block, blank line, N bytes

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Largest frame accepted from a child.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Largest `Content-Length` header block accepted from a child.
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// How frames are delimited on the child's stdio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    #[default]
    Newline,
    ContentLength,
}

impl Framing {
    /// Wrap a serialized message for writing.
    pub fn encode(self, payload: &[u8]) -> Vec<u8> {
        match self {
            Framing::Newline => {
                let mut out = Vec::with_capacity(payload.len() + 1);
                out.extend_from_slice(payload);
                out.push(b'\n');
                out
            }
            Framing::ContentLength => {
                let header = format!("Content-Length: {}\r\n\r\n", payload.len());
                let mut out = Vec::with_capacity(header.len() + payload.len());
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(payload);
                out
            }
        }
    }

    /// Read the next frame. `Ok(None)` means the stream is closed.
    ///
    /// A header block that cannot be parsed is returned as-is so the caller
    /// reports it as a malformed frame instead of losing the stream.
    pub async fn read_frame<R>(self, reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
    where
        R: AsyncBufRead + Unpin,
    {
        match self {
            Framing::Newline => read_line_frame(reader).await,
            Framing::ContentLength => read_length_frame(reader).await,
        }
    }
}

async fn read_line_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = read_bounded_line(reader, &mut buf, MAX_FRAME_BYTES).await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.len() > MAX_FRAME_BYTES {
            return Err(oversized(buf.len()));
        }
        let trimmed = trim_line_end(&buf);
        if trimmed.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return Ok(Some(trimmed.to_vec()));
    }
}

async fn read_length_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = Vec::new();
    let mut content_length: Option<usize> = None;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = read_bounded_line(reader, &mut line, MAX_HEADER_BYTES).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = trim_line_end(&line);
        if trimmed.is_empty() {
            if header.is_empty() {
                // Stray blank line between frames.
                continue;
            }
            break;
        }
        header.extend_from_slice(&line);
        if header.len() > MAX_HEADER_BYTES {
            return Ok(Some(header));
        }

        let text = String::from_utf8_lossy(trimmed);
        if let Some((name, value)) = text.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            }
        }
    }

    let Some(len) = content_length else {
        return Ok(Some(header));
    };
    if len > MAX_FRAME_BYTES {
        return Err(oversized(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// `read_until(b'\n')` that stops after `limit + 1` bytes, so a child that
/// never sends a newline cannot grow the buffer without bound.
async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut bounded = (&mut *reader).take(limit as u64 + 1);
    bounded.read_until(b'\n', buf).await
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn oversized(len: usize) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("frame of {len} bytes exceeds limit of {MAX_FRAME_BYTES}"),
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────────
