use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest request or reply line accepted, terminator excluded.
pub const MAX_LINE_BYTES: usize = 4096;

/// Carried inside an [`io::Error`] when a line exceeds [`MAX_LINE_BYTES`].
#[derive(Debug, Error)]
#[error("line too long")]
pub struct LineTooLong;

pub fn is_line_too_long(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<LineTooLong>())
}

/// Reads one newline-delimited line without its terminator.
///
/// Returns `Ok(None)` once the peer has closed the stream. Blank lines are
/// returned as empty strings; rejecting them is the parser's job. Bytes that
/// are not UTF-8 are replaced rather than rejected. A line longer than
/// [`MAX_LINE_BYTES`] is consumed up to its newline and reported as
/// [`LineTooLong`], leaving the stream positioned at the next line.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let bytes = (&mut *reader)
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut raw)
        .await?;
    if bytes == 0 {
        return Ok(None);
    }
    if raw.len() > MAX_LINE_BYTES && raw.last() != Some(&b'\n') {
        discard_line(reader).await?;
        return Err(io::Error::new(io::ErrorKind::InvalidData, LineTooLong));
    }

    let line = String::from_utf8_lossy(&raw);
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Skips everything up to and including the next newline.
async fn discard_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (used, done) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(());
            }
            match buf.iter().position(|&byte| byte == b'\n') {
                Some(end) => (end + 1, true),
                None => (buf.len(), false),
            }
        };
        reader.consume(used);
        if done {
            return Ok(());
        }
    }
}

/// Writes `line` followed by `\n` and flushes so the peer sees it promptly.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
