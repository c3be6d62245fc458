//! Body relay - move a reply body from origin to client
//!
//! Bodies are streamed through a fixed size buffer, so memory stays bounded
//! whatever the content length or chunk size.

use bytes::BytesMut;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{BodyFraming, HttpError};

const RELAY_BUF_SIZE: usize = 8 * 1024;
const MAX_CHUNK_LINE: u64 = 4096;

/// Relays a body framed as `framing`, returning the payload bytes moved.
pub async fn relay_body<R, W>(
    src: &mut R,
    dst: &mut W,
    framing: BodyFraming,
) -> Result<u64, HttpError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::Chunked => relay_chunked(src, dst).await,
        BodyFraming::Length(len) => relay_exact(src, dst, len).await,
    }
}

/// Copies exactly `len` bytes. Whatever arrives before an early end of
/// stream has already been written to `dst` when `TruncatedBody` is returned.
pub async fn relay_exact<R, W>(src: &mut R, dst: &mut W, len: u64) -> Result<u64, HttpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(RELAY_BUF_SIZE.min(len as usize));
    let mut received = 0u64;

    while received < len {
        buf.clear();
        let n = (&mut *src).take(len - received).read_buf(&mut buf).await?;
        if n == 0 {
            return Err(HttpError::TruncatedBody {
                expected: len,
                received,
            });
        }

        dst.write_all(&buf).await?;
        received += n as u64;
    }

    Ok(received)
}

/// Relays a chunked body up to and including the zero size chunk. Size lines
/// are forwarded as received; trailers are not supported.
pub async fn relay_chunked<R, W>(src: &mut R, dst: &mut W) -> Result<u64, HttpError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = vec![];
    let mut payload = 0u64;

    loop {
        line.clear();
        let n = (&mut *src)
            .take(MAX_CHUNK_LINE)
            .read_until(b'\n', &mut line)
            .await?;
        if line.last() != Some(&b'\n') {
            if n as u64 == MAX_CHUNK_LINE {
                return Err(HttpError::InvalidChunkSize(
                    String::from_utf8_lossy(&line).into_owned(),
                ));
            }
            return Err(HttpError::StreamEnded);
        }

        let size = parse_chunk_size(&line)?;
        dst.write_all(&line).await?;

        payload += relay_exact(src, dst, size).await?;

        let mut crlf = [0u8; 2];
        src.read_exact(&mut crlf).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => HttpError::StreamEnded,
            _ => e.into(),
        })?;
        dst.write_all(b"\r\n").await?;

        if size == 0 {
            break;
        }
    }

    Ok(payload)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let invalid = || HttpError::InvalidChunkSize(String::from_utf8_lossy(line).trim_end().to_owned());

    let line = std::str::from_utf8(line).map_err(|_| invalid())?;
    let size = line
        .trim_end_matches(['\r', '\n'])
        .split(';')
        .next()
        .unwrap_or_default()
        .trim_matches([' ', '\t']);

    u64::from_str_radix(size, 16).map_err(|_| invalid())
}
