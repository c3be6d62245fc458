//! http protocol - read and write request/reply header blocks
//!
//! Header blocks are kept as received: names keep their case and order, and
//! the request target and status line are carried verbatim. Values live in a
//! name keyed map, so a repeated header name keeps only its last value while
//! the order still lists every occurrence.

use std::collections::HashMap;

use http::{
    header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING},
    Method,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::HttpLimitOption;

use super::HttpError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    order: Vec<String>,
    values: HashMap<String, String>,
}

impl Headers {
    /// Parses `name: value` lines. Lines without `": "` are dropped.
    pub fn parse<L: AsRef<str>>(lines: &[L]) -> Self {
        let mut headers = Self::default();
        for line in lines {
            let line = line.as_ref();
            match line.split_once(": ") {
                Some((name, value)) => headers.insert(name, value),
                None => warn!(line, "bad header, ignoring"),
            }
        }

        headers
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.order.push(name.to_owned());
        self.values.insert(name.to_owned(), value.to_owned());
    }

    /// Value stored under exactly `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Value of the last header whose name matches `name` ignoring ASCII case.
    pub fn get_ignore_case(&self, name: &str) -> Option<&str> {
        self.order
            .iter()
            .rev()
            .find(|n| n.eq_ignore_ascii_case(name))
            .and_then(|n| self.get(n))
    }

    /// Headers in received order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order.iter().map(|name| {
            let value = self.values.get(name).map(String::as_str).unwrap_or_default();
            (name.as_str(), value)
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn wire_len(&self) -> usize {
        self.iter().map(|(k, v)| k.len() + v.len() + 4).sum()
    }

    fn put_to_buf(&self, buf: &mut Vec<u8>) {
        for (name, value) in self.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
    }
}

/// What the connection handler does with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Get,
    Connect,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// Everything after the method, e.g. `http://host/ HTTP/1.1`.
    pub target: String,
    pub headers: Headers,
}

impl Request {
    pub fn parse<L: AsRef<str>>(lines: &[L]) -> Result<Self, HttpError> {
        let first = lines.first().map(AsRef::as_ref).unwrap_or_default();
        let (method, target) = first
            .split_once(' ')
            .ok_or_else(|| HttpError::MalformedRequest(first.to_owned()))?;

        Ok(Self {
            method: method.to_owned(),
            target: target.to_owned(),
            headers: Headers::parse(&lines[1..]),
        })
    }

    pub fn dispatch(&self) -> Dispatch {
        match Method::from_bytes(self.method.as_bytes()) {
            Ok(m) if m == Method::GET => Dispatch::Get,
            Ok(m) if m == Method::CONNECT => Dispatch::Connect,
            _ => Dispatch::Other,
        }
    }

    /// Request URI, or the authority of a CONNECT.
    pub fn uri(&self) -> &str {
        self.target.split(' ').next().unwrap_or_default()
    }

    pub fn version(&self) -> Option<&str> {
        self.target.split_once(' ').map(|(_, v)| v)
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get_ignore_case(HOST.as_str())
    }
}

/// How a reply body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Chunked,
    Length(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status_line: String,
    pub headers: Headers,
}

impl Reply {
    pub fn parse<L: AsRef<str>>(lines: &[L]) -> Result<Self, HttpError> {
        let status_line = lines.first().ok_or(HttpError::MalformedReply)?;

        Ok(Self {
            status_line: status_line.as_ref().to_owned(),
            headers: Headers::parse(&lines[1..]),
        })
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_line.split(' ').nth(1)?.parse().ok()
    }

    /// A missing `Content-Length` means an empty body.
    pub fn framing(&self) -> Result<BodyFraming, HttpError> {
        let chunked = self
            .headers
            .get_ignore_case(TRANSFER_ENCODING.as_str())
            .and_then(|te| te.rsplit(',').next())
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return Ok(BodyFraming::Chunked);
        }

        match self.headers.get_ignore_case(CONTENT_LENGTH.as_str()) {
            None => Ok(BodyFraming::Length(0)),
            Some(len) => len
                .trim()
                .parse::<u64>()
                .map(BodyFraming::Length)
                .map_err(|_| HttpError::InvalidContentLength(len.to_owned())),
        }
    }
}

/// Reads lines up to the empty line ending a header block, returning them
/// without their line terminators.
pub async fn read_header_block<S>(
    stream: &mut S,
    limits: HttpLimitOption,
) -> Result<Vec<String>, HttpError>
where
    S: AsyncBufRead + Unpin,
{
    let mut lines: Vec<String> = vec![];
    let mut max_headers = limits.max_headers;
    let mut max_headers_size = limits.max_header_size;
    let mut buf = vec![];

    loop {
        buf.clear();
        // room for the line and its CRLF
        let cap = max_headers_size as u64 + 2;
        let n = (&mut *stream).take(cap).read_until(b'\n', &mut buf).await?;
        if n == 0 && lines.is_empty() {
            return Err(HttpError::StreamEnded);
        }
        if buf.last() != Some(&b'\n') {
            if n as u64 == cap {
                return Err(HttpError::HeaderTooLarge);
            }
            return Err(HttpError::MalformedStream);
        }

        buf.pop();
        if buf.pop() != Some(b'\r') {
            return Err(HttpError::MalformedStream);
        }
        if buf.is_empty() {
            break;
        }

        if !lines.is_empty() {
            if max_headers == 0 {
                return Err(HttpError::HeaderTooLarge);
            }
            max_headers -= 1;
        }
        if max_headers_size < buf.len() {
            return Err(HttpError::HeaderTooLarge);
        }
        max_headers_size -= buf.len();

        let line = String::from_utf8(buf.clone()).map_err(|_| HttpError::MalformedStream)?;
        lines.push(line);
    }

    Ok(lines)
}

pub async fn read_request<S>(stream: &mut S, limits: HttpLimitOption) -> Result<Request, HttpError>
where
    S: AsyncBufRead + Unpin,
{
    let lines = read_header_block(stream, limits).await?;
    Request::parse(&lines)
}

pub async fn read_reply<S>(stream: &mut S, limits: HttpLimitOption) -> Result<Reply, HttpError>
where
    S: AsyncBufRead + Unpin,
{
    let lines = read_header_block(stream, limits).await?;
    Reply::parse(&lines)
}

pub async fn write_request<S>(req: &Request, stream: &mut S) -> Result<(), HttpError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&format_request(req)).await?;

    Ok(())
}

pub async fn write_reply<S>(reply: &Reply, stream: &mut S) -> Result<(), HttpError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&format_reply(reply)).await?;

    Ok(())
}

pub fn format_request(req: &Request) -> Vec<u8> {
    let estimated_len = req.method.len() + req.target.len() + 3 + req.headers.wire_len() + 2;
    let mut buf = Vec::with_capacity(estimated_len);

    buf.extend_from_slice(req.method.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(req.target.as_bytes());
    buf.extend_from_slice(b"\r\n");
    req.headers.put_to_buf(&mut buf);

    buf
}

pub fn format_reply(reply: &Reply) -> Vec<u8> {
    let estimated_len = reply.status_line.len() + 2 + reply.headers.wire_len() + 2;
    let mut buf = Vec::with_capacity(estimated_len);

    buf.extend_from_slice(reply.status_line.as_bytes());
    buf.extend_from_slice(b"\r\n");
    reply.headers.put_to_buf(&mut buf);

    buf
}
