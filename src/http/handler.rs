//! Connection handler - drives one client connection
//!
//! The first request decides which origin is dialed. A CONNECT turns the
//! connection into a tunnel for good; a GET is relayed and the connection
//! loops over further GETs while the origin stays open. Any failure closes
//! both streams without sending a response.

use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::{debug, info};

use crate::{
    Dialer, HttpLimitOption, IdleProbe, Liveness, ProxyError, ProxyOption, ProxyResult,
    ServiceAddress,
};

use super::{
    read_reply, read_request, relay_body, tunnel, write_reply, write_request, Dispatch, Headers,
    HttpError, Reply, Request,
};

/// How a connection ended without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The client closed while a request was awaited.
    ClientClosed,
    /// The origin closed after a reply.
    OriginClosed,
    /// A CONNECT tunnel finished.
    Tunneled { sent: u64, received: u64 },
}

#[derive(Debug, Clone)]
pub struct ConnectionHandler<D> {
    dialer: D,
    origin_port: u16,
    probe_timeout: Duration,
    limits: HttpLimitOption,
}

impl<D> ConnectionHandler<D>
where
    D: Dialer,
{
    pub fn new(dialer: D, option: &ProxyOption) -> Self {
        Self {
            dialer,
            origin_port: option.origin_port,
            probe_timeout: option.probe_timeout(),
            limits: option.limits,
        }
    }

    pub async fn serve<S>(&self, client: S) -> ProxyResult<Outcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut client = BufStream::new(client);

        let (req, mut addr, mut origin) = match self.open(&mut client).await {
            Ok(Some(opened)) => opened,
            Ok(None) => {
                close(&mut client).await;
                return Ok(Outcome::ClientClosed);
            }
            Err(err) => {
                close(&mut client).await;
                return Err(err);
            }
        };

        if req.dispatch() == Dispatch::Connect {
            return self.connect(client, origin).await;
        }

        let res = self
            .keep_alive(&mut client, &mut origin, &mut addr, req)
            .await;
        close(&mut origin).await;
        close(&mut client).await;

        res
    }

    /// Reads the first request and dials the origin it names.
    async fn open<S>(
        &self,
        client: &mut BufStream<S>,
    ) -> ProxyResult<Option<(Request, ServiceAddress, BufStream<D::Stream>)>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(req) = self.next_request(client).await? else {
            return Ok(None);
        };

        let addr = match req.dispatch() {
            Dispatch::Connect => ServiceAddress::parse_authority(req.uri(), None)?,
            Dispatch::Get => self.origin_of(&req)?,
            Dispatch::Other => return Err(ProxyError::UnsupportedMethod(req.method)),
        };
        let origin = self.dial(&addr).await?;

        Ok(Some((req, addr, origin)))
    }

    async fn connect<S>(
        &self,
        mut client: BufStream<S>,
        origin: BufStream<D::Stream>,
    ) -> ProxyResult<Outcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        write_reply(&connection_established(), &mut client).await?;
        client.flush().await?;

        let (sent, received) = tunnel(client, origin).await;

        Ok(Outcome::Tunneled { sent, received })
    }

    async fn keep_alive<S>(
        &self,
        client: &mut BufStream<S>,
        origin: &mut BufStream<D::Stream>,
        addr: &mut ServiceAddress,
        mut req: Request,
    ) -> ProxyResult<Outcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            self.exchange(&req, client, origin).await?;

            match origin.probe_idle(self.probe_timeout).await {
                Ok(Liveness::Alive) => {}
                Ok(Liveness::Closed) => {
                    info!(origin = %addr, "origin closed connection");
                    return Ok(Outcome::OriginClosed);
                }
                Ok(Liveness::Unexpected(byte)) => return Err(ProxyError::UnexpectedData(byte)),
                Err(err) => {
                    info!(origin = %addr, %err, "origin connection failed");
                    return Ok(Outcome::OriginClosed);
                }
            }

            req = match self.next_request(client).await? {
                Some(req) => req,
                None => return Ok(Outcome::ClientClosed),
            };

            match req.dispatch() {
                Dispatch::Get => {}
                Dispatch::Connect => return Err(ProxyError::ConnectAfterGet),
                Dispatch::Other => return Err(ProxyError::UnsupportedMethod(req.method)),
            }

            let next = self.origin_of(&req)?;
            if next != *addr {
                debug!(from = %addr, to = %next, "origin changed");
                close(origin).await;
                *origin = self.dial(&next).await?;
                *addr = next;
            }
        }
    }

    /// Forwards one GET and relays its reply back to the client.
    async fn exchange<S>(
        &self,
        req: &Request,
        client: &mut BufStream<S>,
        origin: &mut BufStream<D::Stream>,
    ) -> ProxyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_request(req, origin).await?;
        origin.flush().await?;

        let reply = read_reply(origin, self.limits).await?;
        let framing = reply.framing()?;
        debug!(status = ?reply.status_code(), ?framing, "reply");

        write_reply(&reply, client).await?;
        let res = relay_body(origin, client, framing).await;
        // a truncated body still reaches the client
        client.flush().await?;
        res?;

        Ok(())
    }

    async fn next_request<S>(&self, client: &mut BufStream<S>) -> ProxyResult<Option<Request>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match read_request(client, self.limits).await {
            Ok(req) => {
                debug!(method = %req.method, uri = %req.uri(), version = ?req.version(), "request");
                Ok(Some(req))
            }
            Err(HttpError::StreamEnded) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn origin_of(&self, req: &Request) -> ProxyResult<ServiceAddress> {
        let host = req.host().ok_or(ProxyError::MissingHost)?;
        Ok(ServiceAddress::parse_authority(host, Some(self.origin_port))?)
    }

    async fn dial(&self, addr: &ServiceAddress) -> ProxyResult<BufStream<D::Stream>> {
        match self.dialer.dial(addr).await {
            Ok(stream) => Ok(BufStream::new(stream)),
            Err(source) => Err(ProxyError::Dial {
                addr: addr.clone(),
                source,
            }),
        }
    }
}

fn connection_established() -> Reply {
    let status = StatusCode::OK;
    Reply {
        status_line: format!(
            "HTTP/1.1 {} {}",
            status.as_str(),
            status.canonical_reason().unwrap_or_default()
        ),
        headers: Headers::default(),
    }
}

async fn close<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io::{self, Cursor},
        pin::Pin,
        sync::{Arc, Mutex},
        task::{Context, Poll},
    };

    use tokio::io::{duplex, AsyncReadExt, DuplexStream, ReadBuf};

    use crate::{http::read_header_block, DialResult};

    use super::*;

    const REPLY: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";

    #[derive(Debug, Clone, Default)]
    struct TestDialer {
        origins: Arc<Mutex<VecDeque<DuplexStream>>>,
        dialed: Arc<Mutex<Vec<String>>>,
    }

    impl TestDialer {
        /// Returns the dialer and the origin-side ends of `n` connections.
        fn with_origins(n: usize) -> (Self, Vec<DuplexStream>) {
            let dialer = Self::default();
            let mut apps = vec![];
            for _ in 0..n {
                let (proxy_side, app_side) = duplex(4096);
                dialer.origins.lock().unwrap().push_back(proxy_side);
                apps.push(app_side);
            }
            (dialer, apps)
        }

        fn dialed(&self) -> Vec<String> {
            self.dialed.lock().unwrap().clone()
        }
    }

    impl Dialer for TestDialer {
        type Stream = DuplexStream;

        async fn dial(&self, addr: &ServiceAddress) -> DialResult<Self::Stream> {
            self.dialed.lock().unwrap().push(addr.to_string());
            self.origins
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    /// Origin that serves `reply` and then resets on the next read.
    #[derive(Debug)]
    struct ResettingOrigin {
        reply: Cursor<Vec<u8>>,
    }

    impl AsyncRead for ResettingOrigin {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.reply.position() < self.reply.get_ref().len() as u64 {
                return Pin::new(&mut self.reply).poll_read(cx, buf);
            }
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for ResettingOrigin {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[derive(Debug)]
    struct ResettingDialer;

    impl Dialer for ResettingDialer {
        type Stream = ResettingOrigin;

        async fn dial(&self, _addr: &ServiceAddress) -> DialResult<Self::Stream> {
            Ok(ResettingOrigin {
                reply: Cursor::new(REPLY.to_vec()),
            })
        }
    }

    /// Answers one request per entry of `replies`, returning the request
    /// lines seen. Keeps the connection open until the proxy closes it when
    /// `hold_open` is set.
    async fn run_origin(
        stream: DuplexStream,
        replies: Vec<&'static [u8]>,
        hold_open: bool,
    ) -> Vec<String> {
        let mut stream = BufStream::new(stream);
        let mut seen = vec![];
        for reply in replies {
            let lines = read_header_block(&mut stream, HttpLimitOption::default())
                .await
                .unwrap();
            seen.push(lines[0].clone());
            stream.write_all(reply).await.unwrap();
            stream.flush().await.unwrap();
        }
        if hold_open {
            let mut rest = vec![];
            let _ = stream.read_to_end(&mut rest).await;
        }
        seen
    }

    fn spawn_handler(
        dialer: TestDialer,
    ) -> (DuplexStream, tokio::task::JoinHandle<ProxyResult<Outcome>>) {
        let (client_app, client_proxy) = duplex(4096);
        let handler = ConnectionHandler::new(dialer, &ProxyOption::default());
        let handle = tokio::spawn(async move { handler.serve(client_proxy).await });
        (client_app, handle)
    }

    async fn read_n(stream: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_keep_alive_two_gets() {
        let (dialer, mut origins) = TestDialer::with_origins(1);
        let origin = tokio::spawn(run_origin(origins.remove(0), vec![REPLY, REPLY], true));
        let (mut client, handle) = spawn_handler(dialer.clone());

        let req = b"GET http://localhost/ HTTP/1.1\r\nHost: localhost\r\nConnection: Keep-Alive\r\n\r\n";
        client.write_all(req).await.unwrap();
        assert_eq!(read_n(&mut client, REPLY.len()).await, REPLY);

        client.write_all(req).await.unwrap();
        assert_eq!(read_n(&mut client, REPLY.len()).await, REPLY);

        client.shutdown().await.unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::ClientClosed);

        let seen = origin.await.unwrap();
        assert_eq!(seen, ["GET http://localhost/ HTTP/1.1"; 2]);
        assert_eq!(dialer.dialed(), ["localhost:80"]);
    }

    #[tokio::test]
    async fn test_origin_close_detected() {
        let reply: &'static [u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let (dialer, mut origins) = TestDialer::with_origins(1);
        let origin = tokio::spawn(run_origin(origins.remove(0), vec![reply], false));
        let (mut client, handle) = spawn_handler(dialer);

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n")
            .await
            .unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::OriginClosed);

        let mut received = vec![];
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, reply);
        origin.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_tunnel() {
        let (dialer, mut origins) = TestDialer::with_origins(1);
        let mut origin = origins.remove(0);
        let (mut client, handle) = spawn_handler(dialer.clone());

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nearly")
            .await
            .unwrap();
        assert_eq!(
            read_n(&mut client, 19).await,
            b"HTTP/1.1 200 OK\r\n\r\n"
        );

        let mut buf = [0u8; 5];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");

        origin.write_all(b"later!").await.unwrap();
        assert_eq!(read_n(&mut client, 6).await, b"later!");

        drop(origin);
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            Outcome::Tunneled {
                sent: 5,
                received: 6
            }
        );
        assert_eq!(dialer.dialed(), ["example.com:443"]);
    }

    #[tokio::test]
    async fn test_malformed_first_line() {
        let (dialer, _origins) = TestDialer::with_origins(1);
        let (mut client, handle) = spawn_handler(dialer.clone());

        client.write_all(b"GETHTTP/1.1\r\n\r\n").await.unwrap();

        let res = handle.await.unwrap();
        assert!(matches!(
            res,
            Err(ProxyError::Http(HttpError::MalformedRequest(_)))
        ));

        let mut received = vec![];
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
        assert!(dialer.dialed().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let (dialer, _origins) = TestDialer::with_origins(1);
        let (mut client, handle) = spawn_handler(dialer.clone());

        client
            .write_all(b"POST http://a/ HTTP/1.1\r\nHost: a\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        let res = handle.await.unwrap();
        assert!(matches!(res, Err(ProxyError::UnsupportedMethod(m)) if m == "POST"));

        let mut received = vec![];
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
        assert!(dialer.dialed().is_empty());
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let (dialer, _) = TestDialer::with_origins(0);
        let (mut client, handle) = spawn_handler(dialer);

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: unreachable.test\r\n\r\n")
            .await
            .unwrap();

        let res = handle.await.unwrap();
        assert!(matches!(res, Err(ProxyError::Dial { addr, .. }) if addr.port == 80));

        let mut received = vec![];
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_connect_dial_failure() {
        let (dialer, _) = TestDialer::with_origins(0);
        let (mut client, handle) = spawn_handler(dialer.clone());

        client
            .write_all(b"CONNECT x.test:443 HTTP/1.1\r\nHost: x.test:443\r\n\r\n")
            .await
            .unwrap();

        let res = handle.await.unwrap();
        assert!(matches!(res, Err(ProxyError::Dial { addr, .. }) if addr.to_string() == "x.test:443"));

        let mut received = vec![];
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
        assert_eq!(dialer.dialed(), ["x.test:443"]);
    }

    #[tokio::test]
    async fn test_origin_reset_after_reply() {
        let (mut client, server) = duplex(4096);
        let handler = ConnectionHandler::new(ResettingDialer, &ProxyOption::default());
        let handle = tokio::spawn(async move { handler.serve(server).await });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n")
            .await
            .unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), Outcome::OriginClosed);

        let mut received = vec![];
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, REPLY);
    }

    #[tokio::test]
    async fn test_client_closes_first() {
        let (dialer, _) = TestDialer::with_origins(0);
        let (client, handle) = spawn_handler(dialer);
        drop(client);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::ClientClosed);
    }

    #[tokio::test]
    async fn test_missing_host() {
        let (dialer, _) = TestDialer::with_origins(1);
        let (mut client, handle) = spawn_handler(dialer);

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        assert!(matches!(
            handle.await.unwrap(),
            Err(ProxyError::MissingHost)
        ));
    }

    #[tokio::test]
    async fn test_host_change_redials() {
        let (dialer, mut origins) = TestDialer::with_origins(2);
        let second = tokio::spawn(run_origin(origins.remove(1), vec![REPLY], true));
        let first = tokio::spawn(run_origin(origins.remove(0), vec![REPLY], true));
        let (mut client, handle) = spawn_handler(dialer.clone());

        client
            .write_all(b"GET http://a.test/ HTTP/1.1\r\nHost: a.test\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(read_n(&mut client, REPLY.len()).await, REPLY);

        client
            .write_all(b"GET http://b.test:8080/ HTTP/1.1\r\nHost: b.test:8080\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(read_n(&mut client, REPLY.len()).await, REPLY);

        client.shutdown().await.unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), Outcome::ClientClosed);

        assert_eq!(first.await.unwrap(), ["GET http://a.test/ HTTP/1.1"]);
        assert_eq!(second.await.unwrap(), ["GET http://b.test:8080/ HTTP/1.1"]);
        assert_eq!(dialer.dialed(), ["a.test:80", "b.test:8080"]);
    }

    #[tokio::test]
    async fn test_truncated_reply_forwards_partial() {
        let reply: &'static [u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello";
        let (dialer, mut origins) = TestDialer::with_origins(1);
        let origin = tokio::spawn(run_origin(origins.remove(0), vec![reply], false));
        let (mut client, handle) = spawn_handler(dialer);

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n")
            .await
            .unwrap();

        let res = handle.await.unwrap();
        assert!(matches!(
            res,
            Err(ProxyError::Http(HttpError::TruncatedBody {
                expected: 10,
                received: 5
            }))
        ));

        let mut received = vec![];
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, reply);
        origin.await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_origin_data() {
        let reply: &'static [u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nokX";
        let (dialer, mut origins) = TestDialer::with_origins(1);
        let origin = tokio::spawn(run_origin(origins.remove(0), vec![reply], true));
        let (mut client, handle) = spawn_handler(dialer);

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n")
            .await
            .unwrap();

        assert!(matches!(
            handle.await.unwrap(),
            Err(ProxyError::UnexpectedData(b'X'))
        ));

        let mut received = vec![];
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, &reply[..reply.len() - 1]);
        origin.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_after_get() {
        let (dialer, mut origins) = TestDialer::with_origins(1);
        let origin = tokio::spawn(run_origin(origins.remove(0), vec![REPLY], true));
        let (mut client, handle) = spawn_handler(dialer);

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(read_n(&mut client, REPLY.len()).await, REPLY);

        client
            .write_all(b"CONNECT a.test:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        assert!(matches!(
            handle.await.unwrap(),
            Err(ProxyError::ConnectAfterGet)
        ));
        origin.await.unwrap();
    }
}
