//! Direct dialer

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tracing::debug;

use crate::{Address, DialResult, Dialer, ServiceAddress};

/// Dials origins with a plain TCP connect, resolving domains through the
/// system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDialer;

impl Dialer for DirectDialer {
    type Stream = TcpStream;

    async fn dial(&self, addr: &ServiceAddress) -> DialResult<Self::Stream> {
        let stream = match &addr.addr {
            Address::Socket(ip) => TcpStream::connect(SocketAddr::new(*ip, addr.port)).await?,
            Address::Domain(domain) => TcpStream::connect((domain.as_str(), addr.port)).await?,
        };
        stream.set_nodelay(true)?;
        debug!(origin = %addr, resolved = !addr.addr.is_ip(), "dialed");

        Ok(stream)
    }
}
