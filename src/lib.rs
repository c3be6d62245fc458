//! Kapibara forward proxy library

use tokio::io::{AsyncRead, AsyncWrite};

pub mod error;
pub use error::{AddressError, ProxyError};

pub mod option;
pub use option::{HttpLimitOption, ProxyOption};

pub mod address;
pub use address::{Address, ServiceAddress};

pub mod stream;
pub use stream::{IdleProbe, Liveness};

pub mod direct;
pub use direct::DirectDialer;

pub mod http;
pub use self::http::{ConnectionHandler, HttpError, Outcome};

pub mod server;
pub use server::ProxyServer;

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;
pub type DialResult<T> = std::result::Result<T, std::io::Error>;

/// Opens the origin side of a proxied connection.
#[trait_variant::make(Dialer: Send + Sync)]
pub trait LocalDialer {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static;

    async fn dial(&self, addr: &ServiceAddress) -> DialResult<Self::Stream>;
}
