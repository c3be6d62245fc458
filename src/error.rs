//! Kapibara Forward Error

use thiserror::Error;

use crate::{http::HttpError, ServiceAddress};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("io error ({0})")]
    Io(#[from] std::io::Error),
    #[error("http error ({0})")]
    Http(#[from] HttpError),
    #[error("address error ({0})")]
    Address(#[from] AddressError),
    #[error("dial {addr} failed ({source})")]
    Dial {
        addr: ServiceAddress,
        source: std::io::Error,
    },
    #[error("unsupported method {0}")]
    UnsupportedMethod(String),
    #[error("missing host header")]
    MissingHost,
    #[error("unexpected data from idle origin (0x{0:02x})")]
    UnexpectedData(u8),
    #[error("connect after get on the same connection")]
    ConnectAfterGet,
}

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid address {0}")]
    InvalidAddress(String),
    #[error("invalid port {0}")]
    InvalidPort(String),
}
