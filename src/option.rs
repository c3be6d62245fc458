//! Proxy Option

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyOption {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Listener reserved for TLS interception, which is not implemented.
    #[serde(default)]
    pub tls_listen: Option<SocketAddr>,
    #[serde(default = "default_origin_port")]
    pub origin_port: u16,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default)]
    pub limits: HttpLimitOption,
}

impl ProxyOption {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for ProxyOption {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tls_listen: None,
            origin_port: default_origin_port(),
            probe_timeout_ms: default_probe_timeout_ms(),
            limits: HttpLimitOption::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpLimitOption {
    #[serde(default = "default_max_headers")]
    pub max_headers: usize,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
}

impl Default for HttpLimitOption {
    fn default() -> Self {
        Self {
            max_headers: default_max_headers(),
            max_header_size: default_max_header_size(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080)
}

fn default_origin_port() -> u16 {
    80
}

fn default_probe_timeout_ms() -> u64 {
    40
}

fn default_max_headers() -> usize {
    crate::http::MAX_HEADER
}

fn default_max_header_size() -> usize {
    crate::http::MAX_HEADER_SIZE
}
