//! Address

use std::{fmt::Display, net::IpAddr, str::FromStr};

use crate::error::AddressError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddress {
    pub addr: Address,
    pub port: u16,
}

impl ServiceAddress {
    pub fn new(addr: Address, port: u16) -> Self {
        Self { addr, port }
    }

    /// Parses an authority (`host:port`, `[v6]:port`, or a bare host when
    /// `default_port` is given).
    pub fn parse_authority(s: &str, default_port: Option<u16>) -> Result<Self, AddressError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::InvalidAddress(s.to_owned()));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| AddressError::InvalidAddress(s.to_owned()))?;
            match after {
                "" => (host, None),
                p => match p.strip_prefix(':') {
                    Some(p) => (host, Some(p)),
                    None => return Err(AddressError::InvalidAddress(s.to_owned())),
                },
            }
        } else if IpAddr::from_str(s).is_ok() {
            (s, None)
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(AddressError::InvalidAddress(s.to_owned()));
        }

        let port = match (port, default_port) {
            (Some(p), _) => p
                .parse::<u16>()
                .map_err(|_| AddressError::InvalidPort(s.to_owned()))?,
            (None, Some(p)) => p,
            (None, None) => return Err(AddressError::InvalidPort(s.to_owned())),
        };

        Ok(Self {
            addr: host.parse::<Address>()?,
            port,
        })
    }
}

impl Display for ServiceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.addr {
            Address::Socket(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            _ => write!(f, "{}:{}", self.addr, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Socket(IpAddr),
    Domain(String),
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Domain(s) => write!(f, "{}", s),
            Address::Socket(s) => write!(f, "{}", s),
        }
    }
}

impl Address {
    pub fn is_ip(&self) -> bool {
        matches!(self, Self::Socket(_))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match IpAddr::from_str(s) {
            Ok(ip) => Ok(Self::Socket(ip)),
            Err(_) => Ok(Self::Domain(s.to_ascii_lowercase())),
        }
    }
}
