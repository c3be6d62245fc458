//! Stream utils

use std::{future::Future, io, time::Duration};

use tokio::io::{AsyncRead, AsyncReadExt};

/// State of an idle peer observed by [`IdleProbe::probe_idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Nothing arrived before the deadline.
    Alive,
    /// The peer closed its side.
    Closed,
    /// A byte arrived on a stream that should have been silent.
    Unexpected(u8),
}

/// Idle-peek with a bounded timeout.
///
/// A half-closed peer on an otherwise idle socket is only noticed by reading
/// from it, so the probe attempts to read a single byte and gives up after
/// `timeout`. The deadline applies to this read only.
pub trait IdleProbe {
    fn probe_idle(&mut self, timeout: Duration) -> impl Future<Output = io::Result<Liveness>> + Send;
}

impl<S> IdleProbe for S
where
    S: AsyncRead + Unpin + Send,
{
    async fn probe_idle(&mut self, timeout: Duration) -> io::Result<Liveness> {
        let mut byte = [0u8; 1];
        match tokio::time::timeout(timeout, self.read(&mut byte)).await {
            Err(_elapsed) => Ok(Liveness::Alive),
            Ok(Ok(0)) => Ok(Liveness::Closed),
            Ok(Ok(_)) => Ok(Liveness::Unexpected(byte[0])),
            Ok(Err(err)) => Err(err),
        }
    }
}
