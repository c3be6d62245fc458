//! CONNECT tunnel - opaque byte pipe between client and origin

use std::{io, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
};
use tracing::{debug, warn};

const TUNNEL_BUF_SIZE: usize = 8 * 1024;

/// Pumps bytes both ways until either side ends, returning the bytes sent
/// to the origin and received from it.
///
/// The origin to client direction runs on a spawned task. Whichever
/// direction ends first raises the shared done flag, which stops the other
/// one at its next read or write; the spawned task is joined before
/// returning, and both streams are dropped with it.
pub async fn tunnel<C, O>(client: C, origin: O) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    O: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut origin_rd, mut origin_wr) = tokio::io::split(origin);

    let (done, _) = watch::channel(false);
    let done = Arc::new(done);
    let stop_down = done.subscribe();
    let stop_up = done.subscribe();

    let downstream = tokio::spawn({
        let done = done.clone();
        async move { pump(&mut origin_rd, &mut client_wr, &done, stop_down, "origin->client").await }
    });
    let sent = pump(&mut client_rd, &mut origin_wr, &done, stop_up, "client->origin").await;

    let received = match downstream.await {
        Ok(n) => n,
        Err(err) => {
            warn!(%err, "tunnel task failed");
            0
        }
    };

    debug!(sent, received, "tunnel closed");
    (sent, received)
}

async fn pump<R, W>(
    rd: &mut R,
    wr: &mut W,
    done: &watch::Sender<bool>,
    mut stop: watch::Receiver<bool>,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let res = copy_until_stopped(rd, wr, &mut stop, &mut total).await;

    done.send_replace(true);
    let _ = wr.shutdown().await;

    if let Err(err) = res {
        // a reset or closed peer ends the tunnel like an orderly close
        debug!(direction, %err, "tunnel direction ended");
    }

    total
}

async fn copy_until_stopped<R, W>(
    rd: &mut R,
    wr: &mut W,
    stop: &mut watch::Receiver<bool>,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; TUNNEL_BUF_SIZE];

    loop {
        let n = tokio::select! {
            r = rd.read(&mut buf) => r?,
            _ = stop.changed() => return Ok(()),
        };
        if n == 0 {
            return Ok(());
        }

        tokio::select! {
            r = async {
                wr.write_all(&buf[..n]).await?;
                wr.flush().await
            } => r?,
            _ = stop.changed() => return Ok(()),
        }
        *total += n as u64;
    }
}
