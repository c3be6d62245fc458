//! Proxy server - accept clients and serve each one on its own task

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{ConnectionHandler, Dialer, DirectDialer, ProxyOption};

#[derive(Debug)]
pub struct ProxyServer<D = DirectDialer> {
    listener: TcpListener,
    tls_listener: Option<TcpListener>,
    handler: Arc<ConnectionHandler<D>>,
}

impl ProxyServer<DirectDialer> {
    pub async fn bind(option: ProxyOption) -> io::Result<Self> {
        Self::with_dialer(option, DirectDialer).await
    }
}

impl<D> ProxyServer<D>
where
    D: Dialer + 'static,
{
    pub async fn with_dialer(option: ProxyOption, dialer: D) -> io::Result<Self> {
        let listener = TcpListener::bind(option.listen).await?;
        let tls_listener = match option.tls_listen {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let handler = Arc::new(ConnectionHandler::new(dialer, &option));

        Ok(Self {
            listener,
            tls_listener,
            handler,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn tls_local_addr(&self) -> Option<SocketAddr> {
        self.tls_listener.as_ref()?.local_addr().ok()
    }

    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Serves connections until `shutdown` resolves. Connections already
    /// accepted keep running on their own tasks.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(addr = ?self.listener.local_addr().ok(), "proxy listening");

        let tls_task = self.tls_listener.map(|listener| {
            info!(addr = ?listener.local_addr().ok(), "tls listener (interception not implemented)");
            tokio::spawn(refuse_tls(listener))
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => serve_client(self.handler.clone(), stream, peer),
                    Err(err) => warn!(%err, "accept failed"),
                },
                _ = &mut shutdown => break,
            }
        }

        if let Some(task) = tls_task {
            task.abort();
        }
        info!("proxy stopped");
    }
}

fn serve_client<D>(handler: Arc<ConnectionHandler<D>>, stream: TcpStream, peer: SocketAddr)
where
    D: Dialer + 'static,
{
    let _ = stream.set_nodelay(true);
    let span = info_span!("conn", id = %Uuid::new_v4(), %peer);

    tokio::spawn(
        async move {
            match handler.serve(stream).await {
                Ok(outcome) => debug!(?outcome, "connection closed"),
                Err(err) => warn!(%err, "connection failed"),
            }
        }
        .instrument(span),
    );
}

async fn refuse_tls(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((mut stream, peer)) => {
                debug!(%peer, "closing tls connection");
                let _ = stream.shutdown().await;
            }
            Err(err) => warn!(%err, "tls accept failed"),
        }
    }
}
