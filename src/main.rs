use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;
use kapibara_forward::{ProxyOption, ProxyServer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(author, version, about = "HTTP/1.1 forward proxy", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    host: IpAddr,

    /// Port for proxy traffic
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Port reserved for TLS interception (connections are closed)
    #[arg(long)]
    tls_port: Option<u16>,

    /// How long to wait for an idle origin to close after each reply
    #[arg(long, default_value_t = 40)]
    probe_timeout_ms: u64,
}

impl From<Cli> for ProxyOption {
    fn from(cli: Cli) -> Self {
        Self {
            listen: SocketAddr::new(cli.host, cli.port),
            tls_listen: cli.tls_port.map(|port| SocketAddr::new(cli.host, port)),
            probe_timeout_ms: cli.probe_timeout_ms,
            ..ProxyOption::default()
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kapibara_forward=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let option = ProxyOption::from(Cli::parse());
    let server = match ProxyServer::bind(option).await {
        Ok(server) => server,
        Err(err) => {
            error!(%err, "failed to bind");
            std::process::exit(1);
        }
    };

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    info!("bye");
}
