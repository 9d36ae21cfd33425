// Pest control daemon: accepts field clients, dials the per-site authority, reconciles policies.

mod config;
mod transport;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut port_arg = None;
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("pest-daemon {}", VERSION);
            return Ok(());
        }
        port_arg = Some(
            arg.parse::<u16>()
                .with_context(|| format!("invalid listen port {arg:?}"))?,
        );
    }

    let (mut cfg, config_problem) = config::load();
    if let Some(p) = port_arg {
        cfg.listen_port = p;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .with_context(|| format!("invalid log level {:?}", cfg.log_level))?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    if let Some(e) = config_problem {
        tracing::warn!(error = %format!("{e:#}"), "ignoring config file, using defaults");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.listen_port))
            .await
            .with_context(|| format!("failed to bind port {}", cfg.listen_port))?;
        tracing::info!(addr = %listener.local_addr()?, authority = %cfg.authority_host, "listening");
        let authority = transport::AuthorityAddr {
            host: cfg.authority_host.clone(),
            port: cfg.authority_port,
        };
        tokio::select! {
            r = transport::run_transport(listener, authority) => r.context("accept loop failed")?,
            r = shutdown_signal() => r?,
        }
        tracing::info!("shutting down");
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
