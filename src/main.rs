#![forbid(unsafe_code)]

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

mod auth;
mod challenge;
mod config;
mod crypto;
mod error;
mod httpd;
mod ntlm;
mod rdg;
mod tls;
mod users;

use auth::Authenticator;
use httpd::AppState;
use rdg::registry::SessionRegistry;
use users::{StaticPolicy, UserStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| {
            std::env::args()
                .position(|a| a == "--config")
                .and_then(|i| std::env::args().nth(i + 1))
        })
        .unwrap_or_else(|| "config.toml".to_string());

    let config = config::load_config(&config_path)?;

    for user in &config.users {
        if !config.targets.keys().any(|t| t.eq_ignore_ascii_case(&user.username)) {
            warn!("User '{}' has no RDP target assigned", user.username);
        }
    }

    let store = Arc::new(UserStore::from_config(&config.users));
    let state = Arc::new(AppState {
        gateway: config.gateway.clone(),
        authenticator: Authenticator::new(store),
        policy: StaticPolicy::from_config(&config),
        registry: SessionRegistry::default(),
    });

    let acceptor = tls::build_acceptor(&config.tls)?;
    let listener = TcpListener::bind(&config.bind).await?;
    info!("RDP gateway listening on https://{}", config.bind);
    info!(
        "Users: {}, targets: {}",
        config.users.len(),
        config.targets.len()
    );

    // Track sessions so shutdown can drain them after the listener closes
    let tracker = TaskTracker::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        if let Err(e) = set_socket_buffers(&stream, &config.gateway) {
                            warn!("Cannot set socket buffers for {}: {}", peer, e);
                        }
                        let acceptor = acceptor.clone();
                        let state = state.clone();
                        tracker.spawn(async move {
                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(s) => s,
                                Err(e) => {
                                    warn!("TLS handshake with {} failed: {}", peer, e);
                                    return;
                                }
                            };
                            if let Err(e) =
                                httpd::serve_connection(tls_stream, peer.to_string(), state).await
                            {
                                info!("Connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {:?}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received, draining sessions");
                break;
            }
        }
    }

    drop(listener);
    tracker.close();
    tracker.wait().await;
    info!("All sessions drained, exiting");
    Ok(())
}

/// Resolves on SIGTERM or Ctrl-C.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Apply configured SO_SNDBUF/SO_RCVBUF before the stream enters the TLS
/// layer; past that point the socket is no longer reachable.
fn set_socket_buffers(
    stream: &tokio::net::TcpStream,
    conf: &config::GatewayConfig,
) -> std::io::Result<()> {
    if conf.send_buf == 0 && conf.receive_buf == 0 {
        return Ok(());
    }
    let sock = socket2::SockRef::from(stream);
    if conf.receive_buf > 0 {
        sock.set_recv_buffer_size(conf.receive_buf)?;
    }
    if conf.send_buf > 0 {
        sock.set_send_buffer_size(conf.send_buf)?;
    }
    Ok(())
}
