//! peek-relay: forwards an upstream body unchanged while handing small
//! bodies to a logging collaborator.
//!
//! `GET /clone` relays through the duplicate-and-discard strategy,
//! `GET /stream` through splice-and-continue. Both answer with the upstream
//! response plus an `x-first-chunk-length` header.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use http_body_util::BodyExt;
use hyper::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use peek_relay::config::RelayConfig;
use peek_relay::logging_layer::logging_layer;
use peek_relay::proxy_service::{RelayService, UnifiedBody};
use peek_relay::upstream::HttpUpstream;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceBuilder};
use tracing::{error, info, warn};

/// Command line configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Config {
    /// Port to listen on
    #[arg(short, long, env = "PEEKRELAY_PORT", default_value = "8787")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// URL whose response body is relayed (e.g. "https://files.example.com/big.zip")
    #[arg(long, env = "PEEKRELAY_UPSTREAM_URL")]
    upstream_url: String,

    /// Graceful shutdown timeout in seconds
    #[arg(long, env = "PEEKRELAY_SHUTDOWN_TIMEOUT", default_value = "30")]
    shutdown_timeout: u64,
}

/// Counts live connections so shutdown can wait for them.
#[derive(Clone, Default)]
struct ConnectionTracker {
    active: Arc<AtomicUsize>,
}

impl ConnectionTracker {
    fn increment(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli_config = Config::parse();
    let relay_config = RelayConfig::from_env();
    relay_config.validate()?;

    let addr = format!("{}:{}", cli_config.bind, cli_config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!(
        addr = %addr,
        upstream = %cli_config.upstream_url,
        inspect_threshold = relay_config.inspect_threshold,
        remainder_chunk_size = relay_config.remainder_chunk_size,
        missing_length_as_zero = relay_config.missing_length_as_zero,
        tcp_nodelay = relay_config.tcp_nodelay,
        shutdown_timeout = cli_config.shutdown_timeout,
        "peek-relay starting"
    );

    let shutdown = CancellationToken::new();
    let upstream = Arc::new(HttpUpstream::new(&cli_config.upstream_url, &relay_config)?);
    let relay_service = RelayService::new(upstream, relay_config.clone())
        .with_cancel_token(shutdown.child_token());
    let service_stack = ServiceBuilder::new()
        .layer(logging_layer())
        .service(relay_service);

    spawn_signal_handlers(shutdown.clone());

    let tracker = ConnectionTracker::default();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = configure_tcp_stream(&stream, &relay_config) {
                            error!(error = %e, "Failed to configure socket");
                        }

                        let service_stack = service_stack.clone();
                        let conn_shutdown = shutdown.clone();
                        let tracker = tracker.clone();
                        tracker.increment();

                        tokio::spawn(async move {
                            handle_connection(stream, peer_addr, service_stack, conn_shutdown).await;
                            tracker.decrement();
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }

            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping new connections");
                break;
            }
        }
    }

    info!(
        active_connections = tracker.count(),
        timeout_seconds = cli_config.shutdown_timeout,
        "Waiting for active connections to drain"
    );

    let deadline = Duration::from_secs(cli_config.shutdown_timeout);
    let start = Instant::now();
    while tracker.count() > 0 {
        if start.elapsed() >= deadline {
            warn!(
                active_connections = tracker.count(),
                "Shutdown timeout reached, forcing exit"
            );
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    if tracker.count() == 0 {
        info!("All connections drained, shutting down cleanly");
    }

    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
fn spawn_signal_handlers(shutdown: CancellationToken) {
    let on_sigint = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT, initiating graceful shutdown");
                on_sigint.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating graceful shutdown");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
        }
    });
}

/// Serve one connection until it closes or shutdown is requested.
async fn handle_connection<S, B>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: S,
    shutdown: CancellationToken,
) where
    S: Service<Request<Incoming>, Response = hyper::Response<B>> + Clone + Send + 'static,
    S::Error: std::fmt::Display + Into<peek_relay::error::RelayError>,
    S::Future: Send + 'static,
    B: http_body::Body<Data = bytes::Bytes, Error = peek_relay::error::RelayError>
        + Send
        + 'static,
{
    let io = TokioIo::new(stream);

    let svc_fn = hyper::service::service_fn(move |req| {
        let mut svc = service.clone();
        async move {
            let response: hyper::Response<UnifiedBody> = match svc.call(req).await {
                Ok(response) => response.map(|body| body.boxed_unsync()),
                Err(e) => {
                    error!(error = %e, "Relay failed before response head");
                    let e: peek_relay::error::RelayError = e.into();
                    e.to_response().map(|body| {
                        body.map_err(|never: Infallible| match never {})
                            .boxed_unsync()
                    })
                }
            };
            Ok::<_, Infallible>(response)
        }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, svc_fn);
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                warn!(peer = %peer_addr, error = %e, "Connection error");
            }
        }
        _ = shutdown.cancelled() => {
            info!(peer = %peer_addr, "Gracefully closing connection");
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(Duration::from_secs(5), conn).await;
        }
    }
}

/// Apply TCP_NODELAY and keepalive to an accepted socket.
fn configure_tcp_stream(stream: &TcpStream, config: &RelayConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    let socket = socket2::SockRef::from(stream);
    let keepalive =
        socket2::TcpKeepalive::new().with_time(Duration::from_secs(config.tcp_keepalive_secs));
    socket.set_tcp_keepalive(&keepalive)?;

    Ok(())
}
