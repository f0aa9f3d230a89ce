//! Protocol-neutral listener: bind a TCP (optionally TLS) socket, accept,
//! gate on loopback, hand each accepted stream to the protocol's
//! connection handler on its own task.

use crate::config::Config;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Client stream: plain TCP or TLS-wrapped, so the same connection
/// handlers serve both listener flavors.
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Per-protocol connection handler capability. The listener owns the
/// socket lifecycle; the handler owns everything after accept.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    fn protocol_name(&self) -> &'static str;

    async fn handle(&self, stream: ClientStream, peer: SocketAddr) -> Result<()>;
}

pub struct GatewayListener {
    listener: TcpListener,
    port: u16,
    allow_remote: bool,
    /// When Some, the listener speaks TLS; the handle is swappable so a
    /// certificate reload does not require a rebind.
    tls_acceptor: Option<Arc<ArcSwap<TlsAcceptor>>>,
    handler: Arc<dyn ConnectionHandler>,
}

impl GatewayListener {
    /// Bind the server socket. A configured port of 0 falls back to the
    /// protocol default.
    pub async fn bind(
        config: &Config,
        default_port: u16,
        tls_acceptor: Option<Arc<ArcSwap<TlsAcceptor>>>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self> {
        let port = if config.listen.port == 0 {
            default_port
        } else {
            config.listen.port
        };
        let bind_address = config
            .listen
            .bind_address
            .clone()
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let addr = format!("{}:{}", bind_address, port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {} listener on {}", handler.protocol_name(), addr))?;
        info!(
            "{} listener bound on {}{}",
            handler.protocol_name(),
            listener.local_addr()?,
            if tls_acceptor.is_some() { " (TLS)" } else { "" }
        );
        Ok(Self {
            listener,
            port,
            allow_remote: config.listen.allow_remote,
            tls_acceptor,
            handler,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Runs until the task is dropped; accept errors are
    /// logged and the loop continues.
    pub async fn serve(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("connection from {}", peer_addr);
                    if !self.allow_remote && !is_loopback_peer(peer_addr.ip()) {
                        warn!("external connection from {} refused", peer_addr);
                        drop(stream);
                        continue;
                    }
                    let handler = Arc::clone(&self.handler);
                    let acceptor = self.tls_acceptor.clone();
                    tokio::spawn(async move {
                        let client_stream = if let Some(swap) = acceptor {
                            let acceptor = swap.load();
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => ClientStream::Tls(tls_stream),
                                Err(e) => {
                                    error!("TLS handshake failed for {}: {}", peer_addr, e);
                                    return;
                                }
                            }
                        } else {
                            ClientStream::Tcp(stream)
                        };
                        if let Err(e) = handler.handle(client_stream, peer_addr).await {
                            error!("Error handling client {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Only loopback peers are served unless allow_remote is set. The IPv6
/// link-local address fe80::1 appears on the loopback interface on macOS
/// and is treated as local.
pub fn is_loopback_peer(ip: IpAddr) -> bool {
    const MACOS_LINK_LOCAL_LOOPBACK: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6 == MACOS_LINK_LOCAL_LOOPBACK
                || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_loopback_gate() {
        assert!(is_loopback_peer(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(is_loopback_peer("127.0.0.2".parse().unwrap()));
        assert!(is_loopback_peer(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_loopback_peer("fe80::1".parse().unwrap()));
        assert!(is_loopback_peer("::ffff:127.0.0.1".parse().unwrap()));

        assert!(!is_loopback_peer("192.168.1.10".parse().unwrap()));
        assert!(!is_loopback_peer("10.0.0.1".parse().unwrap()));
        assert!(!is_loopback_peer("fe80::2".parse().unwrap()));
        assert!(!is_loopback_peer("2001:db8::1".parse().unwrap()));
    }

    struct CountingHandler {
        connections: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionHandler for CountingHandler {
        fn protocol_name(&self) -> &'static str {
            "TEST"
        }

        async fn handle(&self, mut stream: ClientStream, _peer: SocketAddr) -> Result<()> {
            self.connections.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf).await;
            Ok(())
        }
    }

    fn local_config() -> Config {
        let mut config = Config::default();
        config.listen.bind_address = Some("127.0.0.1".to_string());
        config.listen.port = 0;
        config
    }

    #[tokio::test]
    async fn test_accept_spawns_handler() {
        let handler = Arc::new(CountingHandler {
            connections: AtomicUsize::new(0),
        });
        let config = local_config();
        // default port 0 keeps the bind on an ephemeral port for the test
        let listener = GatewayListener::bind(&config, 0, None, Arc::clone(&handler) as _)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let listener = Arc::new(listener);
        let serve = Arc::clone(&listener);
        tokio::spawn(async move {
            let _ = serve.serve().await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.connections.load(Ordering::SeqCst), 1);
    }
}
