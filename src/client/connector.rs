use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use hyper::client::connect::{Connected, Connection};
use hyper::service::Service;
use hyper::Uri;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

tokio::task_local! {
    /// Per-request phase trace. `HttpClient::do_request` installs a fresh
    /// cell around each request future; the connector fills it in while
    /// dialing. A pooled connection never re-enters the connector, so reused
    /// connections leave every phase unset — exactly the "zero means not
    /// observed" contract the aggregator relies on.
    pub(crate) static PHASE_TRACE: RefCell<PhaseTrace>;
}

/// Timestamps captured while establishing a connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTrace {
    pub dns_start: Option<Instant>,
    pub dns_done: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub connect_done: Option<Instant>,
    pub tls_start: Option<Instant>,
    pub tls_done: Option<Instant>,
}

impl PhaseTrace {
    pub fn dns_lookup(&self) -> std::time::Duration {
        span(self.dns_start, self.dns_done)
    }

    pub fn tcp_handshake(&self) -> std::time::Duration {
        span(self.connect_start, self.connect_done)
    }

    pub fn tls_handshake(&self) -> std::time::Duration {
        span(self.tls_start, self.tls_done)
    }
}

fn span(start: Option<Instant>, done: Option<Instant>) -> std::time::Duration {
    match (start, done) {
        (Some(start), Some(done)) => done.saturating_duration_since(start),
        _ => std::time::Duration::ZERO,
    }
}

fn mark(f: impl FnOnce(&mut PhaseTrace)) {
    // Outside a traced request (config probe warm-up, dashboard) the cell is
    // absent and the mark is silently discarded.
    let _ = PHASE_TRACE.try_with(|cell| f(&mut cell.borrow_mut()));
}

/// Connector that performs DNS resolution, TCP dial and TLS handshake as
/// separate, individually timed steps, then hands the finished stream to
/// hyper. Stock connectors collapse those phases into one opaque future,
/// which is what makes them unusable for phase-level measurement.
#[derive(Clone)]
pub struct TimedConnector {
    tls: TlsConnector,
}

impl TimedConnector {
    pub fn new() -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                anchor.subject,
                anchor.spki,
                anchor.name_constraints,
            )
        }));
        let mut config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        // Offer h2 so servers that speak HTTP/2 get it over ALPN.
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    async fn connect(tls: TlsConnector, dst: Uri) -> io::Result<TimedStream> {
        let host = dst
            .host()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "url has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let https = dst.scheme_str() == Some("https");
        let port = dst.port_u16().unwrap_or(if https { 443 } else { 80 });

        let addrs: Vec<SocketAddr> = if let Ok(ip) = host.parse::<IpAddr>() {
            // IP literal: no lookup happened, so no DNS phase is recorded.
            vec![SocketAddr::new(ip, port)]
        } else {
            mark(|t| t.dns_start = Some(Instant::now()));
            let resolved: Vec<SocketAddr> = lookup_host((host.as_str(), port)).await?.collect();
            mark(|t| t.dns_done = Some(Instant::now()));
            resolved
        };
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {host}"),
            ));
        }

        mark(|t| t.connect_start = Some(Instant::now()));
        let stream = dial_any(&addrs).await?;
        mark(|t| t.connect_done = Some(Instant::now()));
        stream.set_nodelay(true)?;

        if !https {
            return Ok(TimedStream::Plain(stream));
        }

        let server_name = rustls::ServerName::try_from(host.as_str())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        mark(|t| t.tls_start = Some(Instant::now()));
        let tls_stream = tls.connect(server_name, stream).await?;
        mark(|t| t.tls_done = Some(Instant::now()));

        let h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2");
        Ok(TimedStream::Tls(Box::new(tls_stream), h2))
    }
}

impl Default for TimedConnector {
    fn default() -> Self {
        Self::new()
    }
}

async fn dial_any(addrs: &[SocketAddr]) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address to dial")))
}

impl Service<Uri> for TimedConnector {
    type Response = TimedStream;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<TimedStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        Box::pin(Self::connect(self.tls.clone(), dst))
    }
}

/// Established connection, plain or TLS.
#[derive(Debug)]
pub enum TimedStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>, bool),
}

impl Connection for TimedStream {
    fn connected(&self) -> Connected {
        match self {
            TimedStream::Plain(_) => Connected::new(),
            TimedStream::Tls(_, h2) => {
                let connected = Connected::new();
                if *h2 {
                    connected.negotiated_h2()
                } else {
                    connected
                }
            }
        }
    }
}

impl AsyncRead for TimedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TimedStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            TimedStream::Tls(stream, _) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TimedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TimedStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            TimedStream::Tls(stream, _) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TimedStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            TimedStream::Tls(stream, _) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TimedStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            TimedStream::Tls(stream, _) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
