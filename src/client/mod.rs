//! Instrumented HTTP client.
//!
//! One shared client (one hyper connection pool) serves every virtual user.
//! Each `do_request` produces exactly one [`Measurement`] — success or
//! failure — and returns an [`HttpResponse`] the script can inspect and
//! chain assertions on. Transport failures never surface as Rust errors to
//! the script; they are classified into synthetic status codes instead.

mod connector;

use std::cell::RefCell;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::header::{HeaderMap, USER_AGENT};
use http::Method;
use hyper::{Body, Request, Uri};
use typed_builder::TypedBuilder;

pub use connector::{PhaseTrace, TimedConnector, TimedStream};
use connector::PHASE_TRACE;

use crate::metric::{Measurement, RecordEmitter};

/// Sent with every request, as the original tool does.
pub const USER_AGENT_STRING: &str = "Accelira perf testing tool/1.0";

/// Synthetic status codes for classified failures.
pub const STATUS_TIMEOUT: u16 = 408;
pub const STATUS_CONNECTION_REFUSED: u16 = 503;
pub const STATUS_TRANSPORT_FAILURE: u16 = 511;
pub const STATUS_UNCLASSIFIED: u16 = 500;

/// Connection-pool and timeout knobs.
///
/// Defaults satisfy the engine's floor requirements (total request timeout
/// ≥ 30 s, idle timeout ≥ 10 s); the executor raises `max_idle_per_host` to
/// the configured concurrency so keep-alive connections are never the
/// bottleneck.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ClientSettings {
    #[builder(default = Duration::from_secs(30))]
    pub request_timeout: Duration,
    #[builder(default = Duration::from_secs(90))]
    pub pool_idle_timeout: Duration,
    #[builder(default = 32)]
    pub max_idle_per_host: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// What the script receives back from `http.get` and friends.
///
/// Failures carry their synthetic status and an empty body, so a script can
/// always chain `assertStatus` without caring whether the transport worked.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: String,
    pub url: String,
    pub method: String,
    pub duration: Duration,
    pub tcp_handshake_latency: Duration,
    pub tls_handshake_latency: Duration,
    pub dns_lookup_latency: Duration,
    pub error: bool,
}

pub struct HttpClient {
    inner: hyper::Client<TimedConnector, Body>,
    settings: ClientSettings,
}

impl HttpClient {
    pub fn new(settings: ClientSettings) -> Arc<Self> {
        let inner = hyper::Client::builder()
            .pool_idle_timeout(settings.pool_idle_timeout)
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .build(TimedConnector::new());
        Arc::new(Self { inner, settings })
    }

    /// Client sized for a run with `concurrent_users` virtual users.
    pub fn for_concurrency(concurrent_users: usize) -> Arc<Self> {
        Self::new(
            ClientSettings::builder()
                .max_idle_per_host(concurrent_users.max(32))
                .build(),
        )
    }

    /// Issue one request and emit exactly one measurement for it.
    pub async fn do_request(
        &self,
        method: Method,
        url: &str,
        body: Option<String>,
        emitter: &RecordEmitter,
    ) -> HttpResponse {
        let started = Instant::now();
        let method_name = method.as_str().to_string();

        let (outcome, trace) = PHASE_TRACE
            .scope(RefCell::new(PhaseTrace::default()), async {
                let outcome = self.attempt(method, url, body, started).await;
                let trace = PHASE_TRACE.with(|cell| *cell.borrow());
                (outcome, trace)
            })
            .await;

        let duration = started.elapsed();
        let tcp = trace.tcp_handshake();
        let dns = trace.dns_lookup();
        let tls = trace.tls_handshake();

        let (status_code, body_text, bytes_received, bytes_sent, error) = match outcome {
            Ok(success) => (
                success.status,
                success.body,
                success.bytes_received,
                success.bytes_sent,
                success.body_read_failed,
            ),
            Err(failure) => (failure.status, String::new(), 0, failure.bytes_sent, true),
        };

        emitter.emit(Measurement::http(
            method_name.clone(),
            url,
            status_code,
            duration,
            tcp,
            dns,
            tls,
            bytes_received,
            bytes_sent,
            error,
        ));

        HttpResponse {
            status_code,
            body: body_text,
            url: url.to_string(),
            method: method_name,
            duration,
            tcp_handshake_latency: tcp,
            tls_handshake_latency: tls,
            dns_lookup_latency: dns,
            error,
        }
    }

    async fn attempt(
        &self,
        method: Method,
        url: &str,
        body: Option<String>,
        started: Instant,
    ) -> Result<RequestSuccess, RequestFailure> {
        let uri: Uri = url.parse().map_err(|_| RequestFailure {
            status: STATUS_UNCLASSIFIED,
            bytes_sent: 0,
        })?;

        let body_len = body.as_ref().map_or(0, |b| b.len() as u64);
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_AGENT, USER_AGENT_STRING)
            .body(body.map_or_else(Body::empty, Body::from))
            .map_err(|_| RequestFailure {
                status: STATUS_UNCLASSIFIED,
                bytes_sent: 0,
            })?;
        let bytes_sent = header_bytes(request.headers()) + body_len;

        let response = match tokio::time::timeout(
            self.settings.request_timeout,
            self.inner.request(request),
        )
        .await
        {
            Err(_elapsed) => {
                return Err(RequestFailure {
                    status: STATUS_TIMEOUT,
                    bytes_sent,
                })
            }
            Ok(Err(err)) => {
                return Err(RequestFailure {
                    status: classify_transport_error(&err),
                    bytes_sent,
                })
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status().as_u16();
        let header_received = header_bytes(response.headers());

        // The body read shares the request's total time budget. Reading it
        // fully releases the connection back into the keep-alive pool.
        let remaining = self
            .settings
            .request_timeout
            .saturating_sub(started.elapsed());
        let body_result =
            tokio::time::timeout(remaining, hyper::body::to_bytes(response.into_body())).await;

        match body_result {
            Ok(Ok(bytes)) => Ok(RequestSuccess {
                status,
                bytes_received: header_received + bytes.len() as u64,
                bytes_sent,
                body: String::from_utf8_lossy(&bytes).into_owned(),
                body_read_failed: false,
            }),
            // Headers arrived but the body did not: keep the real status,
            // count the request, flag it as an error.
            Ok(Err(_)) | Err(_) => Ok(RequestSuccess {
                status,
                bytes_received: header_received,
                bytes_sent,
                body: String::new(),
                body_read_failed: true,
            }),
        }
    }
}

struct RequestSuccess {
    status: u16,
    bytes_received: u64,
    bytes_sent: u64,
    body: String,
    body_read_failed: bool,
}

struct RequestFailure {
    status: u16,
    bytes_sent: u64,
}

/// Header octets on the wire: `key: value\r\n` per entry.
fn header_bytes(headers: &HeaderMap) -> u64 {
    headers
        .iter()
        .map(|(key, value)| key.as_str().len() + value.as_bytes().len() + 4)
        .sum::<usize>() as u64
}

/// Map a transport-level failure to its synthetic status code.
///
/// The io error closest to the socket decides: refused dials are 503 (the
/// endpoint is down, not the network), every other socket/DNS/TLS failure is
/// 511, and anything that never reached the transport stays 500.
fn classify_transport_error(err: &hyper::Error) -> u16 {
    let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = cause {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            return match io_err.kind() {
                io::ErrorKind::ConnectionRefused => STATUS_CONNECTION_REFUSED,
                io::ErrorKind::TimedOut => STATUS_TIMEOUT,
                _ => STATUS_TRANSPORT_FAILURE,
            };
        }
        cause = current.source();
    }
    if err.is_connect() {
        STATUS_TRANSPORT_FAILURE
    } else {
        STATUS_UNCLASSIFIED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderValue, CONTENT_TYPE};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    use crate::metric::MeasurementKind;

    #[test]
    fn header_bytes_counts_wire_octets() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        // "content-type" (12) + "text/plain" (10) + 4
        assert_eq!(header_bytes(&headers), 26);
    }

    /// Serve one canned HTTP/1.1 response, then close.
    async fn one_shot_server(response: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
        });
        format!("http://{addr}/ok")
    }

    #[tokio::test]
    async fn successful_get_emits_one_record() {
        let url = one_shot_server(
            "HTTP/1.1 200 OK\r\ncontent-length: 13\r\nconnection: close\r\n\r\nhello, world!",
        )
        .await;

        let (tx, mut rx) = mpsc::channel(8);
        let emitter = RecordEmitter::new(tx);
        let client = HttpClient::new(ClientSettings::default());

        let response = client.do_request(Method::GET, &url, None, &emitter).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "hello, world!");
        assert!(!response.error);
        assert!(response.tcp_handshake_latency > Duration::ZERO);
        assert_eq!(response.tls_handshake_latency, Duration::ZERO);

        let record = rx.recv().await.unwrap();
        assert_eq!(record.key, format!("GET {url}"));
        match record.kind {
            MeasurementKind::HttpRequest {
                status_code,
                bytes_received,
                bytes_sent,
                error,
                ..
            } => {
                assert_eq!(status_code, 200);
                assert!(bytes_received >= 13);
                assert!(bytes_sent > 0);
                assert!(!error);
            }
            other => panic!("expected an HTTP record, got {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "exactly one record per request");
    }

    #[tokio::test]
    async fn refused_connection_maps_to_503() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::channel(8);
        let emitter = RecordEmitter::new(tx);
        let client = HttpClient::new(ClientSettings::default());

        let response = client
            .do_request(Method::GET, &format!("http://{addr}/"), None, &emitter)
            .await;
        assert_eq!(response.status_code, STATUS_CONNECTION_REFUSED);
        assert!(response.error);
        assert!(response.body.is_empty());

        match rx.recv().await.unwrap().kind {
            MeasurementKind::HttpRequest {
                status_code, error, ..
            } => {
                assert_eq!(status_code, STATUS_CONNECTION_REFUSED);
                assert!(error);
            }
            other => panic!("expected an HTTP record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unparsable_url_maps_to_500() {
        let (tx, mut rx) = mpsc::channel(8);
        let emitter = RecordEmitter::new(tx);
        let client = HttpClient::new(ClientSettings::default());

        let response = client
            .do_request(Method::GET, "not a url", None, &emitter)
            .await;
        assert_eq!(response.status_code, STATUS_UNCLASSIFIED);
        assert!(response.error);
        assert!(rx.recv().await.is_some(), "failed attempts still emit");
    }

    #[tokio::test]
    async fn timeout_maps_to_408() {
        // Accept the connection, then never answer.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(stream);
        });

        let (tx, mut rx) = mpsc::channel(8);
        let emitter = RecordEmitter::new(tx);
        let client = HttpClient::new(
            ClientSettings::builder()
                .request_timeout(Duration::from_millis(200))
                .build(),
        );

        let response = client
            .do_request(Method::GET, &format!("http://{addr}/"), None, &emitter)
            .await;
        assert_eq!(response.status_code, STATUS_TIMEOUT);

        match rx.recv().await.unwrap().kind {
            MeasurementKind::HttpRequest {
                status_code, error, ..
            } => {
                assert_eq!(status_code, STATUS_TIMEOUT);
                assert!(error);
            }
            other => panic!("expected an HTTP record, got {other:?}"),
        }
    }
}
