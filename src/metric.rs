use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};

/// A `Measurement` is a single observation produced while driving the script:
/// one HTTP request attempt, one timed group invocation, or one check result.
///
/// Measurements are immutable after emission and cross the record queue by
/// value; the aggregation key is derived once at construction so the
/// collector never re-parses it.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub key: String,
    pub kind: MeasurementKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementKind {
    HttpRequest {
        url: String,
        method: String,
        status_code: u16,
        duration: Duration,
        tcp_handshake_latency: Duration,
        dns_lookup_latency: Duration,
        tls_handshake_latency: Duration,
        bytes_received: u64,
        bytes_sent: u64,
        /// Transport failure or explicit assertion mismatch. Raw non-2xx
        /// responses do not set this.
        error: bool,
    },
    Group {
        name: String,
        duration: Duration,
    },
    Check {
        name: String,
        passed: bool,
    },
}

impl Measurement {
    #[allow(clippy::too_many_arguments)]
    pub fn http(
        method: impl Into<String>,
        url: impl Into<String>,
        status_code: u16,
        duration: Duration,
        tcp_handshake_latency: Duration,
        dns_lookup_latency: Duration,
        tls_handshake_latency: Duration,
        bytes_received: u64,
        bytes_sent: u64,
        error: bool,
    ) -> Self {
        let method = method.into();
        let url = url.into();
        Self {
            key: format!("{method} {url}"),
            kind: MeasurementKind::HttpRequest {
                url,
                method,
                status_code,
                duration,
                tcp_handshake_latency,
                dns_lookup_latency,
                tls_handshake_latency,
                bytes_received,
                bytes_sent,
                error,
            },
        }
    }

    pub fn group(name: impl Into<String>, duration: Duration) -> Self {
        let name = name.into();
        Self {
            key: format!("group: {name}"),
            kind: MeasurementKind::Group { name, duration },
        }
    }

    pub fn check(name: impl Into<String>, passed: bool) -> Self {
        let name = name.into();
        Self {
            key: name.clone(),
            kind: MeasurementKind::Check { name, passed },
        }
    }
}

/// Producer-side handle on the record queue.
///
/// Emission is non-blocking: a full queue drops the record so a saturated
/// collector can never stall a virtual user. The drop diagnostic is logged at
/// most once per emitter. A `None` sender is the config-probe wiring, where
/// script activity must not produce records at all.
#[derive(Clone)]
pub struct RecordEmitter {
    tx: Option<mpsc::Sender<Measurement>>,
    warned: Arc<AtomicBool>,
}

impl RecordEmitter {
    pub fn new(tx: mpsc::Sender<Measurement>) -> Self {
        Self {
            tx: Some(tx),
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Emitter that discards everything (config probe).
    pub fn disabled() -> Self {
        Self {
            tx: None,
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Same queue, fresh warn-once state. Each pooled runtime gets its own so
    /// the drop diagnostic fires at most once per producer, not per process.
    pub fn fresh(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn emit(&self, measurement: Measurement) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(measurement) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!("Channel is full, dropping metrics");
                }
            }
            // Queue already closed: the run is shutting down.
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
