use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::dashboard::LiveMetrics;
use crate::metric::{Measurement, MeasurementKind};
use crate::sketch::LatencySketch;

/// Which family of measurements a key accumulates. Fixed at creation; the
/// key format uniquely determines it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    HttpRequest,
    Group,
    Check,
}

/// Per-key accumulator combining counters and streaming quantile sketches.
///
/// Aggregates store raw, mergeable data only — sums, counts and sketches.
/// Derived statistics (averages, percentiles, rates) belong to the report
/// layer, which reads the frozen map after the run.
///
/// Counter rules:
/// - every HTTP record increments its status bucket, so
///   `total_requests == status_code_counts.values().sum()`;
/// - `total_errors` counts transport failures and assertion mismatches
///   (records with the error flag), not raw non-2xx responses;
/// - the TCP/DNS/TLS sketches are only fed strictly positive latencies — a
///   zero means the phase never ran (reused connection, cached DNS,
///   plaintext) and must not skew the distribution.
#[derive(Debug, Clone)]
pub struct EndpointAggregate {
    pub kind: AggregateKind,
    pub total_requests: u64,
    pub total_errors: u64,
    pub total_response_time: Duration,
    pub total_bytes_received: u64,
    pub total_bytes_sent: u64,
    pub status_code_counts: BTreeMap<u16, u64>,
    pub checks_passed: u64,
    pub checks_failed: u64,
    pub response_times: LatencySketch,
    pub tcp_handshake: LatencySketch,
    pub dns_lookup: LatencySketch,
    pub tls_handshake: LatencySketch,
}

impl EndpointAggregate {
    pub fn new(kind: AggregateKind) -> Self {
        Self {
            kind,
            total_requests: 0,
            total_errors: 0,
            total_response_time: Duration::ZERO,
            total_bytes_received: 0,
            total_bytes_sent: 0,
            status_code_counts: BTreeMap::new(),
            checks_passed: 0,
            checks_failed: 0,
            response_times: LatencySketch::new(),
            tcp_handshake: LatencySketch::new(),
            dns_lookup: LatencySketch::new(),
            tls_handshake: LatencySketch::new(),
        }
    }

    pub fn kind_of(kind: &MeasurementKind) -> AggregateKind {
        match kind {
            MeasurementKind::HttpRequest { .. } => AggregateKind::HttpRequest,
            MeasurementKind::Group { .. } => AggregateKind::Group,
            MeasurementKind::Check { .. } => AggregateKind::Check,
        }
    }

    /// Incorporate a single measurement into the aggregate.
    pub fn consume(&mut self, kind: &MeasurementKind) {
        match kind {
            MeasurementKind::HttpRequest {
                status_code,
                duration,
                tcp_handshake_latency,
                dns_lookup_latency,
                tls_handshake_latency,
                bytes_received,
                bytes_sent,
                error,
                ..
            } => {
                self.total_requests += 1;
                self.total_response_time += *duration;
                self.total_bytes_received += bytes_received;
                self.total_bytes_sent += bytes_sent;
                *self.status_code_counts.entry(*status_code).or_insert(0) += 1;
                if *error {
                    self.total_errors += 1;
                }
                self.response_times.add(*duration);
                if !tcp_handshake_latency.is_zero() {
                    self.tcp_handshake.add(*tcp_handshake_latency);
                }
                if !dns_lookup_latency.is_zero() {
                    self.dns_lookup.add(*dns_lookup_latency);
                }
                if !tls_handshake_latency.is_zero() {
                    self.tls_handshake.add(*tls_handshake_latency);
                }
            }
            MeasurementKind::Group { duration, .. } => {
                self.total_requests += 1;
                self.total_response_time += *duration;
                self.response_times.add(*duration);
            }
            MeasurementKind::Check { passed, .. } => {
                if *passed {
                    self.checks_passed += 1;
                } else {
                    self.checks_failed += 1;
                }
            }
        }
    }
}

/// The frozen result of a run, handed to the report renderer.
pub type AggregateMap = BTreeMap<String, EndpointAggregate>;

/// Single consumer of the record queue.
///
/// All aggregate mutation happens on this one task, which removes every lock
/// from the hot path and makes the returned map safe to read without
/// synchronization: by the time `run` returns, every producer has dropped its
/// sender and nothing can touch the map again.
pub struct Collector {
    rx: mpsc::Receiver<Measurement>,
    received: Arc<AtomicU64>,
    live: Option<LiveMetrics>,
    batch_hint: usize,
}

impl Collector {
    pub fn new(
        rx: mpsc::Receiver<Measurement>,
        received: Arc<AtomicU64>,
        live: Option<LiveMetrics>,
    ) -> Self {
        Self {
            rx,
            received,
            live,
            batch_hint: num_cpus::get().max(2) * 8,
        }
    }

    /// Drain the queue until every sender is gone, then return the frozen map.
    pub async fn run(mut self) -> AggregateMap {
        let mut map = AggregateMap::new();
        let mut batch = Vec::with_capacity(self.batch_hint);

        loop {
            match self.rx.recv().await {
                Some(measurement) => batch.push(measurement),
                None => break,
            }
            // Opportunistically drain whatever else is already queued before
            // touching the map again.
            while batch.len() < self.batch_hint {
                match self.rx.try_recv() {
                    Ok(measurement) => batch.push(measurement),
                    Err(_) => break,
                }
            }

            self.received
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            for measurement in batch.drain(..) {
                Self::merge(&mut map, &self.live, measurement);
            }
        }

        map
    }

    fn merge(map: &mut AggregateMap, live: &Option<LiveMetrics>, measurement: Measurement) {
        let Measurement { key, kind } = measurement;

        if let Some(live) = live {
            let latency_ms = match &kind {
                MeasurementKind::HttpRequest { duration, .. }
                | MeasurementKind::Group { duration, .. } => Some(duration.as_secs_f64() * 1000.0),
                MeasurementKind::Check { .. } => None,
            };
            if let Some(ms) = latency_ms {
                if let Ok(mut live) = live.write() {
                    live.insert(key.clone(), ms);
                }
            }
        }

        let aggregate = map
            .entry(key)
            .or_insert_with(|| EndpointAggregate::new(EndpointAggregate::kind_of(&kind)));
        debug_assert_eq!(aggregate.kind, EndpointAggregate::kind_of(&kind));
        aggregate.consume(&kind);
    }
}
