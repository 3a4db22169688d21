//! Accelira — a scriptable HTTP load-generation and performance-measurement
//! engine.
//!
//! A test script written in JavaScript declares its load parameters
//! (concurrency, iteration count or duration, ramp-up rate) and exports a
//! default workload function that issues HTTP requests, groups related
//! operations, and asserts response properties. The engine runs that function
//! under N concurrent virtual users, measures every request, group, and
//! check, aggregates the measurements through streaming quantile sketches,
//! and prints a terminal report.
//!
//! # Architecture
//!
//! Three subsystems carry the engine:
//!
//! - [`executor`]: probes the script for its configuration, ramps up the
//!   virtual users, drives each one to its iteration count or wall-clock
//!   deadline, and tears the run down deterministically.
//! - [`client`]: the instrumented HTTP client — one shared connection pool,
//!   per-phase timings (DNS, TCP, TLS) from a hand-rolled connector, and
//!   transport failures classified into synthetic status codes.
//! - [`aggregate`]: the metrics pipeline — a single-consumer task that drains
//!   the record queue into per-key aggregates combining counters with
//!   [`sketch::LatencySketch`] quantile estimators.
//!
//! Around them: [`runtime`] wires the QuickJS-based script runtimes and their
//! pool, [`metric`] defines the measurement records flowing through the
//! queue, [`report`] renders the frozen aggregates, and [`dashboard`] serves
//! the optional live view.
//!
//! Data flow:
//!
//! ```text
//! script → executor → runtime pool → http client → record queue
//!                                                       ↓
//!                               report ← aggregate map ← collector
//! ```

/// Keyed aggregates and the single-consumer collector task
pub mod aggregate;
/// Command-line definitions
pub mod cli;
/// Instrumented HTTP client
pub mod client;
/// Run configuration and duration parsing
pub mod config;
/// Optional live dashboard
pub mod dashboard;
/// Crate error type
pub mod error;
/// Orchestration of a load-test run
pub mod executor;
/// Measurement records and the queue producer handle
pub mod metric;
/// Terminal report renderer
pub mod report;
/// Script runtimes, built-in modules, and the runtime pool
pub mod runtime;
/// Streaming quantile sketch
pub mod sketch;

pub use aggregate::{AggregateMap, Collector, EndpointAggregate};
pub use client::{HttpClient, HttpResponse};
pub use config::RunConfig;
pub use error::{Error, Result};
pub use executor::{Executor, RunOutcome};
pub use metric::{Measurement, MeasurementKind, RecordEmitter};
pub use runtime::{ModuleServices, RuntimePool, ScriptRuntime};
pub use sketch::LatencySketch;
