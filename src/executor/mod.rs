//! Executor — orchestration of a load-test run.
//!
//! The executor owns the full lifecycle: it probes the script for its load
//! parameters, wires the record queue, the single-consumer collector, the
//! runtime pool and the shared HTTP client, ramps up the virtual users, and
//! tears everything down in an order that guarantees the aggregate map is
//! frozen before the report reads it.
//!
//! # High-level flow
//! 1. **Config probe.** The bundled script's top level runs once in a
//!    throwaway runtime whose emitter is disabled; `config.set*` calls land
//!    in the shared [`RunConfig`].
//! 2. **Wiring.** Record queue sized `concurrent_users × 5`, collector task,
//!    progress task, optional dashboard, HTTP client with a keep-alive pool
//!    sized to the concurrency target, runtime pool of `concurrent_users`
//!    pre-initialized isolates.
//! 3. **Ramp-up.** Virtual users spawn sequentially with
//!    `1000 / ramp_up_rate` ms between starts (no pacing when the rate is 0).
//! 4. **Drive.** Each virtual user checks out a runtime, runs the script top
//!    level once, then iterates the exported body until its iteration count
//!    or wall-clock deadline is reached, checking the shutdown flag at the
//!    top of every loop.
//! 5. **Shutdown.** Workers are joined, every queue sender is dropped, the
//!    collector drains and returns the frozen map.
//!
//! An interrupt only flips the shared shutdown flag: virtual users stop at
//! their next loop check, in-flight requests complete, and the run exits
//! through the same drain-and-report path as a normal completion — which is
//! what makes "exactly one report per run" structural.

mod progress;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task;

use crate::aggregate::{AggregateMap, Collector};
use crate::client::HttpClient;
use crate::config::RunConfig;
use crate::dashboard::{self, LiveMetrics};
use crate::error::{Error, Result};
use crate::metric::RecordEmitter;
use crate::runtime::{ModuleServices, RuntimePool, ScriptRuntime};

/// Queue capacity per configured virtual user.
const QUEUE_SCALE: usize = 5;

/// The frozen results of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    pub aggregates: AggregateMap,
    pub records_received: u64,
    pub elapsed: Duration,
}

pub struct Executor {
    code: String,
    dashboard: bool,
}

impl Executor {
    pub fn new(code: String) -> Self {
        Self {
            code,
            dashboard: false,
        }
    }

    pub fn with_dashboard(mut self, enabled: bool) -> Self {
        self.dashboard = enabled;
        self
    }

    pub async fn run(self) -> Result<RunOutcome> {
        let handle = tokio::runtime::Handle::current();
        let config = probe_config(self.code.clone(), handle.clone()).await?;
        config.validate()?;

        println!(
            "Concurrent Users: {}\nIterations: {}\nRamp-up Rate: {}\nDuration: {:?}",
            config.concurrent_users, config.iterations, config.ramp_up_rate, config.duration
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        spawn_interrupt_listener(shutdown.clone());

        let (record_tx, record_rx) = mpsc::channel(config.concurrent_users * QUEUE_SCALE);
        let received = Arc::new(AtomicU64::new(0));

        let live: Option<LiveMetrics> = self.dashboard.then(dashboard::new_live_metrics);
        if let Some(live) = live.clone() {
            tokio::spawn(async move {
                if let Err(err) = dashboard::serve(live, dashboard::DEFAULT_ADDR).await {
                    tracing::error!(%err, "dashboard server failed");
                }
            });
        }

        let collector = tokio::spawn(Collector::new(record_rx, received.clone(), live).run());

        tracing::info!(users = config.concurrent_users, "initializing runtime pool");
        let services = ModuleServices::new(
            Arc::new(RwLock::new(config.clone())),
            RecordEmitter::new(record_tx),
            HttpClient::for_concurrency(config.concurrent_users),
            handle,
        );
        let pool = RuntimePool::new(config.concurrent_users, &services)?;

        let progress_duration = (config.iterations == 0).then_some(config.duration);
        let (progress_task, progress_done) = progress::spawn(progress_duration, received.clone());

        let started = Instant::now();
        tracing::info!("spawning {} virtual users", config.concurrent_users);
        let mut handles = Vec::with_capacity(config.concurrent_users);
        for index in 0..config.concurrent_users {
            let pool = pool.clone();
            let code = self.code.clone();
            let vu_config = config.clone();
            let shutdown = shutdown.clone();
            handles.push(task::spawn_blocking(move || {
                run_virtual_user(index, &pool, &code, &vu_config, &shutdown);
            }));

            if let Some(interval) = config.ramp_interval() {
                if index + 1 < config.concurrent_users {
                    tokio::time::sleep(interval).await;
                }
            }
        }

        for joined in join_all(handles).await {
            if let Err(err) = joined {
                // One lost worker should not sink the whole run's data.
                tracing::error!(%err, "virtual user task panicked");
            }
        }
        let elapsed = started.elapsed();

        // Every sender lives in the pool's runtimes or in `services`;
        // dropping both closes the queue and lets the collector drain out.
        drop(pool);
        drop(services);

        tracing::info!("waiting for the collector to drain");
        let aggregates = collector
            .await
            .map_err(|err| Error::Task(format!("collector task failed: {err}")))?;

        let _ = progress_done.send(true);
        let _ = progress_task.await;

        Ok(RunOutcome {
            aggregates,
            records_received: received.load(Ordering::Relaxed),
            elapsed,
        })
    }
}

/// Evaluate the script once with a disabled emitter and capture the populated
/// configuration. Runs on the blocking pool so script-issued HTTP requests
/// can be driven synchronously exactly as they are during the real run.
async fn probe_config(code: String, handle: tokio::runtime::Handle) -> Result<RunConfig> {
    task::spawn_blocking(move || {
        let config = Arc::new(RwLock::new(RunConfig::default()));
        let services = ModuleServices::new(
            config.clone(),
            RecordEmitter::disabled(),
            HttpClient::new(Default::default()),
            handle,
        );
        let runtime = ScriptRuntime::new(services)?;
        runtime.eval_top_level(&code)?;
        let config = config.read().expect("config lock").clone();
        Ok(config)
    })
    .await
    .map_err(|err| Error::Task(format!("config probe task failed: {err}")))?
}

fn spawn_interrupt_listener(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing in-flight work");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
}

/// Body of one virtual-user task. Synchronous: the script runtime does not
/// suspend from the host's perspective, and HTTP futures are driven through
/// the runtime handle captured in the module wiring.
fn run_virtual_user(
    index: usize,
    pool: &RuntimePool,
    code: &str,
    config: &RunConfig,
    shutdown: &AtomicBool,
) {
    let runtime = match pool.checkout() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(%err, index, "virtual user could not obtain a runtime");
            return;
        }
    };

    if let Err(err) = runtime.eval_top_level(code) {
        tracing::error!(%err, index, "script top level failed");
        pool.restore(runtime);
        return;
    }

    if config.iterations > 0 {
        for _ in 0..config.iterations {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            if let Err(err) = runtime.run_iteration() {
                tracing::warn!(%err, index, "script iteration failed");
            }
        }
    } else {
        let deadline = Instant::now() + config.duration;
        while Instant::now() < deadline && !shutdown.load(Ordering::Relaxed) {
            if let Err(err) = runtime.run_iteration() {
                tracing::warn!(%err, index, "script iteration failed");
            }
        }
    }

    pool.restore(runtime);
}
