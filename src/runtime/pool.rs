use crossbeam_channel::{bounded, Receiver, Sender};

use super::{ModuleServices, ScriptRuntime};
use crate::error::{Error, Result};

/// Fixed-size pool of pre-initialized script runtimes.
///
/// The pool is a bounded channel: checkout is a blocking `recv` on the
/// virtual user's thread, return is a `send` that can never block because
/// capacity equals the runtime population. A checked-out runtime is owned by
/// exactly one virtual user until restored, so no per-runtime locking exists.
#[derive(Clone)]
pub struct RuntimePool {
    tx: Sender<ScriptRuntime>,
    rx: Receiver<ScriptRuntime>,
}

impl RuntimePool {
    /// Build `size` runtimes, each fully wired with the built-in modules and
    /// the active record queue.
    pub fn new(size: usize, services: &ModuleServices) -> Result<Self> {
        let (tx, rx) = bounded(size);
        for _ in 0..size {
            let mut services = services.clone();
            services.emitter = services.emitter.fresh();
            let runtime = ScriptRuntime::new(services)?;
            tx.send(runtime)
                .map_err(|_| Error::Pool("pool channel closed during initialization".into()))?;
        }
        Ok(Self { tx, rx })
    }

    /// Blocks until a runtime is available.
    pub fn checkout(&self) -> Result<ScriptRuntime> {
        self.rx
            .recv()
            .map_err(|_| Error::Pool("runtime pool closed".into()))
    }

    pub fn restore(&self, runtime: ScriptRuntime) {
        // Only fails if the pool is gone, in which case the runtime is simply
        // dropped.
        let _ = self.tx.send(runtime);
    }

    /// Runtimes currently waiting in the pool.
    pub fn available(&self) -> usize {
        self.rx.len()
    }
}
