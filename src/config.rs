use std::time::Duration;

use crate::error::{Error, Result};

/// Load parameters declared by the test script.
///
/// A run is populated by the config probe: the script's top level executes
/// once in a throwaway runtime, and its `Accelira/config` setter calls land
/// here. The probe result is then validated and drives the executor.
///
/// `iterations == 0` means "ignore iterations, run for `duration`";
/// `duration == ZERO` means the opposite. When both are set, iterations win.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Number of virtual users to spawn.
    pub concurrent_users: usize,
    /// Iterations of the exported workload function per virtual user.
    pub iterations: u64,
    /// Virtual users started per second during ramp-up; 0 starts all at once.
    pub ramp_up_rate: u64,
    /// Wall-clock bound per virtual user, used when `iterations` is 0.
    pub duration: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrent_users: 1,
            iterations: 0,
            ramp_up_rate: 0,
            duration: Duration::ZERO,
        }
    }
}

impl RunConfig {
    /// A probe that set neither bound would spin forever; refuse it up front.
    pub fn validate(&self) -> Result<()> {
        if self.concurrent_users == 0 {
            return Err(Error::Config("concurrentUsers must be at least 1".into()));
        }
        if self.iterations == 0 && self.duration.is_zero() {
            return Err(Error::Config(
                "script must set either iterations or duration".into(),
            ));
        }
        Ok(())
    }

    /// Delay inserted between successive virtual-user starts.
    pub fn ramp_interval(&self) -> Option<Duration> {
        (self.ramp_up_rate > 0).then(|| Duration::from_millis(1000 / self.ramp_up_rate))
    }
}

/// Parse a duration string as scripts write them: `"500ms"`, `"30s"`, `"2m"`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let parse = |digits: &str| {
        digits
            .parse::<u64>()
            .map_err(|_| Error::Duration(s.to_string()))
    };
    if let Some(ms) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(ms)?))
    } else if let Some(secs) = s.strip_suffix('s') {
        Ok(Duration::from_secs(parse(secs)?))
    } else if let Some(mins) = s.strip_suffix('m') {
        Ok(Duration::from_secs(parse(mins)? * 60))
    } else {
        Err(Error::Duration(s.to_string()))
    }
}
