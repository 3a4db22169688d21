use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Terminal progress indicator, updated at ~10 Hz.
///
/// Duration-bounded runs get a percentage bar against the wall-clock target;
/// iteration-bounded runs get a spinner (total work is not knowable up front
/// without assuming every iteration costs the same). Both show elapsed time
/// and the running count of received records.
pub fn spawn(
    duration: Option<Duration>,
    received: Arc<AtomicU64>,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (done_tx, mut done_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let bar = match duration {
            Some(total) => {
                let bar = ProgressBar::new(total.as_millis().max(1) as u64);
                bar.set_style(
                    ProgressStyle::with_template("[{bar:50.green}] {percent}% {msg}")
                        .expect("progress template")
                        .progress_chars("▓▓░"),
                );
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::with_template("{spinner} {msg}").expect("progress template"),
                );
                bar
            }
        };

        let started = Instant::now();
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let elapsed = started.elapsed();
                    match duration {
                        Some(total) => {
                            bar.set_position(elapsed.as_millis().min(total.as_millis()) as u64);
                            bar.set_message(format!(
                                "Elapsed: {:.2} sec / {:.2} sec, Responses received: {}",
                                elapsed.as_secs_f64(),
                                total.as_secs_f64(),
                                received.load(Ordering::Relaxed),
                            ));
                        }
                        None => {
                            bar.set_message(format!(
                                "Elapsed: {:.2} sec, Responses received: {}",
                                elapsed.as_secs_f64(),
                                received.load(Ordering::Relaxed),
                            ));
                            bar.tick();
                        }
                    }
                }
                changed = done_rx.changed() => {
                    if changed.is_err() || *done_rx.borrow() {
                        break;
                    }
                }
            }
        }

        bar.finish_with_message(format!(
            "Elapsed: {:.2} sec, Responses received: {}",
            started.elapsed().as_secs_f64(),
            received.load(Ordering::Relaxed),
        ));
    });

    (handle, done_tx)
}
