//! Randomized election timer.
//!
//! A single task owns the deadline. Every `reset` or `cancel` bumps a
//! generation counter; the timer passes the generation it was armed with to
//! the fire callback, and callers check [`ElectionTimer::is_current`] under
//! their own lock so a fire racing with a reset is ignored.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

enum TimerCommand {
    Arm { generation: u64, after: Duration },
    Disarm,
    Stop,
}

/// Handle to the election timer task.
pub struct ElectionTimer {
    base: Duration,
    generation: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<TimerCommand>,
    task: JoinHandle<()>,
}

impl ElectionTimer {
    /// Spawn the timer. `on_fire` receives the generation that expired.
    pub fn spawn<F>(base: Duration, on_fire: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run(rx, on_fire));
        Self {
            base,
            generation,
            tx,
            task,
        }
    }

    /// Draw a timeout uniformly from `[base, 2 * base)`.
    pub fn random_timeout(base: Duration) -> Duration {
        let base_ms = base.as_millis().max(1) as u64;
        let ms = rand::thread_rng().gen_range(base_ms..base_ms * 2);
        Duration::from_millis(ms)
    }

    /// Re-arm with a fresh randomized timeout, superseding any pending fire.
    pub fn reset(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let after = Self::random_timeout(self.base);
        let _ = self.tx.send(TimerCommand::Arm { generation, after });
    }

    /// Stop the timer until the next `reset`.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(TimerCommand::Disarm);
    }

    /// Whether a fire carrying `generation` is still the live one.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Terminate the timer task.
    pub fn stop(&self) {
        let _ = self.tx.send(TimerCommand::Stop);
    }
}

impl Drop for ElectionTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<F>(mut rx: mpsc::UnboundedReceiver<TimerCommand>, on_fire: F)
where
    F: Fn(u64) + Send + Sync + 'static,
{
    let mut armed: Option<(Instant, u64)> = None;

    loop {
        let command = match armed {
            Some((deadline, generation)) => {
                tokio::select! {
                    command = rx.recv() => command,
                    _ = sleep_until(deadline) => {
                        armed = None;
                        trace!(generation, "Election timer fired");
                        on_fire(generation);
                        continue;
                    }
                }
            }
            None => rx.recv().await,
        };

        match command {
            Some(TimerCommand::Arm { generation, after }) => {
                armed = Some((Instant::now() + after, generation));
            }
            Some(TimerCommand::Disarm) => armed = None,
            Some(TimerCommand::Stop) | None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_random_timeout_range() {
        let base = Duration::from_millis(150);
        for _ in 0..200 {
            let timeout = ElectionTimer::random_timeout(base);
            assert!(timeout >= base && timeout < base * 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_with_current_generation() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let timer = ElectionTimer::spawn(Duration::from_millis(100), move |generation| {
            sink.lock().unwrap().push(generation);
        });

        timer.reset();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let fires = fired.lock().unwrap().clone();
        assert_eq!(fires.len(), 1);
        assert!(timer.is_current(fires[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_supersedes_pending_fire() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let timer = ElectionTimer::spawn(Duration::from_millis(100), move |generation| {
            sink.lock().unwrap().push(generation);
        });

        timer.reset();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            timer.reset();
        }
        assert!(fired.lock().unwrap().is_empty());

        timer.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(fired.lock().unwrap().is_empty());
        timer.stop();
    }
}
