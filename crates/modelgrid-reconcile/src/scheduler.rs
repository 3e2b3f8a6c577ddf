//! Recurring background jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use modelgrid_cluster::BoxFuture;

/// A job the scheduler can start any number of times.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle to a recurring job. Dropping it leaves the job running.
pub struct ScheduleHandle {
    interval: Duration,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ScheduleHandle {
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop firing. A run already in progress finishes on its own.
    pub fn cancel(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
        debug!(interval = ?self.interval, "recurring job cancelled");
    }
}

/// Run `job` every `interval`, first after one full interval.
///
/// Each firing is spawned, so a slow run never delays the next tick.
pub fn schedule_recurring(interval: Duration, job: Job) -> ScheduleHandle {
    let (shutdown, mut stop) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::spawn(job());
                }
                _ = stop.changed() => break,
            }
        }
    });
    ScheduleHandle {
        interval,
        shutdown,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(counter: Arc<AtomicUsize>) -> Job {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_every_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = schedule_recurring(Duration::from_secs(10), counting_job(counter.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_firing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = schedule_recurring(Duration::from_secs(1), counting_job(counter.clone()));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(handle.interval(), Duration::from_secs(1));

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
