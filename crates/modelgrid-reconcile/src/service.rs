//! ReconcileService — keeps the sweep scheduled while this node leads.
//!
//! Follows membership events and settings changes. The recurring sweep is
//! scheduled when the node holds leadership with a non-zero interval,
//! rescheduled when the interval changes, and cancelled when leadership is
//! lost, the interval drops to zero, or the service shuts down.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use modelgrid_core::SettingsHandle;

use crate::scheduler::{Job, ScheduleHandle, schedule_recurring};
use crate::sweep::{ReconciliationLoop, SweepOutcome};

pub struct ReconcileService {
    sweep: Arc<ReconciliationLoop>,
    settings: SettingsHandle,
    schedule: Mutex<Option<ScheduleHandle>>,
}

impl ReconcileService {
    pub fn new(sweep: Arc<ReconciliationLoop>, settings: SettingsHandle) -> Self {
        Self {
            sweep,
            settings,
            schedule: Mutex::new(None),
        }
    }

    pub fn sweep(&self) -> &Arc<ReconciliationLoop> {
        &self.sweep
    }

    /// Whether the recurring sweep is currently scheduled on this node.
    pub fn is_scheduled(&self) -> bool {
        self.lock_schedule().is_some()
    }

    /// Start following leadership and settings until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.sweep.membership().subscribe();
        let mut config = self.settings.subscribe();
        self.refresh();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        debug!(?event, "membership changed");
                        self.refresh();
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "membership events lagged");
                        self.refresh();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = config.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.refresh();
                }
                _ = shutdown.changed() => break,
            }
        }

        self.stop();
        debug!("reconcile service stopped");
    }

    /// Bring the schedule in line with leadership and the configured interval.
    pub fn refresh(&self) {
        let interval = self.settings.current().reconcile.interval;
        let wanted = self.sweep.membership().is_leader() && !interval.is_zero();

        let mut schedule = self.lock_schedule();
        let running = schedule.as_ref().map(ScheduleHandle::interval);
        match (running, wanted) {
            (Some(current), true) if current == interval => {}
            (_, true) => {
                if let Some(old) = schedule.take() {
                    old.cancel();
                }
                *schedule = Some(schedule_recurring(interval, self.job()));
                info!(?interval, "reconciliation scheduled");
            }
            (Some(_), false) => {
                if let Some(old) = schedule.take() {
                    old.cancel();
                }
                info!("reconciliation stopped");
            }
            (None, false) => {}
        }
    }

    fn stop(&self) {
        if let Some(old) = self.lock_schedule().take() {
            old.cancel();
        }
    }

    fn job(&self) -> Job {
        let sweep = self.sweep.clone();
        Arc::new(move || {
            let sweep = sweep.clone();
            Box::pin(async move {
                if !sweep.membership().is_leader() {
                    return;
                }
                match sweep.run_once().await {
                    Ok(SweepOutcome::Completed(_)) => {}
                    Ok(SweepOutcome::Skipped) => debug!("previous sweep still running"),
                    Err(e) => warn!(error = %e, "sweep failed"),
                }
            })
        })
    }

    fn lock_schedule(&self) -> std::sync::MutexGuard<'_, Option<ScheduleHandle>> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
