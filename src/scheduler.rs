//! Autonomous scheduler.
//!
//! One long-lived task driving the periodic re-evaluation of every patient
//! from stored history (the path that catches a slow, unattended trend),
//! followed by the retention sweep. Two states, Idle and Running-Cycle, with
//! an explicit skip-on-overlap guard: a cycle that outlives the period makes
//! the next tick a no-op instead of a concurrent cycle. Shutdown lets the
//! in-flight patient finish, then stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::agent::Agent;

/// Autonomous re-evaluation driver.
pub struct Scheduler {
    agent: Arc<Agent>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(agent: Arc<Agent>, period_secs: u64, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            agent,
            period: Duration::from_secs(period_secs.max(1)),
            shutdown,
        }
    }

    /// Run until shutdown. The first cycle starts immediately.
    pub async fn run(mut self) {
        log::info!(
            "scheduler: started, period {}s",
            self.period.as_secs()
        );

        let mut ticker = tokio::time::interval(self.period);
        // A tick that lands while a cycle is still running is dropped, not
        // queued. The overlap guard in run_cycle is the backstop.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let ticked = tokio::select! {
                _ = ticker.tick() => true,
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone: nothing will ever ask us to stop, so stop now
                        break;
                    }
                    false
                }
            };

            if *self.shutdown.borrow() {
                break;
            }
            if ticked {
                self.drive_cycle().await;
            }
        }

        log::info!("scheduler: stopped");
    }

    async fn drive_cycle(&self) {
        match self.agent.run_cycle(&self.shutdown).await {
            Ok(report) if report.skipped => {}
            Ok(report) => {
                log::info!(
                    "cycle complete: {} evaluated, {} failed, {} retention violation(s)",
                    report.patients_evaluated,
                    report.patient_failures,
                    report.retention_violations,
                );
            }
            Err(e) => {
                // The whole cycle retries next period; nothing from the
                // aborted one is trusted as recorded.
                log::error!("cycle aborted: {e}");
            }
        }
    }
}
