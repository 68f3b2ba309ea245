use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::gate::ConcurrencyGate;
use super::stats::Stats;

/// Throttle events per window that trigger a step down.
pub const THROTTLE_THRESHOLD: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Decreased,
    Increased,
    Unchanged,
}

/// Periodic feedback loop moving the gate's capacity one step per tick.
pub struct AdaptiveController {
    gate: Arc<ConcurrencyGate>,
    stats: Arc<Stats>,
    period: Duration,
}

impl AdaptiveController {
    pub fn new(gate: Arc<ConcurrencyGate>, stats: Arc<Stats>, period: Duration) -> Self {
        Self {
            gate,
            stats,
            period,
        }
    }

    pub fn tick(&self) -> Adjustment {
        let throttles = self.stats.drain_throttles();
        let adjustment = if throttles >= THROTTLE_THRESHOLD {
            if self.gate.decrease() {
                Adjustment::Decreased
            } else {
                Adjustment::Unchanged
            }
        } else if throttles == 0 && self.stats.has_pending_work() && self.gate.increase() {
            Adjustment::Increased
        } else {
            Adjustment::Unchanged
        };

        let workers = self.gate.target();
        self.stats.set_workers(workers);
        match adjustment {
            Adjustment::Decreased => self.stats.log(format!(
                "[ADAPT] {throttles} throttle events -> scale down to {workers} workers"
            )),
            Adjustment::Increased => self.stats.log(format!(
                "[ADAPT] no throttling -> scale up to {workers} workers"
            )),
            Adjustment::Unchanged => {
                tracing::debug!(throttles, workers, "controller tick without change");
            }
        }
        adjustment
    }

    /// Ticks every period until `stop` fires. The first tick happens one
    /// period after start.
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + self.period, self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = interval.tick() => {
                        self.tick();
                    }
                }
            }
        })
    }
}
