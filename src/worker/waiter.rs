use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::envexec::{Process, Waiter};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Lowest share of wall time counted as cpu time per tick
const MIN_CPU_PERCENT: u32 = 40;

/// Polls cpu usage and stops the run once the budget is spent
///
/// Each tick counts the larger of the cpu time used and a fixed share of
/// the wall time passed, so a stalled or unaccounted process still runs
/// out of budget. The wall clock limit is never below the cpu limit.
#[derive(Debug, Clone)]
pub struct CpuWaiter {
    pub tick_interval: Duration,
    pub time_limit: Duration,
    pub clock_limit: Duration,
}

#[async_trait]
impl Waiter for CpuWaiter {
    async fn wait(&self, ctx: CancellationToken, process: Arc<dyn Process>) -> bool {
        let clock_limit = self.clock_limit.max(self.time_limit);
        let tick = if self.tick_interval.is_zero() {
            DEFAULT_TICK_INTERVAL
        } else {
            self.tick_interval
        };

        let start = Instant::now();
        let mut ticker = tokio::time::interval_at(start + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let done = process.done();
        let mut total = Duration::ZERO;
        let mut last_cpu = Duration::ZERO;
        let mut last_tick = start;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return false,
                _ = done.cancelled() => return false,
                now = ticker.tick() => {
                    if !clock_limit.is_zero() && now.duration_since(start) > clock_limit {
                        return true;
                    }
                    let cpu = process.usage().time;
                    let wall = now.duration_since(last_tick);
                    total += cpu.saturating_sub(last_cpu).max(wall * MIN_CPU_PERCENT / 100);
                    last_cpu = cpu;
                    last_tick = now;
                    if !self.time_limit.is_zero() && total > self.time_limit {
                        return true;
                    }
                }
            }
        }
    }
}

/// Stops the run after a fixed wall clock time
#[derive(Debug, Clone)]
pub struct RealTimeWaiter {
    pub limit: Duration,
}

#[async_trait]
impl Waiter for RealTimeWaiter {
    async fn wait(&self, ctx: CancellationToken, process: Arc<dyn Process>) -> bool {
        let done = process.done();
        if self.limit.is_zero() {
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = done.cancelled() => {}
            }
            return false;
        }
        tokio::select! {
            _ = ctx.cancelled() => false,
            _ = done.cancelled() => false,
            _ = tokio::time::sleep(self.limit) => true,
        }
    }
}
