//! Sliding-window rate limiter shared by all enrichment workers.
//!
//! Admission bookkeeping lives behind a single async mutex: a caller
//! prunes expired entries, admits itself if room remains, or computes
//! how long until the oldest entry expires and sleeps with the lock
//! released. Contending workers therefore serialize only the
//! bookkeeping, never the wait.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Point-in-time view of the window, for logs and tests.
#[derive(Clone, Copy, Debug)]
pub struct LimiterSnapshot {
    pub used: u32,
    pub max_units: u32,
    pub entries: usize,
}

struct Window {
    /// Admission times and unit counts, oldest first.
    entries: VecDeque<(Instant, u32)>,
    used: u32,
    /// Oversized requests waiting for the window to drain. While any
    /// are queued, new admissions are held back so the drain happens.
    waiting_oversized: u32,
}

/// Shared sliding-window limiter over abstract "units" (one unit per
/// embedding request).
pub struct SlidingWindowRateLimiter {
    max_units: u32,
    window: Duration,
    state: Mutex<Window>,
}

impl SlidingWindowRateLimiter {
    pub fn new(max_units: u32, window: Duration) -> Self {
        Self {
            max_units: max_units.max(1),
            window,
            state: Mutex::new(Window {
                entries: VecDeque::new(),
                used: 0,
                waiting_oversized: 0,
            }),
        }
    }

    /// Block until `count` units fit inside the window, then record the
    /// admission.
    ///
    /// A request larger than `max_units` is admitted once the window is
    /// fully drained rather than deadlocking; it simply over-fills the
    /// window for one period. While such a request waits it reserves
    /// the window: smaller acquisitions queue behind it instead of
    /// starving it with a steady trickle.
    pub async fn acquire(&self, count: u32) {
        let count = count.max(1);
        let oversized = count > self.max_units;
        let mut registered = false;
        loop {
            let wait = {
                let mut window = self.state.lock().await;
                self.prune(&mut window);
                let admitted = if oversized {
                    window.used == 0
                } else {
                    window.waiting_oversized == 0
                        && window.used + count <= self.max_units
                };
                if admitted {
                    if registered {
                        window.waiting_oversized -= 1;
                    }
                    window.used += count;
                    window.entries.push_back((Instant::now(), count));
                    return;
                }
                if oversized && !registered {
                    window.waiting_oversized += 1;
                    registered = true;
                }
                window
                    .entries
                    .front()
                    .map_or(Duration::from_millis(10), |&(oldest, _)| {
                        (oldest + self.window).saturating_duration_since(Instant::now())
                    })
            };
            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
        }
    }

    /// Units currently admitted within the window.
    pub async fn snapshot(&self) -> LimiterSnapshot {
        let mut window = self.state.lock().await;
        self.prune(&mut window);
        LimiterSnapshot {
            used: window.used,
            max_units: self.max_units,
            entries: window.entries.len(),
        }
    }

    fn prune(&self, window: &mut Window) {
        let Some(cutoff) = Instant::now().checked_sub(self.window) else {
            return;
        };
        while let Some(&(at, count)) = window.entries.front() {
            if at > cutoff {
                break;
            }
            window.entries.pop_front();
            window.used -= count;
        }
    }
}
