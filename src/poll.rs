//! Bounded fixed-interval polling.

use std::thread;
use std::time::Duration;

/// Attempts per wait loop.
pub const DEFAULT_ATTEMPTS: u32 = 40;
/// Pause between attempts; 40 attempts give roughly a minute.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1500);

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check<T> {
    /// Done, stop polling with this value.
    Ready(T),
    /// Not yet, try again after the interval.
    Pending,
    /// The thing we wait for is gone; stop without retrying.
    Gone,
}

/// How a poll ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready { value: T, attempts: u32 },
    Gone { attempts: u32 },
    Exhausted { attempts: u32 },
}

/// Attempt count and sleep interval of a wait loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl PollSchedule {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Poll `check` until it is ready, gone, or the attempts run out.
    ///
    /// `still_exists` runs first on every attempt; once it reports false the
    /// loop ends with [`PollOutcome::Gone`] without calling `check`.
    /// Errors from either closure end the loop immediately.
    pub fn poll_until<T, E>(
        &self,
        mut still_exists: impl FnMut() -> Result<bool, E>,
        mut check: impl FnMut() -> Result<Check<T>, E>,
    ) -> Result<PollOutcome<T>, E> {
        for attempt in 1..=self.attempts {
            if !still_exists()? {
                return Ok(PollOutcome::Gone { attempts: attempt });
            }
            match check()? {
                Check::Ready(value) => {
                    return Ok(PollOutcome::Ready {
                        value,
                        attempts: attempt,
                    })
                }
                Check::Gone => return Ok(PollOutcome::Gone { attempts: attempt }),
                Check::Pending => {}
            }
            if attempt < self.attempts && !self.interval.is_zero() {
                thread::sleep(self.interval);
            }
        }
        Ok(PollOutcome::Exhausted {
            attempts: self.attempts,
        })
    }
}
