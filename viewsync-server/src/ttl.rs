//! The connection-gated TTL clock and eviction timing.

use std::time::{Duration, Instant};

use viewsync_cvr::{TtlClock, MAX_TTL_MS};

/// How often the TTL clock is flushed to the CVR store while clients are
/// connected.
pub const TTL_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Minimum delay before an eviction wakeup, and the slack added to the
/// computed expiration delta so that a wakeup never fires fractionally early.
pub const TTL_TIMER_HYSTERESIS: Duration = Duration::from_millis(100);

/// The TTL clock: logical time that advances only while at least one client
/// of the group is connected.
///
/// The clock folds elapsed wall time into its stored value on every read;
/// `stop` folds and then detaches the wall-clock base so disconnected gaps
/// do not accrue.
#[derive(Debug)]
pub struct TtlState {
    clock: TtlClock,
    base: Option<Instant>,
}

impl TtlState {
    /// Resume from the persisted clock value, not yet running.
    pub fn resume(clock: TtlClock) -> Self {
        TtlState { clock, base: None }
    }

    /// Start advancing (first client connected). A no-op if already running.
    pub fn start(&mut self) {
        if self.base.is_none() {
            self.base = Some(Instant::now());
        }
    }

    /// Stop advancing (last client disconnected), returning the final
    /// reading to be flushed.
    pub fn stop(&mut self) -> TtlClock {
        let now = self.read();
        self.base = None;
        now
    }

    /// The current reading, folding in wall time elapsed since the last
    /// read while running.
    pub fn read(&mut self) -> TtlClock {
        if let Some(base) = self.base {
            let elapsed = base.elapsed().as_millis() as u64;
            if elapsed > 0 {
                self.clock = self.clock.plus(elapsed);
                self.base = Some(Instant::now());
            }
        }
        self.clock
    }

    /// True while at least one client is connected.
    pub fn running(&self) -> bool {
        self.base.is_some()
    }
}

/// The single-shot timer delay for the next eviction check:
/// `max(hysteresis, min(delta + hysteresis, MAX_TTL_MS))`.
pub fn eviction_delay(now: TtlClock, earliest: TtlClock) -> Duration {
    let delta = Duration::from_millis(earliest.as_millis().saturating_sub(now.as_millis()));
    (delta + TTL_TIMER_HYSTERESIS)
        .min(Duration::from_millis(MAX_TTL_MS))
        .max(TTL_TIMER_HYSTERESIS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_does_not_advance_while_stopped() {
        let mut state = TtlState::resume(TtlClock::from_millis(500));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(state.read(), TtlClock::from_millis(500));
    }

    #[test]
    fn clock_advances_while_running() {
        let mut state = TtlState::resume(TtlClock::ZERO);
        state.start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(state.read() >= TtlClock::from_millis(5));
        let at_stop = state.stop();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(state.read(), at_stop);
    }

    #[test]
    fn eviction_delay_is_clamped() {
        // Already expired: fire after the hysteresis floor.
        assert_eq!(
            eviction_delay(TtlClock::from_millis(10_000), TtlClock::ZERO),
            TTL_TIMER_HYSTERESIS
        );
        // Near future: delta plus hysteresis.
        assert_eq!(
            eviction_delay(TtlClock::ZERO, TtlClock::from_millis(1_000)),
            Duration::from_millis(1_000) + TTL_TIMER_HYSTERESIS
        );
        // Far future: capped at the max TTL.
        assert_eq!(
            eviction_delay(TtlClock::ZERO, TtlClock::from_millis(u64::MAX / 2)),
            Duration::from_millis(MAX_TTL_MS)
        );
    }
}
