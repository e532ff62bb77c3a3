// Cancellable refresh timers.
//
// Everything here is single threaded: nothing fires on its own, the owner asks
// "is it time yet?" from its loop. A timer holds at most one pending deadline,
// so rescheduling replaces the old one instead of stacking up another.

use chrono::{DateTime, Duration, Utc};

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

#[derive(Debug, Default)]
pub struct RefreshTimer {
    next_id: u64,
    pending: Option<(TimerHandle, DateTime<Utc>)>,
}

impl RefreshTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, now: DateTime<Utc>, delay: Duration) -> TimerHandle {
        self.next_id += 1;
        let handle = TimerHandle(self.next_id);
        let due = now.checked_add_signed(delay).unwrap_or_else(|| {
            tracing::warn!("Refresh delay {} out of range, firing right away", delay);
            now
        });
        if let Some((old, _)) = self.pending.replace((handle, due)) {
            tracing::trace!("Timer {:?} replaced by {:?}", old, handle);
        }
        handle
    }

    // Cancelling a handle that already fired or got replaced does nothing.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.pending {
            Some((pending, _)) if pending == handle => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&mut self) {
        self.pending = None;
    }

    pub fn pending_count(&self) -> usize {
        if self.pending.is_some() {
            1
        } else {
            0
        }
    }

    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        self.pending.map(|(_, due)| due)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.pending, Some((_, due)) if due <= now)
    }

    // Consumes the pending deadline if it has passed.
    pub fn fire(&mut self, now: DateTime<Utc>) -> Option<TimerHandle> {
        if self.is_due(now) {
            self.pending.take().map(|(handle, _)| handle)
        } else {
            None
        }
    }

    pub fn time_until_due(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.due_at()
            .map(|due| std::cmp::max(due - now, Duration::zero()))
    }
}


#[cfg(test)]
mod timer_tests {
    use super::fake::ManualClock;
    use super::*;

    #[test]
    pub fn rescheduling_keeps_one_pending_timer() {
        let clock = ManualClock::new();
        let mut timer = RefreshTimer::new();
        for _ in 0..5 {
            timer.schedule(clock.now(), Duration::seconds(5));
        }
        assert_eq!(timer.pending_count(), 1);
        assert_eq!(timer.due_at(), Some(clock.now() + Duration::seconds(5)));
    }

    #[test]
    pub fn fires_once_when_due() {
        let clock = ManualClock::new();
        let mut timer = RefreshTimer::new();
        let handle = timer.schedule(clock.now(), Duration::seconds(5));

        clock.advance(Duration::seconds(4));
        assert_eq!(timer.fire(clock.now()), None);
        clock.advance(Duration::seconds(1));
        assert_eq!(timer.fire(clock.now()), Some(handle));
        assert_eq!(timer.fire(clock.now()), None);
        assert_eq!(timer.pending_count(), 0);
    }

    #[test]
    pub fn stale_handles_cannot_cancel_the_new_timer() {
        let clock = ManualClock::new();
        let mut timer = RefreshTimer::new();
        let old = timer.schedule(clock.now(), Duration::seconds(5));
        let new = timer.schedule(clock.now(), Duration::seconds(3));

        assert!(!timer.cancel(old));
        assert_eq!(timer.pending_count(), 1);
        assert!(timer.cancel(new));
        assert_eq!(timer.pending_count(), 0);
    }

    #[test]
    pub fn huge_delay_does_not_overflow() {
        let clock = ManualClock::new();
        let mut timer = RefreshTimer::new();
        timer.schedule(clock.now(), Duration::days(1_000_000_000));
        assert_eq!(timer.pending_count(), 1);
        assert!(timer.is_due(clock.now()));
    }

    #[test]
    pub fn time_until_due_never_negative() {
        let clock = ManualClock::new();
        let mut timer = RefreshTimer::new();
        timer.schedule(clock.now(), Duration::seconds(2));
        clock.advance(Duration::seconds(10));
        assert_eq!(timer.time_until_due(clock.now()), Some(Duration::zero()));
    }
}
