//! Owned timers
//!
//! A timer is plain state inside the channel or provider that owns it. The
//! reactor asks the owner for its next deadline and calls back into the
//! owner when that deadline passes; the owner then checks which of its
//! timers fired with [`Timer::fire`].

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Idle,
    Armed(Instant),
    /// The owner is being torn down; arming is a no-op from here on
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct Timer {
    state: TimerState,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            state: TimerState::Idle,
        }
    }

    /// Arm (or rearm) the timer to fire `after` from `now`
    pub fn arm(&mut self, now: Instant, after: Duration) {
        if self.state == TimerState::Destroyed {
            return;
        }
        self.state = TimerState::Armed(now + after);
    }

    /// Idempotent
    pub fn disarm(&mut self) {
        if let TimerState::Armed(_) = self.state {
            self.state = TimerState::Idle;
        }
    }

    pub fn destroy(&mut self) {
        self.state = TimerState::Destroyed;
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, TimerState::Armed(_))
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == TimerState::Destroyed
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            TimerState::Armed(at) => Some(at),
            TimerState::Idle | TimerState::Destroyed => None,
        }
    }

    /// If the deadline has passed, disarm and return true
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.state {
            TimerState::Armed(at) if at <= now => {
                self.state = TimerState::Idle;
                true
            }
            _ => false,
        }
    }
}

/// Earliest of a set of optional deadlines
pub fn earliest<I>(deadlines: I) -> Option<Instant>
where
    I: IntoIterator<Item = Option<Instant>>,
{
    deadlines.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_only_after_deadline() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.arm(now, Duration::from_millis(100));

        assert!(timer.is_armed());
        assert!(!timer.fire(now + Duration::from_millis(99)));
        assert!(timer.fire(now + Duration::from_millis(100)));
        assert!(!timer.is_armed());
        assert!(!timer.fire(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.arm(now, Duration::from_secs(5));
        timer.arm(now, Duration::from_secs(1));
        assert_eq!(timer.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_destroyed_timer_stays_disarmed() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.arm(now, Duration::from_secs(1));
        timer.destroy();
        timer.arm(now, Duration::from_secs(1));

        assert!(timer.is_destroyed());
        assert!(!timer.is_armed());
        assert_eq!(timer.deadline(), None);
    }

    #[test]
    fn test_earliest() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert_eq!(earliest([None, Some(later), Some(now)]), Some(now));
        assert_eq!(earliest([None, None]), None);
    }
}
