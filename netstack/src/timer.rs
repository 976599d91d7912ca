// Deadline-based software timers driven from the stack tick

/// A retriggerable one-shot or periodic timer.
///
/// Timers hold only a deadline; whoever owns one calls [`SoftTimer::poll`]
/// with the current time and acts when it reports expiry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftTimer {
    deadline: Option<u64>,
    period: Option<u64>,
}

impl SoftTimer {
    pub const fn new() -> Self {
        Self { deadline: None, period: None }
    }

    pub fn periodic(period_ms: u64, now: u64) -> Self {
        Self {
            deadline: Some(now.saturating_add(period_ms)),
            period: Some(period_ms),
        }
    }

    /// Arms (or re-arms) as a one-shot `delay_ms` from `now`.
    pub fn arm(&mut self, now: u64, delay_ms: u64) {
        self.deadline = Some(now.saturating_add(delay_ms));
        self.period = None;
    }

    /// Pushes the deadline out by a full period from `now`.
    pub fn restart(&mut self, now: u64) {
        if let Some(period) = self.period {
            self.deadline = Some(now.saturating_add(period));
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
        self.period = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    pub fn remaining(&self, now: u64) -> Option<u64> {
        self.deadline.map(|deadline| deadline.saturating_sub(now))
    }

    /// Returns true once per expiry. Periodic timers re-arm from `now`.
    pub fn poll(&mut self, now: u64) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = self.period.map(|period| now.saturating_add(period));
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oneshot_fires_once() {
        let mut timer = SoftTimer::new();
        assert!(!timer.poll(100));
        timer.arm(100, 50);
        assert!(!timer.poll(149));
        assert!(timer.poll(150));
        assert!(!timer.poll(500));
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_retrigger_moves_deadline() {
        let mut timer = SoftTimer::new();
        timer.arm(0, 100);
        timer.arm(80, 100);
        assert!(!timer.poll(120));
        assert!(timer.poll(180));
    }

    #[test]
    fn test_periodic_rearms() {
        let mut timer = SoftTimer::periodic(5000, 0);
        assert!(timer.poll(5000));
        assert_eq!(timer.deadline(), Some(10000));
        assert!(!timer.poll(9000));
        assert!(timer.poll(10001));
        timer.cancel();
        assert!(!timer.poll(50000));
    }
}
