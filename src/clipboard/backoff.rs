use std::time::Duration;

/// Escalating wait schedule for a selection conversion handshake.
///
/// Most owners answer within a fraction of a millisecond, so the first
/// polls are very short; slower owners are polled every few milliseconds
/// until the attempt budget runs out (about 300ms in total).
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
}

const FAST_ATTEMPTS: u32 = 10;
const MEDIUM_ATTEMPTS: u32 = 30;
const MAX_ATTEMPTS: u32 = 100;

const FAST_DELAY: Duration = Duration::from_micros(200);
const MEDIUM_DELAY: Duration = Duration::from_millis(1);
const SLOW_DELAY: Duration = Duration::from_millis(4);

impl Backoff {
    pub fn new() -> Self {
        Self::with_attempts(MAX_ATTEMPTS)
    }

    pub fn with_attempts(max_attempts: u32) -> Self {
        Backoff {
            attempt: 0,
            max_attempts,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    fn delay_for(attempt: u32) -> Duration {
        if attempt < FAST_ATTEMPTS {
            FAST_DELAY
        } else if attempt < MEDIUM_ATTEMPTS {
            MEDIUM_DELAY
        } else {
            SLOW_DELAY
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = Self::delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_is_bounded() {
        let delays: Vec<Duration> = Backoff::new().collect();
        assert_eq!(delays.len(), 100);

        let total: Duration = delays.iter().sum();
        assert_eq!(total, Duration::from_millis(302));
    }

    #[test]
    fn test_schedule_escalates() {
        let delays: Vec<Duration> = Backoff::new().collect();
        assert_eq!(delays[0], Duration::from_micros(200));
        assert_eq!(delays[10], Duration::from_millis(1));
        assert_eq!(delays[99], Duration::from_millis(4));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_attempt_counter() {
        let mut backoff = Backoff::with_attempts(3);
        assert_eq!(backoff.by_ref().count(), 3);
        assert_eq!(backoff.attempts(), 3);
        assert_eq!(backoff.next(), None);
    }
}
