use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_FAILURES: usize = 10;
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_LOCKOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct FailureEntry {
    failures: VecDeque<Instant>,
    locked_until: Option<Instant>,
}

impl FailureEntry {
    fn is_stale(&self, now: Instant, window: Duration) -> bool {
        self.locked_until.is_none_or(|until| until <= now)
            && self
                .failures
                .back()
                .is_none_or(|at| now.duration_since(*at) > window)
    }
}

#[derive(Debug, Default)]
struct Entries {
    by_ip: HashMap<IpAddr, FailureEntry>,
    swept_at: Option<Instant>,
}

/// Per source IP sliding window of credential failures with a lockout.
#[derive(Debug)]
pub struct AuthFailureLimiter {
    max_failures: usize,
    window: Duration,
    lockout: Duration,
    entries: Mutex<Entries>,
}

impl Default for AuthFailureLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FAILURES, DEFAULT_FAILURE_WINDOW, DEFAULT_LOCKOUT)
    }
}

impl AuthFailureLimiter {
    pub fn new(max_failures: usize, window: Duration, lockout: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            window,
            lockout,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn is_locked(&self, ip: IpAddr) -> bool {
        self.is_locked_at(ip, Instant::now())
    }

    /// Returns whether this failure tripped (or extended) a lockout.
    pub fn record_failure(&self, ip: IpAddr) -> bool {
        self.record_failure_at(ip, Instant::now())
    }

    pub fn record_success(&self, ip: IpAddr) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.by_ip.remove(&ip);
        }
    }

    fn is_locked_at(&self, ip: IpAddr, now: Instant) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let Some(entry) = entries.by_ip.get_mut(&ip) else {
            return false;
        };
        match entry.locked_until {
            Some(until) if until > now => true,
            Some(_) => {
                entries.by_ip.remove(&ip);
                false
            }
            None => false,
        }
    }

    fn record_failure_at(&self, ip: IpAddr, now: Instant) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        // Sources that stopped failing are dropped at most once per window.
        if entries
            .swept_at
            .is_none_or(|at| now.duration_since(at) > self.window)
        {
            entries
                .by_ip
                .retain(|_, entry| !entry.is_stale(now, self.window));
            entries.swept_at = Some(now);
        }
        let entry = entries.by_ip.entry(ip).or_default();
        while entry
            .failures
            .front()
            .is_some_and(|at| now.duration_since(*at) > self.window)
        {
            entry.failures.pop_front();
        }
        entry.failures.push_back(now);
        if entry.failures.len() >= self.max_failures {
            entry.failures.clear();
            entry.locked_until = Some(now + self.lockout);
            return true;
        }
        false
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.entries.lock().map(|entries| entries.by_ip.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([203, 0, 113, last])
    }

    #[test]
    fn locks_after_threshold_within_window() {
        let limiter = AuthFailureLimiter::default();
        let start = Instant::now();
        for n in 0..9 {
            assert!(!limiter.record_failure_at(ip(1), start + Duration::from_secs(n)));
        }
        assert!(!limiter.is_locked_at(ip(1), start + Duration::from_secs(9)));
        assert!(limiter.record_failure_at(ip(1), start + Duration::from_secs(9)));
        assert!(limiter.is_locked_at(ip(1), start + Duration::from_secs(10)));
        assert!(!limiter.is_locked_at(ip(2), start + Duration::from_secs(10)));
    }

    #[test]
    fn lockout_expires() {
        let limiter = AuthFailureLimiter::new(2, Duration::from_secs(60), Duration::from_secs(300));
        let start = Instant::now();
        limiter.record_failure_at(ip(3), start);
        assert!(limiter.record_failure_at(ip(3), start));
        assert!(limiter.is_locked_at(ip(3), start + Duration::from_secs(299)));
        assert!(!limiter.is_locked_at(ip(3), start + Duration::from_secs(301)));
    }

    #[test]
    fn old_failures_leave_the_window() {
        let limiter = AuthFailureLimiter::new(3, Duration::from_secs(60), Duration::from_secs(300));
        let start = Instant::now();
        limiter.record_failure_at(ip(4), start);
        limiter.record_failure_at(ip(4), start + Duration::from_secs(1));
        assert!(!limiter.record_failure_at(ip(4), start + Duration::from_secs(120)));
        assert!(!limiter.is_locked_at(ip(4), start + Duration::from_secs(121)));
    }

    #[test]
    fn sources_that_stop_failing_are_forgotten() {
        let limiter = AuthFailureLimiter::new(2, Duration::from_secs(60), Duration::from_secs(300));
        let start = Instant::now();
        for last in 1..=50 {
            limiter.record_failure_at(ip(last), start);
        }
        limiter.record_failure_at(ip(200), start);
        assert!(limiter.record_failure_at(ip(200), start));
        assert_eq!(limiter.tracked(), 51);

        limiter.record_failure_at(ip(100), start + Duration::from_secs(61));
        assert_eq!(limiter.tracked(), 2);
        assert!(limiter.is_locked_at(ip(200), start + Duration::from_secs(62)));

        limiter.record_failure_at(ip(101), start + Duration::from_secs(400));
        assert_eq!(limiter.tracked(), 1);
    }
}
