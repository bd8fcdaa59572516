use std::time::Duration;

use chrono::{DateTime, Utc};

/// Delay before the next attempt once a job has failed `attempts` times: `attempts^4 + 5` seconds
pub fn backoff_delay(attempts: u32) -> Duration {
    let attempts = u64::from(attempts);
    let secs = attempts
        .checked_pow(4)
        .and_then(|p| p.checked_add(5))
        .unwrap_or(u64::MAX);
    Duration::from_secs(secs)
}

/// Next `run_at` after the `attempts`-th failure, saturating at the far end of the calendar
pub fn next_run_at(now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
    chrono::Duration::from_std(backoff_delay(attempts))
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_failures() {
        assert_eq!(backoff_delay(0), Duration::from_secs(5));
        assert_eq!(backoff_delay(1), Duration::from_secs(6));
        assert_eq!(backoff_delay(2), Duration::from_secs(21));
        assert_eq!(backoff_delay(25), Duration::from_secs(390_630));
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        let now = Utc::now();
        assert!(next_run_at(now, u32::MAX) > now);
    }

    proptest! {
        #[test]
        fn next_run_at_follows_the_quartic_law(attempts in 0u32..1_000) {
            let now = Utc::now();
            let expected = i64::from(attempts).pow(4) + 5;
            let run_at = next_run_at(now, attempts);
            prop_assert_eq!((run_at - now).num_seconds(), expected);
        }

        #[test]
        fn backoff_grows_with_attempts(attempts in 0u32..10_000) {
            prop_assert!(backoff_delay(attempts + 1) > backoff_delay(attempts));
        }
    }
}
