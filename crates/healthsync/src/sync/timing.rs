//! Timing helpers for retry and staging windows
//!
//! Pure functions that can be tested without a running engine.

use chrono::{DateTime, Utc};

/// Check whether `since` lies at least `window_secs` in the past.
///
/// # Arguments
/// * `since` - When the tracked event happened (None if it never happened)
/// * `window_secs` - Minimum seconds that must elapse
/// * `now` - Reference time
///
/// # Returns
/// `true` if the window has passed (or there is no event), `false` otherwise
pub fn window_elapsed(since: Option<DateTime<Utc>>, window_secs: u64, now: DateTime<Utc>) -> bool {
    match since {
        Some(at) => (now - at).num_seconds() >= window_secs as i64,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_window_elapsed_without_event() {
        assert!(window_elapsed(None, 30, Utc::now()));
        assert!(window_elapsed(None, 0, Utc::now()));
    }

    #[test]
    fn test_window_elapsed_recent_event() {
        let now = Utc::now();
        assert!(!window_elapsed(Some(now - Duration::seconds(10)), 30, now));
        assert!(!window_elapsed(Some(now - Duration::seconds(1)), 30, now));
    }

    #[test]
    fn test_window_elapsed_old_event() {
        let now = Utc::now();
        assert!(window_elapsed(Some(now - Duration::seconds(60)), 30, now));
        // Exactly at the boundary
        assert!(window_elapsed(Some(now - Duration::seconds(30)), 30, now));
    }

    #[test]
    fn test_window_elapsed_zero_window() {
        let now = Utc::now();
        assert!(window_elapsed(Some(now), 0, now));
    }

    #[test]
    fn test_future_event_is_not_elapsed() {
        // Clock skew: a manifest stamped in the future is treated as fresh
        let now = Utc::now();
        assert!(!window_elapsed(Some(now + Duration::seconds(5)), 1, now));
    }
}
