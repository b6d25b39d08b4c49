//! Wall Clock
//!
//! Millisecond timestamps shared by the wire protocol (`timestamp`,
//! `serverTime`, chat expiry). Simulation never reads the clock; only the
//! network layers and the client runtime do.

use chrono::Utc;

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// Current wall-clock time in milliseconds.
#[inline]
pub fn now_millis() -> Millis {
    Utc::now().timestamp_millis().max(0) as Millis
}

/// Signed difference `a - b` in milliseconds.
#[inline]
pub fn diff_millis(a: Millis, b: Millis) -> i64 {
    a as i64 - b as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_diff_is_signed() {
        assert_eq!(diff_millis(100, 250), -150);
        assert_eq!(diff_millis(250, 100), 150);
    }
}
