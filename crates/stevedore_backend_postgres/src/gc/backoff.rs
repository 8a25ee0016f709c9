use chrono::Duration;

const BASE_SECS: i64 = 5 * 60;
const CAP_SECS: i64 = 24 * 60 * 60;

/// Review backoff for tasks that failed processing: `5m * 2^review_count`,
/// clamped to `[5m, 24h]`. Counts above 30 saturate at the cap, which also
/// keeps the shift from overflowing.
pub fn exponential_backoff(review_count: i32) -> Duration {
    if review_count < 0 {
        return Duration::seconds(BASE_SECS);
    }
    if review_count > 30 {
        return Duration::seconds(CAP_SECS);
    }
    let secs = BASE_SECS.saturating_mul(1i64 << review_count);
    Duration::seconds(secs.min(CAP_SECS))
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case(0, 5 * 60)]
    #[case(1, 10 * 60)]
    #[case(2, 20 * 60)]
    #[case(3, 40 * 60)]
    #[case(8, 76_800)] // 5m * 256, still under the cap
    #[case(9, 24 * 60 * 60)]
    #[case(30, 24 * 60 * 60)]
    #[case(31, 24 * 60 * 60)]
    #[case(i32::MAX, 24 * 60 * 60)]
    #[case(-1, 5 * 60)]
    #[case(i32::MIN, 5 * 60)]
    fn backoff_values(#[case] count: i32, #[case] expected_secs: i64) {
        assert_eq!(exponential_backoff(count).num_seconds(), expected_secs);
    }
}
