/// Timestamp type. The unit is up to the caller; all defaults assume milliseconds.
pub type Timestamp = i64;

/// Value type.
pub type Value = f64;

/// A single (timestamp, value) pair.
pub type Sample = (Timestamp, Value);

/// Upper bound of the `range`-aligned window containing `t`.
pub fn range_for_timestamp(t: Timestamp, range: i64) -> Timestamp {
    (t / range) * range + range
}

/// Closed-interval overlap test.
pub fn interval_overlap(amin: Timestamp, amax: Timestamp, bmin: Timestamp, bmax: Timestamp) -> bool {
    amin <= bmax && bmin <= amax
}

/// Clamps `[a, b]` to `[mint, maxt]`.
pub fn clamp_interval(a: Timestamp, b: Timestamp, mint: Timestamp, maxt: Timestamp) -> (Timestamp, Timestamp) {
    (a.max(mint), b.min(maxt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_for_timestamp_aligns_to_window_end() {
        assert_eq!(range_for_timestamp(0, 100), 100);
        assert_eq!(range_for_timestamp(99, 100), 100);
        assert_eq!(range_for_timestamp(100, 100), 200);
        assert_eq!(range_for_timestamp(1234, 1000), 2000);
    }

    #[test]
    fn overlap_and_clamp() {
        assert!(interval_overlap(0, 10, 10, 20));
        assert!(!interval_overlap(0, 9, 10, 20));
        assert_eq!(clamp_interval(-5, 50, 0, 20), (0, 20));
    }
}
