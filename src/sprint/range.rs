/// An inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

/// Partition `[start, stop]` (inclusive) into contiguous chunks of at most
/// `size` blocks.
///
/// Range identity depends on the exact boundaries chosen, so the scheduler
/// and any offline re-division must both go through this function.
pub fn divide_range_inclusive(start: u64, stop: u64, size: u64) -> Vec<BlockRange> {
    if start > stop {
        return Vec::new();
    }
    if size == 0 || start == stop {
        return vec![BlockRange { start, end: stop }];
    }

    let mut ranges = Vec::new();
    let mut cur = start;
    while cur <= stop {
        let end = cur.saturating_add(size - 1).min(stop);
        ranges.push(BlockRange { start: cur, end });
        if end == u64::MAX {
            break;
        }
        cur = end + 1;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(ranges: &[BlockRange], start: u64, stop: u64, size: u64) {
        assert_eq!(ranges.first().map(|r| r.start), Some(start));
        assert_eq!(ranges.last().map(|r| r.end), Some(stop));
        for window in ranges.windows(2) {
            assert_eq!(window[1].start, window[0].end + 1, "gap or overlap");
        }
        for r in ranges {
            assert!(r.start <= r.end);
            assert!(r.end - r.start + 1 <= size.max(1), "chunk too wide: {:?}", r);
        }
    }

    #[test]
    fn divides_exact_multiples() {
        let ranges = divide_range_inclusive(0, 29, 10);
        assert_eq!(
            ranges,
            vec![
                BlockRange { start: 0, end: 9 },
                BlockRange { start: 10, end: 19 },
                BlockRange { start: 20, end: 29 },
            ]
        );
    }

    #[test]
    fn final_chunk_is_truncated() {
        let ranges = divide_range_inclusive(100, 125, 10);
        assert_eq!(
            ranges,
            vec![
                BlockRange { start: 100, end: 109 },
                BlockRange { start: 110, end: 119 },
                BlockRange { start: 120, end: 125 },
            ]
        );
    }

    #[test]
    fn covers_without_gaps_for_many_shapes() {
        for &(start, stop, size) in &[
            (0u64, 0u64, 1u64),
            (0, 1, 1),
            (5, 104, 7),
            (1, 1000, 13),
            (99, 100, 1000),
            (42, 42, 0),
            (7, 1000, 1),
        ] {
            let ranges = divide_range_inclusive(start, stop, size);
            if size == 0 {
                assert_eq!(ranges, vec![BlockRange { start, end: stop }]);
            } else {
                assert_covers(&ranges, start, stop, size);
            }
        }
    }

    #[test]
    fn empty_when_start_after_stop() {
        assert!(divide_range_inclusive(10, 9, 5).is_empty());
    }

    #[test]
    fn single_block_and_zero_size() {
        assert_eq!(
            divide_range_inclusive(7, 7, 10),
            vec![BlockRange { start: 7, end: 7 }]
        );
        assert_eq!(
            divide_range_inclusive(3, 9, 0),
            vec![BlockRange { start: 3, end: 9 }]
        );
    }
}
