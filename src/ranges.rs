//! Splitting counts and durations into worker shards.

use std::time::Duration;

/// A contiguous range of record ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordRange {
    pub start: i64,
    pub count: i64,
}

/// Splits `[0, total)` into `n` contiguous ranges whose counts differ by at
/// most one; earlier ranges take the remainder.
pub fn split_records(total: i64, n: i64) -> Vec<RecordRange> {
    assert!(total >= 0 && n > 0, "need non-negative total and positive shard count");
    let base = total / n;
    let rem = total % n;
    let mut out = Vec::with_capacity(n as usize);
    let mut start = 0;
    for i in 0..n {
        let count = base + i64::from(i < rem);
        out.push(RecordRange { start, count });
        start += count;
    }
    out
}

/// Splits a duration into `⌈v / max_size⌉` chunks that sum to `v`. All but
/// the last chunk are `v / num` long; the last takes the remainder.
pub fn split_duration(v: Duration, max_size: Duration) -> Vec<Duration> {
    let v_ns = v.as_nanos();
    let max_ns = max_size.as_nanos();
    assert!(max_ns > 0, "max_size must be positive");
    let num = (v_ns + max_ns - 1) / max_ns;
    if num == 0 {
        return Vec::new();
    }
    let mut chunks = Vec::with_capacity(num as usize);
    let mut cum = 0u128;
    for _ in 0..num - 1 {
        let c = v_ns / num;
        chunks.push(Duration::from_nanos(c as u64));
        cum += c;
    }
    chunks.push(Duration::from_nanos((v_ns - cum) as u64));
    chunks
}
