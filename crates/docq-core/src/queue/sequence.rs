//! SortIndexSequence - strict per-key order 用の sort index 採番
//!
//! 同一ナノ秒に複数 push されても sequence で単調増加を保つ。

use std::sync::Mutex;

#[derive(Debug, Default)]
struct SequenceState {
    last_timestamp: i64,
    sequence: i64,
}

/// Produces strictly increasing sort indexes seeded from wall-clock time.
///
/// Two pushes within the same clock tick (or after the clock stepped back)
/// reuse the last timestamp and bump a per-instance sequence, so indexes never
/// collide and never go backwards for callers sharing one instance.
#[derive(Debug, Default)]
pub struct SortIndexSequence {
    state: Mutex<SequenceState>,
}

impl SortIndexSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next index for a push observed at `now_nanos`.
    pub fn next(&self, now_nanos: i64) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if now_nanos > state.last_timestamp {
            state.last_timestamp = now_nanos;
            state.sequence = 1;
        } else {
            state.sequence += 1;
        }
        state.last_timestamp + state.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn same_tick_pushes_get_increasing_indexes() {
        let seq = SortIndexSequence::new();
        assert_eq!(seq.next(1_000), 1_001);
        assert_eq!(seq.next(1_000), 1_002);
        assert_eq!(seq.next(1_000), 1_003);
    }

    #[test]
    fn clock_going_backwards_does_not_reorder() {
        let seq = SortIndexSequence::new();
        let a = seq.next(5_000);
        let b = seq.next(4_000);
        let c = seq.next(5_000);
        assert!(a < b && b < c);
    }

    #[test]
    fn new_tick_resets_sequence() {
        let seq = SortIndexSequence::new();
        seq.next(100);
        seq.next(100);
        assert_eq!(seq.next(200), 201);
    }

    #[test]
    fn concurrent_callers_never_collide() {
        let seq = Arc::new(SortIndexSequence::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || (0..500).map(|_| seq.next(42)).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
