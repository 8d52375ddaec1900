//! Lane assignment and the per-invocation counter cache.
//!
//! [`assign`] is the only place an event's lane is decided. It must stay
//! bit-for-bit stable: two stores with the same lane count rely on it to
//! place the same event in the same lane when replicating.

use threadlog_types::{ThreadCounter, ThreadId};

use crate::error::StoreError;

/// Map an aggregate identity to its lane.
///
/// Hashes the UTF-8 bytes of `aggregate_id` followed by the decimal
/// rendering of `aggregate_version` with CRC-32 (IEEE), reads the checksum
/// as a signed 32-bit integer, takes its absolute value and reduces it
/// modulo `thread_count`. A zero `thread_count` maps everything to lane 0.
pub fn assign(aggregate_id: &str, aggregate_version: u32, thread_count: u32) -> ThreadId {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(aggregate_id.as_bytes());
    hasher.update(aggregate_version.to_string().as_bytes());
    let checksum = i32::from_ne_bytes(hasher.finalize().to_ne_bytes());

    ThreadId(
        checksum
            .unsigned_abs()
            .checked_rem(thread_count)
            .unwrap_or_default(),
    )
}

/// Last assigned counter of every lane, for the duration of one call.
///
/// The cache is never shared between calls: other processes may append to
/// the same store, so every pipeline invocation re-derives it from storage.
#[derive(Debug, Clone)]
pub struct ThreadCounters {
    last: Vec<Option<u64>>,
}

impl ThreadCounters {
    /// A cache in which no lane has been used yet.
    pub fn new(thread_count: u32) -> Self {
        Self {
            last: vec![None; usize::try_from(thread_count).unwrap_or_default()],
        }
    }

    /// Build the cache from the per-lane maxima loaded from storage.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MalformedRow`] if storage reports a lane outside
    /// `[0, thread_count)`; the store was written with a different lane count.
    pub fn from_loaded(thread_count: u32, rows: &[ThreadCounter]) -> Result<Self, StoreError> {
        let mut counters = Self::new(thread_count);
        for row in rows {
            if !counters.observe(row.thread_id, row.thread_counter) {
                return Err(StoreError::MalformedRow(format!(
                    "thread {} is outside the configured {thread_count} lanes",
                    row.thread_id
                )));
            }
        }
        Ok(counters)
    }

    /// Number of lanes tracked.
    pub const fn thread_count(&self) -> usize {
        self.last.len()
    }

    /// Hash an event into its lane and hand out that lane's next counter.
    pub fn assign(&mut self, aggregate_id: &str, aggregate_version: u32) -> (ThreadId, u64) {
        let thread_count = u32::try_from(self.last.len()).unwrap_or(u32::MAX);
        let thread_id = assign(aggregate_id, aggregate_version, thread_count);
        (thread_id, self.next(thread_id))
    }

    /// Hand out the next counter of a lane: 0 when unseen, otherwise last + 1.
    pub fn next(&mut self, thread_id: ThreadId) -> u64 {
        let Some(slot) = self.last.get_mut(thread_id.index()) else {
            return 0;
        };
        let next = slot.map_or(0, |last| last.saturating_add(1));
        *slot = Some(next);
        next
    }

    /// Record a counter that was assigned elsewhere, keeping the maximum.
    ///
    /// Returns `false` when the lane is out of range.
    pub fn observe(&mut self, thread_id: ThreadId, counter: u64) -> bool {
        let Some(slot) = self.last.get_mut(thread_id.index()) else {
            return false;
        };
        if slot.is_none_or(|last| counter > last) {
            *slot = Some(counter);
        }
        true
    }

    /// The last assigned counter of a lane, if any.
    pub fn last(&self, thread_id: ThreadId) -> Option<u64> {
        self.last.get(thread_id.index()).copied().flatten()
    }

    /// Next counter to assign for every lane in use, for the threads table.
    pub fn to_next_counters(&self) -> Vec<ThreadCounter> {
        self.last
            .iter()
            .zip(0_u32..)
            .filter_map(|(last, thread_id)| {
                last.map(|last| ThreadCounter {
                    thread_id: ThreadId(thread_id),
                    thread_counter: last.saturating_add(1),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_matches_reference_checksum() {
        // CRC-32("123456789") = 0xCBF43926, signed -873187034, |x| mod 256 = 218.
        assert_eq!(assign("12345678", 9, 256), ThreadId(218));
        assert_eq!(assign("12345678", 9, 4), ThreadId(2));
    }

    #[test]
    fn assign_is_deterministic_per_version() {
        assert_eq!(assign("A", 1, 4), ThreadId(3));
        assert_eq!(assign("A", 2, 4), ThreadId(3));
        assert_eq!(assign("A", 3, 4), ThreadId(1));
        for _ in 0..10 {
            assert_eq!(assign("A", 3, 4), assign("A", 3, 4));
        }
    }

    #[test]
    fn assign_stays_within_lane_count() {
        for version in 1..500 {
            assert!(assign("order-42", version, 7).is_within(7));
        }
    }

    #[test]
    fn counters_start_at_zero_and_increase_per_lane() {
        let mut counters = ThreadCounters::new(4);
        assert_eq!(counters.next(ThreadId(2)), 0);
        assert_eq!(counters.next(ThreadId(2)), 1);
        assert_eq!(counters.next(ThreadId(0)), 0);
        assert_eq!(counters.next(ThreadId(2)), 2);
        assert_eq!(counters.last(ThreadId(1)), None);
    }

    #[test]
    fn loaded_counters_continue_after_maximum() {
        let rows = [ThreadCounter {
            thread_id: ThreadId(1),
            thread_counter: 41,
        }];
        let mut counters = ThreadCounters::from_loaded(4, &rows).unwrap_or_else(|_| ThreadCounters::new(4));
        assert_eq!(counters.next(ThreadId(1)), 42);
        assert_eq!(
            counters.to_next_counters(),
            vec![ThreadCounter {
                thread_id: ThreadId(1),
                thread_counter: 43
            }]
        );
    }

    #[test]
    fn loaded_lane_outside_range_is_rejected() {
        let rows = [ThreadCounter {
            thread_id: ThreadId(9),
            thread_counter: 0,
        }];
        assert!(matches!(
            ThreadCounters::from_loaded(4, &rows),
            Err(StoreError::MalformedRow(_))
        ));
    }

    #[test]
    fn observe_keeps_maximum() {
        let mut counters = ThreadCounters::new(2);
        assert!(counters.observe(ThreadId(0), 5));
        assert!(counters.observe(ThreadId(0), 3));
        assert_eq!(counters.last(ThreadId(0)), Some(5));
        assert!(!counters.observe(ThreadId(2), 0));
    }
}
