//! Export cursor over all lanes.
//!
//! A cursor records, for every lane, the next thread counter that has not
//! been exported yet. Loading events "at" a cursor returns exactly the
//! events whose counter is at or past the recorded value of their lane, so
//! a cursor taken at a flush boundary resumes without gaps or repeats.
//!
//! # Encoding
//!
//! Each lane counter is written as a 6-byte big-endian integer, the lanes
//! are concatenated in lane order and the result is base64 encoded with
//! the standard alphabet. A missing cursor is equivalent to all zeros.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::constants::CURSOR_COUNTER_BYTES;
use crate::ids::ThreadId;
use crate::structs::StoredEvent;

/// Largest counter representable in [`CURSOR_COUNTER_BYTES`] bytes.
const MAX_CURSOR_COUNTER: u64 = 0xFFFF_FFFF_FFFF;

/// Errors produced when decoding an externally supplied cursor.
#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    /// The cursor is not valid base64.
    #[error("cursor is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The cursor was produced by a store with a different lane count.
    #[error("cursor holds {actual} bytes, expected {expected}")]
    Length {
        /// Byte length implied by the local lane count.
        expected: usize,
        /// Byte length actually decoded.
        actual: usize,
    },
}

/// Per-lane export position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    counters: Vec<u64>,
}

impl Cursor {
    /// The position before the first event of every lane.
    pub fn initial(thread_count: u32) -> Self {
        Self {
            counters: vec![0; usize::try_from(thread_count).unwrap_or_default()],
        }
    }

    /// Decode an encoded cursor; `None` yields [`Cursor::initial`].
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::Base64`] for malformed input and
    /// [`CursorError::Length`] when the lane count does not match.
    pub fn decode(encoded: Option<&str>, thread_count: u32) -> Result<Self, CursorError> {
        let Some(encoded) = encoded else {
            return Ok(Self::initial(thread_count));
        };

        let bytes = STANDARD.decode(encoded)?;
        let expected = usize::try_from(thread_count)
            .unwrap_or_default()
            .saturating_mul(CURSOR_COUNTER_BYTES);
        if bytes.len() != expected {
            return Err(CursorError::Length {
                expected,
                actual: bytes.len(),
            });
        }

        let counters = bytes
            .chunks_exact(CURSOR_COUNTER_BYTES)
            .map(|chunk| {
                let mut buf = [0_u8; 8];
                for (slot, byte) in buf.iter_mut().skip(2).zip(chunk) {
                    *slot = *byte;
                }
                u64::from_be_bytes(buf)
            })
            .collect();

        Ok(Self { counters })
    }

    /// Encode the cursor for hand-off to a consumer.
    pub fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(self.counters.len().saturating_mul(CURSOR_COUNTER_BYTES));
        for counter in &self.counters {
            bytes.extend(counter.to_be_bytes().iter().skip(2));
        }
        STANDARD.encode(bytes)
    }

    /// Number of lanes covered by this cursor.
    pub const fn thread_count(&self) -> usize {
        self.counters.len()
    }

    /// Next unexported counter of a lane (0 for lanes outside the cursor).
    pub fn next_counter(&self, thread_id: ThreadId) -> u64 {
        self.counters.get(thread_id.index()).copied().unwrap_or_default()
    }

    /// All lane positions in lane order.
    pub fn counters(&self) -> &[u64] {
        &self.counters
    }

    /// Whether no event has been consumed through this cursor.
    pub fn is_initial(&self) -> bool {
        self.counters.iter().all(|counter| *counter == 0)
    }

    /// Move the cursor past the given events.
    ///
    /// Lanes only ever move forward; events behind the current position
    /// leave it untouched.
    pub fn advance<'a>(&mut self, events: impl IntoIterator<Item = &'a StoredEvent>) {
        for event in events {
            let next = event.thread_counter.saturating_add(1).min(MAX_CURSOR_COUNTER);
            if let Some(slot) = self.counters.get_mut(event.thread_id.index()) {
                if next > *slot {
                    *slot = next;
                }
            }
        }
    }
}

impl core::fmt::Display for Cursor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::InputEvent;

    fn stored(thread_id: u32, thread_counter: u64) -> StoredEvent {
        StoredEvent::from_input(
            InputEvent::new("agg", 1, "T", None).with_timestamp(0),
            ThreadId(thread_id),
            thread_counter,
            0,
        )
    }

    #[test]
    fn missing_cursor_is_initial() {
        let cursor = Cursor::decode(None, 4).ok();
        assert_eq!(cursor, Some(Cursor::initial(4)));
        assert!(Cursor::initial(4).is_initial());
    }

    #[test]
    fn advance_moves_lanes_forward_only() {
        let mut cursor = Cursor::initial(4);
        cursor.advance(&[stored(1, 0), stored(1, 1), stored(3, 5)]);
        assert_eq!(cursor.counters(), &[0, 2, 0, 6]);

        cursor.advance(&[stored(1, 0)]);
        assert_eq!(cursor.next_counter(ThreadId(1)), 2);
    }

    #[test]
    fn encoded_cursor_decodes_to_same_positions() {
        let mut cursor = Cursor::initial(3);
        cursor.advance(&[stored(0, 0x0102_0304_0506), stored(2, 9)]);

        let encoded = cursor.encode();
        // 3 lanes * 6 bytes = 18 bytes = 24 base64 characters.
        assert_eq!(encoded.len(), 24);

        let decoded = Cursor::decode(Some(&encoded), 3).ok();
        assert_eq!(decoded, Some(cursor));
    }

    #[test]
    fn cursor_from_other_lane_count_is_rejected() {
        let encoded = Cursor::initial(2).encode();
        let result = Cursor::decode(Some(&encoded), 3);
        assert!(matches!(
            result,
            Err(CursorError::Length {
                expected: 18,
                actual: 12
            })
        ));
    }

    #[test]
    fn garbage_cursor_is_rejected() {
        assert!(matches!(
            Cursor::decode(Some("not base64!!"), 1),
            Err(CursorError::Base64(_))
        ));
    }
}
