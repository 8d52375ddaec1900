//! Lane identifier newtype.
//!
//! Lane indices travel through SQL text, JSON exports and in-memory maps.
//! Wrapping them prevents mixing a lane with a thread counter, which is the
//! other small integer every event carries.

use serde::{Deserialize, Serialize};

/// Index of an ordering lane in `[0, THREAD_COUNT)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// Return the inner lane index.
    pub const fn into_inner(self) -> u32 {
        self.0
    }

    /// Return the lane index as a `usize` for vector addressing.
    pub fn index(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }

    /// Whether this lane exists in a store configured with `thread_count` lanes.
    pub const fn is_within(self, thread_count: u32) -> bool {
        self.0 < thread_count
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ThreadId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<ThreadId> for u32 {
    fn from(id: ThreadId) -> Self {
        id.0
    }
}
