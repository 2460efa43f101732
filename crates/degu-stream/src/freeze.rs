#![forbid(unsafe_code)]

//! Freeze bookkeeping: depth plus the ordered set of dirty keys.
//!
//! # Invariants
//!
//! 1. `dirty` holds each key at most once, in order of first touch.
//! 2. `dirty` is empty whenever the state is not frozen.
//! 3. In [`FreezeMode::Flat`] the depth is never above 1.

use rustc_hash::FxHashSet;

use crate::config::FreezeMode;

/// Outcome of [`FreezeState::release`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Release {
    /// The state was not frozen.
    Idle,
    /// An outer nested freeze is still in effect.
    Held,
    /// Depth reached zero; these keys were touched while frozen.
    Thawed(Vec<String>),
}

#[derive(Debug)]
pub(crate) struct FreezeState {
    mode: FreezeMode,
    depth: u32,
    dirty: Vec<String>,
    seen: FxHashSet<String>,
}

impl FreezeState {
    pub(crate) fn new(mode: FreezeMode) -> Self {
        Self {
            mode,
            depth: 0,
            dirty: Vec::new(),
            seen: FxHashSet::default(),
        }
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.depth > 0
    }

    pub(crate) fn freeze(&mut self) {
        self.depth = match self.mode {
            FreezeMode::Flat => 1,
            FreezeMode::Nested => self.depth.saturating_add(1),
        };
    }

    /// Record a write. Returns false when the key was already dirty.
    pub(crate) fn mark_dirty(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_owned());
        self.dirty.push(key.to_owned());
        true
    }

    pub(crate) fn dirty(&self) -> &[String] {
        &self.dirty
    }

    /// Undo one freeze. The dirty keys leave the state before the caller
    /// publishes anything.
    pub(crate) fn release(&mut self) -> Release {
        if self.depth == 0 {
            return Release::Idle;
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Release::Held;
        }
        self.seen.clear();
        Release::Thawed(std::mem::take(&mut self.dirty))
    }
}
