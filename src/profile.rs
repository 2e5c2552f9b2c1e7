//! Branch profile.
//!
//! Kept beside the instruction stream rather than inside it, so compiled
//! bodies stay immutable and shareable. Only collected when
//! [`Config::branch_profiling`](crate::Config::branch_profiling) is on.

use std::collections::HashMap;

/// Saturating outcome counters for one conditional branch site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchCounts {
    pub taken: u32,
    pub not_taken: u32,
}

/// Counters keyed by `(function index, bytecode offset)`.
#[derive(Debug, Default, Clone)]
pub struct BranchProfile {
    sites: HashMap<(u32, u32), BranchCounts>,
}

impl BranchProfile {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record(&mut self, func: u32, offset: usize, taken: bool) {
        let counts = self.sites.entry((func, offset as u32)).or_default();
        if taken {
            counts.taken = counts.taken.saturating_add(1);
        } else {
            counts.not_taken = counts.not_taken.saturating_add(1);
        }
    }

    pub fn get(&self, func: u32, offset: u32) -> Option<BranchCounts> {
        self.sites.get(&(func, offset)).copied()
    }

    /// All sites of `func`, ordered by offset.
    pub fn sites_of(&self, func: u32) -> Vec<(u32, BranchCounts)> {
        let mut out: Vec<_> = self
            .sites
            .iter()
            .filter(|((f, _), _)| *f == func)
            .map(|(&(_, offset), &counts)| (offset, counts))
            .collect();
        out.sort_unstable_by_key(|&(offset, _)| offset);
        out
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn clear(&mut self) {
        self.sites.clear();
    }
}
