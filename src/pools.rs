//! Erase-counter-ordered pools of physical erase blocks.
//!
//! `free` and `dirty` are ordered by `(ec, pnum)`, so extraction always
//! yields the least-worn PEB; that ordering is the whole wear-leveling
//! strategy. Quarantined PEBs keep their last-known erase counter but are
//! never handed out again.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default, Clone)]
pub(crate) struct PebPools {
    free: BTreeSet<(u32, u32)>,
    dirty: BTreeSet<(u32, u32)>,
    bad: BTreeMap<u32, u32>,
}

impl PebPools {
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn bad_count(&self) -> usize {
        self.bad.len()
    }

    pub fn insert_free(&mut self, ec: u32, pnum: u32) {
        self.free.insert((ec, pnum));
    }

    pub fn insert_dirty(&mut self, ec: u32, pnum: u32) {
        self.dirty.insert((ec, pnum));
    }

    /// Extract the free PEB with the smallest erase counter
    pub fn pop_min_free(&mut self) -> Option<(u32, u32)> {
        self.free.pop_first()
    }

    /// Extract the dirty PEB with the smallest erase counter
    pub fn pop_min_dirty(&mut self) -> Option<(u32, u32)> {
        self.dirty.pop_first()
    }

    /// Move a PEB out of circulation, remembering its last-known erase
    /// counter
    pub fn quarantine(&mut self, pnum: u32, last_ec: u32) {
        self.bad.insert(pnum, last_ec);
    }

    pub fn bad_ec(&self, pnum: u32) -> Option<u32> {
        self.bad.get(&pnum).copied()
    }
}
