// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Elem canonicalization.
//!
//! An *elem* is one observable point of the instrumented program: a scope
//! at a given (thread, nesting path, name), a plot curve, a lock, a
//! per-thread memory counter. The index canonicalizes the hashed path of
//! each observation into a dense, session-stable id.
//!
//! Path hashes are chained FNV-1a over the path steps. Distinct paths can
//! collide on the chained hash, so each elem stores its full step list and
//! candidates are compared step by step.
//!
//! Elems are created on first observation and never destroyed within a
//! session. Newly created and updated ids are collected for the delta
//! view.

use crate::{consts::ELEM_CHUNK_SIZE, hashing, pyramid::ElemPyramid, record::ChunkLoc};
use rustc_hash::FxHashMap;

/// Words appended to an elem chunk per observation: the base-stream index
/// plus a 64-bit time and a 64-bit value, split into u32 words so elem
/// chunks and event chunks stay storage-interchangeable.
const WORDS_PER_ENTRY: usize = 5;

/// Identity and creation attributes of an elem observation.
pub struct ElemKey<'a> {
    /// Chained path: thread step first (or a wildcard for global elems),
    /// then one step per nesting name, then the elem name hash.
    pub path_steps: &'a [u64],
    /// Whether the first path step is a thread hash.
    pub is_thread_hashed: bool,
    pub thread_id: u16,
    pub nesting_level: u8,
    pub name_idx: u32,
    /// Display name, when different from `name_idx` (synthetic elems).
    pub hl_name_idx: u32,
    pub prev_elem_idx: u32,
    pub flags: u8,
    /// Density-mode MR merging (scopes) vs subsampling (plots).
    pub do_represent_scope: bool,
}

/// Builder state of one canonical elem.
pub struct ElemBuild {
    pub hash_path: u64,
    /// Path hash excluding the thread step.
    pub partial_hash_path: u64,
    /// Which thread ids have reported this elem.
    pub thread_bitmap: u64,
    pub prev_elem_idx: u32,
    pub thread_id: u16,
    pub nesting_level: u8,
    pub name_idx: u32,
    pub hl_name_idx: u32,
    pub flags: u8,
    pub do_represent_scope: bool,
    pub is_thread_hashed: bool,
    pub abs_y_min: f64,
    pub abs_y_max: f64,
    pub last_time_ns: u64,

    path_steps: Vec<u64>,
    chunk_words: Vec<u32>,
    pub chunk_locs: Vec<ChunkLoc>,
    pub pyramid: ElemPyramid,
}

impl ElemBuild {
    fn new(key: &ElemKey<'_>, hash_path: u64, partial_hash_path: u64) -> Self {
        Self {
            hash_path,
            partial_hash_path,
            thread_bitmap: 0,
            prev_elem_idx: key.prev_elem_idx,
            thread_id: key.thread_id,
            nesting_level: key.nesting_level,
            name_idx: key.name_idx,
            hl_name_idx: key.hl_name_idx,
            flags: key.flags,
            do_represent_scope: key.do_represent_scope,
            is_thread_hashed: key.is_thread_hashed,
            abs_y_min: f64::INFINITY,
            abs_y_max: f64::NEG_INFINITY,
            last_time_ns: 0,
            path_steps: key.path_steps.to_vec(),
            chunk_words: Vec::with_capacity(ELEM_CHUNK_SIZE),
            chunk_locs: Vec::new(),
            pyramid: ElemPyramid::default(),
        }
    }

    /// Append one observation; returns a sealed chunk body when the
    /// in-RAM buffer filled up.
    fn push_value(&mut self, lidx: u32, time_ns: u64, value: f64) -> Option<Vec<u8>> {
        self.abs_y_min = self.abs_y_min.min(value);
        self.abs_y_max = self.abs_y_max.max(value);
        self.last_time_ns = time_ns;
        self.pyramid.push_value(time_ns, value);

        self.chunk_words.push(lidx);
        self.chunk_words.push(time_ns as u32);
        self.chunk_words.push((time_ns >> 32) as u32);
        let bits = value.to_bits();
        self.chunk_words.push(bits as u32);
        self.chunk_words.push((bits >> 32) as u32);

        if self.chunk_words.len() + WORDS_PER_ENTRY > ELEM_CHUNK_SIZE {
            Some(self.seal_chunk())
        } else {
            None
        }
    }

    /// Drain the buffered words into a chunk body.
    pub fn seal_chunk(&mut self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.chunk_words.len() * 4);
        for w in self.chunk_words.drain(..) {
            body.extend(w.to_le_bytes());
        }
        body
    }

    pub fn has_pending_chunk(&self) -> bool {
        !self.chunk_words.is_empty()
    }

    /// Serialize the descriptor for the elem table block.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend(self.hash_path.to_le_bytes());
        buf.extend(self.partial_hash_path.to_le_bytes());
        buf.extend(self.thread_bitmap.to_le_bytes());
        buf.extend(self.prev_elem_idx.to_le_bytes());
        buf.extend(self.thread_id.to_le_bytes());
        buf.push(self.nesting_level);
        buf.push(self.flags);
        buf.extend(self.name_idx.to_le_bytes());
        buf.extend(self.hl_name_idx.to_le_bytes());
        buf.push(self.do_represent_scope as u8);
        buf.push(self.is_thread_hashed as u8);
        buf.extend([0u8; 2]);
        buf.extend(self.abs_y_min.to_le_bytes());
        buf.extend(self.abs_y_max.to_le_bytes());
        buf.extend(self.last_time_ns.to_le_bytes());
    }
}

/// The session-wide elem registry.
#[derive(Default)]
pub struct ElemIndex {
    elems: Vec<ElemBuild>,
    /// Chained path hash to candidate ids; candidates are disambiguated by
    /// full path comparison.
    path_to_ids: FxHashMap<u64, Vec<u32>>,
    /// Ids created or updated since the last delta snapshot.
    dirty_ids: Vec<u32>,
}

impl ElemIndex {
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn get(&self, idx: u32) -> &ElemBuild {
        &self.elems[idx as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ElemBuild> {
        self.elems.iter()
    }

    /// Hash a path step list the way the index does.
    pub fn hash_path(steps: &[u64]) -> u64 {
        let mut h = hashing::hash_chain_start(steps[0]);
        for step in &steps[1..] {
            h = hashing::hash_step(*step, h);
        }
        if h == 0 {
            1
        } else {
            h
        }
    }

    /// Canonicalize an observation into its dense elem id, creating the
    /// elem on first sight.
    pub fn ensure(&mut self, key: &ElemKey<'_>) -> u32 {
        debug_assert!(!key.path_steps.is_empty());

        let hash_path = Self::hash_path(key.path_steps);

        if let Some(candidates) = self.path_to_ids.get(&hash_path) {
            for idx in candidates {
                if self.elems[*idx as usize].path_steps == key.path_steps {
                    let elem = &mut self.elems[*idx as usize];
                    if elem.thread_bitmap & (1 << (key.thread_id % 64)) == 0 {
                        elem.thread_bitmap |= 1 << (key.thread_id % 64);
                        self.dirty_ids.push(*idx);
                    }
                    return *idx;
                }
            }
        }

        let partial = if key.is_thread_hashed && key.path_steps.len() > 1 {
            Self::hash_path(&key.path_steps[1..])
        } else {
            hash_path
        };

        let idx = self.elems.len() as u32;
        let mut elem = ElemBuild::new(key, hash_path, partial);
        elem.thread_bitmap |= 1 << (key.thread_id % 64);
        self.elems.push(elem);
        self.path_to_ids.entry(hash_path).or_default().push(idx);
        self.dirty_ids.push(idx);

        idx
    }

    /// Record one observation; returns a sealed chunk body to write when
    /// the elem's buffer filled up.
    pub fn push_value(
        &mut self,
        idx: u32,
        lidx: u32,
        time_ns: u64,
        value: f64,
    ) -> Option<Vec<u8>> {
        let sealed = self.elems[idx as usize].push_value(lidx, time_ns, value);
        if sealed.is_some() {
            self.dirty_ids.push(idx);
        }
        sealed
    }

    pub fn push_chunk_loc(&mut self, idx: u32, loc: ChunkLoc) {
        self.elems[idx as usize].chunk_locs.push(loc);
    }

    /// Drain the ids changed since the last call, deduplicated.
    pub fn take_dirty_ids(&mut self) -> Vec<u32> {
        self.dirty_ids.sort_unstable();
        self.dirty_ids.dedup();
        std::mem::take(&mut self.dirty_ids)
    }

    /// Mutable access for finalization (sealing pending chunks).
    pub fn get_mut(&mut self, idx: u32) -> &mut ElemBuild {
        &mut self.elems[idx as usize]
    }

    /// Serialize the elem table block.
    pub fn encode_table(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.elems.len() * 64);
        buf.extend((self.elems.len() as u32).to_le_bytes());
        for elem in &self.elems {
            elem.encode_into(&mut buf);
        }
        buf
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::consts::INVALID_IDX;

    fn key<'a>(steps: &'a [u64], thread_id: u16, level: u8) -> ElemKey<'a> {
        ElemKey {
            path_steps: steps,
            is_thread_hashed: true,
            thread_id,
            nesting_level: level,
            name_idx: 1,
            hl_name_idx: 1,
            prev_elem_idx: INVALID_IDX,
            flags: 0,
            do_represent_scope: true,
        }
    }

    #[test]
    fn same_path_same_id() {
        let mut index = ElemIndex::default();

        let steps = [100u64, 200, 300];
        let a = index.ensure(&key(&steps, 0, 1));
        let b = index.ensure(&key(&steps, 0, 1));
        assert_eq!(a, b);
        assert_eq!(index.len(), 1);

        let other = [100u64, 200, 301];
        let c = index.ensure(&key(&other, 0, 1));
        assert_ne!(a, c);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn ids_are_dense_and_stable() {
        let mut index = ElemIndex::default();

        for i in 0..50u64 {
            let steps = [1, i];
            assert_eq!(index.ensure(&key(&steps, 0, 0)), i as u32);
        }
        // Re-observation does not mint new ids.
        for i in 0..50u64 {
            let steps = [1, i];
            assert_eq!(index.ensure(&key(&steps, 0, 0)), i as u32);
        }
    }

    #[test]
    fn thread_bitmap_accumulates() {
        let mut index = ElemIndex::default();

        let steps = [7u64, 8];
        let id = index.ensure(&key(&steps, 0, 0));
        index.ensure(&key(&steps, 3, 0));

        assert_eq!(index.get(id).thread_bitmap, 0b1001);
    }

    #[test]
    fn new_and_updated_ids_flow_to_delta() {
        let mut index = ElemIndex::default();

        let id = index.ensure(&key(&[1, 2], 0, 0));
        assert_eq!(index.take_dirty_ids(), vec![id]);
        assert!(index.take_dirty_ids().is_empty());

        // Same path, new thread: updated.
        index.ensure(&key(&[1, 2], 9, 0));
        assert_eq!(index.take_dirty_ids(), vec![id]);
    }

    #[test]
    fn values_aggregate_and_seal_chunks() {
        let mut index = ElemIndex::default();
        let id = index.ensure(&key(&[1, 2], 0, 0));

        let mut sealed_qty = 0;
        for i in 0..1000u64 {
            let v = (i as f64) - 500.0;
            if let Some(body) = index.push_value(id, i as u32, i * 10, v) {
                assert!(!body.is_empty());
                assert_eq!(body.len() % 4, 0);
                sealed_qty += 1;
            }
        }

        // 5 words per entry, 2048-word chunks: 409 entries per chunk.
        assert_eq!(sealed_qty, 1000 / 409);

        let elem = index.get(id);
        assert_eq!(elem.abs_y_min, -500.0);
        assert_eq!(elem.abs_y_max, 499.0);
        assert_eq!(elem.last_time_ns, 9990);
        assert!(elem.has_pending_chunk());
    }

    #[test]
    fn partial_hash_excludes_thread_step() {
        let mut index = ElemIndex::default();

        let id_a = index.ensure(&key(&[111, 5, 6], 0, 0));
        let id_b = index.ensure(&key(&[222, 5, 6], 1, 0));

        let (a, b) = (index.get(id_a), index.get(id_b));
        assert_ne!(a.hash_path, b.hash_path);
        assert_eq!(a.partial_hash_path, b.partial_hash_path);
    }
}
