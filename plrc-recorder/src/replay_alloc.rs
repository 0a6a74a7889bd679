// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Virtual heap replay.
//!
//! To visualize fragmentation, the viewer replays a session's alloc/free
//! events through a deterministic model of the target's heap (in the style
//! of Doug Lea's malloc): size-classed free bins, a wilderness tail, and
//! eager coalescing of neighbors on free.
//!
//! Chunks live in an arena indexed by `u32`; the address-order list and the
//! per-bin free lists are intrusive index chains. Bins 0..=64 cover sizes
//! `0, 8, .., 512` in 8-byte steps; bins 65..=127 grow geometrically
//! (ratio 1.331) up to the 2^31 range.
//!
//! Invariants after every operation: addresses strictly increase along the
//! address-order list, no two adjacent chunks are both FREE, every FREE
//! chunk sits in exactly one bin list, and the pointer index contains
//! exactly the USED chunks.

use crate::consts::INVALID_IDX;
use crate::lookup::Lookup;
use crate::record::Evt;
use crate::wire::EventKind;
use log::warn;
use rustc_hash::FxHashMap;

const SIZE_MIN: u32 = 1;
const BIN_QTY: usize = 128;
const HIGH_BIN_QTY: usize = 63;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ChunkState {
    Empty,
    Free,
    Used,
}

#[derive(Clone, Copy, Debug)]
struct Chunk {
    state: ChunkState,
    v_ptr: u32,
    size: u32,
    /// Address-order neighbors.
    prev_cidx: u32,
    next_cidx: u32,
    bin_nbr: usize,
    /// Bin free-list neighbors.
    bin_prev_cidx: u32,
    bin_next_cidx: u32,
}

impl Chunk {
    fn empty() -> Self {
        Self {
            state: ChunkState::Empty,
            v_ptr: 0,
            size: 0,
            prev_cidx: INVALID_IDX,
            next_cidx: INVALID_IDX,
            bin_nbr: 0,
            bin_prev_cidx: INVALID_IDX,
            bin_next_cidx: INVALID_IDX,
        }
    }
}

/// Tallies of one [ReplayAlloc::replay] run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReplayStats {
    pub alloc_qty: u64,
    pub dealloc_qty: u64,
    pub unknown_dealloc_qty: u64,
    pub failed_alloc_qty: u64,
}

pub struct ReplayAlloc {
    chunks: Vec<Chunk>,
    empty_indexes: Vec<u32>,
    lkup_ptr_to_used_cidx: Lookup<u32, u32>,
    wilderness_start: u32,
    last_cidx: u32,
    bins: [u32; BIN_QTY],
    high_bin_sizes: [u32; HIGH_BIN_QTY],
}

impl Default for ReplayAlloc {
    fn default() -> Self {
        // Geometric bin boundaries above 512: increments grow by 1.331 per
        // bin, which spans the 2^31 range in 63 bins.
        let mut high_bin_sizes = [0u32; HIGH_BIN_QTY];
        let mut value = 512.0f64;
        let mut incr = 8.0f64;
        for s in high_bin_sizes.iter_mut() {
            incr *= 1.331;
            value += incr;
            *s = value as u32;
        }

        Self {
            chunks: Vec::with_capacity(1024),
            empty_indexes: Vec::with_capacity(1024),
            lkup_ptr_to_used_cidx: Lookup::with_capacity(16),
            wilderness_start: 0,
            last_cidx: INVALID_IDX,
            bins: [INVALID_IDX; BIN_QTY],
            high_bin_sizes,
        }
    }
}

impl ReplayAlloc {
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.empty_indexes.clear();
        self.lkup_ptr_to_used_cidx.clear();
        self.wilderness_start = 0;
        self.last_cidx = INVALID_IDX;
        self.bins = [INVALID_IDX; BIN_QTY];
    }

    /// The uncarved tail of the virtual address space.
    pub fn wilderness_start(&self) -> u32 {
        self.wilderness_start
    }

    /// Floor rule: the bin whose limit is just below the chunk size.
    fn bin_for_chunk(&self, size: u32) -> usize {
        if size <= 512 {
            return (size / 8) as usize;
        }

        let mut bin = 0;
        while bin < HIGH_BIN_QTY - 1 && self.high_bin_sizes[bin] <= size {
            bin += 1;
        }
        65 + bin - 1
    }

    /// Ceiling rule: the first bin whose limit can hold the request.
    fn bin_for_request(&self, size: u32) -> usize {
        if size <= 512 {
            return ((size + 7) / 8) as usize;
        }

        let mut bin = 0;
        while bin < HIGH_BIN_QTY - 1 && self.high_bin_sizes[bin] < size {
            bin += 1;
        }
        65 + bin
    }

    fn take_empty_slot(&mut self) -> u32 {
        if let Some(idx) = self.empty_indexes.pop() {
            idx
        } else {
            self.chunks.push(Chunk::empty());
            (self.chunks.len() - 1) as u32
        }
    }

    fn bin_unlink(&mut self, cidx: u32) {
        let c = self.chunks[cidx as usize];
        if c.bin_prev_cidx == INVALID_IDX {
            self.bins[c.bin_nbr] = c.bin_next_cidx;
        } else {
            self.chunks[c.bin_prev_cidx as usize].bin_next_cidx = c.bin_next_cidx;
        }
        if c.bin_next_cidx != INVALID_IDX {
            self.chunks[c.bin_next_cidx as usize].bin_prev_cidx = c.bin_prev_cidx;
        }
        let c = &mut self.chunks[cidx as usize];
        c.bin_prev_cidx = INVALID_IDX;
        c.bin_next_cidx = INVALID_IDX;
    }

    fn bin_insert_head(&mut self, cidx: u32, bin: usize) {
        let head = self.bins[bin];
        {
            let c = &mut self.chunks[cidx as usize];
            c.bin_nbr = bin;
            c.bin_prev_cidx = INVALID_IDX;
            c.bin_next_cidx = head;
        }
        if head != INVALID_IDX {
            self.chunks[head as usize].bin_prev_cidx = cidx;
        }
        self.bins[bin] = cidx;
    }

    /// Replay one allocation; returns the virtual pointer, or [None] when
    /// the request exceeds the remaining 32-bit wilderness.
    pub fn malloc(&mut self, size: u32) -> Option<u32> {
        let size = size.max(SIZE_MIN);

        // Best fit: first non-empty bin at or above the request class.
        let mut bin = self.bin_for_request(size);
        while bin < BIN_QTY && self.bins[bin] == INVALID_IDX {
            bin += 1;
        }

        // No suitable free chunk: carve the wilderness.
        if bin == BIN_QTY {
            if u32::MAX - self.wilderness_start < size {
                return None;
            }

            let nidx = self.take_empty_slot();
            let v_ptr = self.wilderness_start;
            self.chunks[nidx as usize] = Chunk {
                state: ChunkState::Used,
                v_ptr,
                size,
                prev_cidx: self.last_cidx,
                next_cidx: INVALID_IDX,
                bin_nbr: self.bin_for_chunk(size),
                bin_prev_cidx: INVALID_IDX,
                bin_next_cidx: INVALID_IDX,
            };
            if self.last_cidx != INVALID_IDX {
                self.chunks[self.last_cidx as usize].next_cidx = nidx;
            }
            self.wilderness_start += size;
            self.last_cidx = nidx;
            self.lkup_ptr_to_used_cidx.insert(v_ptr, nidx);

            return Some(v_ptr);
        }

        let cidx = self.bins[bin];
        debug_assert_eq!(self.chunks[cidx as usize].state, ChunkState::Free);
        debug_assert!(self.chunks[cidx as usize].size >= size);

        // Split off the tail when the free chunk is larger than requested.
        if self.chunks[cidx as usize].size > size {
            let nidx = self.take_empty_slot();
            let c = self.chunks[cidx as usize];

            let new_bin = self.bin_for_chunk(c.size - size);
            self.chunks[nidx as usize] = Chunk {
                state: ChunkState::Free,
                v_ptr: c.v_ptr + size,
                size: c.size - size,
                prev_cidx: cidx,
                next_cidx: c.next_cidx,
                bin_nbr: new_bin,
                bin_prev_cidx: INVALID_IDX,
                bin_next_cidx: INVALID_IDX,
            };
            if c.next_cidx != INVALID_IDX {
                self.chunks[c.next_cidx as usize].prev_cidx = nidx;
            }
            if cidx == self.last_cidx {
                self.last_cidx = nidx;
            }
            self.bin_insert_head(nidx, new_bin);

            let c = &mut self.chunks[cidx as usize];
            c.next_cidx = nidx;
            c.size = size;
        }

        self.bin_unlink(cidx);

        let new_bin = self.bin_for_chunk(size);
        let c = &mut self.chunks[cidx as usize];
        c.state = ChunkState::Used;
        c.bin_nbr = new_bin;
        let v_ptr = c.v_ptr;
        self.lkup_ptr_to_used_cidx.insert(v_ptr, cidx);

        Some(v_ptr)
    }

    /// Replay one deallocation; false when the pointer has no live
    /// allocation (the caller counts it).
    pub fn free(&mut self, v_ptr: u32) -> bool {
        let cidx = match self.lkup_ptr_to_used_cidx.find(v_ptr) {
            Some(idx) => *idx,
            None => return false,
        };
        self.lkup_ptr_to_used_cidx.erase(v_ptr);

        debug_assert_eq!(self.chunks[cidx as usize].state, ChunkState::Used);
        self.chunks[cidx as usize].state = ChunkState::Free;

        // Merge with the address-order predecessor, if free.
        let prev_cidx = self.chunks[cidx as usize].prev_cidx;
        if prev_cidx != INVALID_IDX
            && self.chunks[prev_cidx as usize].state == ChunkState::Free
        {
            self.bin_unlink(prev_cidx);

            let cp = self.chunks[prev_cidx as usize];
            debug_assert_eq!(cp.next_cidx, cidx);
            debug_assert_eq!(self.chunks[cidx as usize].v_ptr, cp.v_ptr + cp.size);

            self.chunks[prev_cidx as usize].state = ChunkState::Empty;
            self.empty_indexes.push(prev_cidx);

            let c = &mut self.chunks[cidx as usize];
            c.v_ptr = cp.v_ptr;
            c.size += cp.size;
            c.prev_cidx = cp.prev_cidx;
            if cp.prev_cidx != INVALID_IDX {
                self.chunks[cp.prev_cidx as usize].next_cidx = cidx;
            }
        }

        // Merge with the address-order successor, if free.
        let next_cidx = self.chunks[cidx as usize].next_cidx;
        if next_cidx != INVALID_IDX
            && self.chunks[next_cidx as usize].state == ChunkState::Free
        {
            self.bin_unlink(next_cidx);

            let cn = self.chunks[next_cidx as usize];
            debug_assert_eq!(cn.prev_cidx, cidx);

            if next_cidx == self.last_cidx {
                self.last_cidx = cidx;
            }
            self.chunks[next_cidx as usize].state = ChunkState::Empty;
            self.empty_indexes.push(next_cidx);

            let c = &mut self.chunks[cidx as usize];
            c.size += cn.size;
            c.next_cidx = cn.next_cidx;
            if cn.next_cidx != INVALID_IDX {
                self.chunks[cn.next_cidx as usize].prev_cidx = cidx;
            }
        }

        let bin = self.bin_for_chunk(self.chunks[cidx as usize].size);
        self.bin_insert_head(cidx, bin);

        true
    }

    /// Drive the model from recorded memory events, mapping the target
    /// program's pointers to virtual ones.
    ///
    /// `events` is the time-merged content of a thread's alloc and dealloc
    /// streams, as read back from a record file. Non-memory kinds are
    /// ignored.
    pub fn replay(&mut self, events: &[Evt]) -> ReplayStats {
        let mut stats = ReplayStats::default();
        let mut target_to_virtual = FxHashMap::default();

        for evt in events {
            match EventKind::try_from(evt.kind) {
                Ok(EventKind::MemAlloc) => match self.malloc(evt.value) {
                    Some(v_ptr) => {
                        stats.alloc_qty += 1;
                        target_to_virtual.insert(evt.payload, v_ptr);
                    }
                    None => {
                        warn!("virtual space exhausted replaying alloc of {}", evt.value);
                        stats.failed_alloc_qty += 1;
                    }
                },
                Ok(EventKind::MemDealloc) => match target_to_virtual.remove(&evt.payload) {
                    Some(v_ptr) if self.free(v_ptr) => stats.dealloc_qty += 1,
                    _ => stats.unknown_dealloc_qty += 1,
                },
                _ => {}
            }
        }

        stats
    }

    /// Walk the address-order list: (vPtr, size, is_used) triples.
    pub fn layout(&self) -> Vec<(u32, u32, bool)> {
        let mut out = Vec::new();

        // Find the head: the chunk with no predecessor.
        let mut head = INVALID_IDX;
        for (i, c) in self.chunks.iter().enumerate() {
            if c.state != ChunkState::Empty && c.prev_cidx == INVALID_IDX {
                head = i as u32;
                break;
            }
        }

        let mut cur = head;
        while cur != INVALID_IDX {
            let c = &self.chunks[cur as usize];
            out.push((c.v_ptr, c.size, c.state == ChunkState::Used));
            cur = c.next_cidx;
        }

        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Check the §invariants of the allocator arena.
    fn check_invariants(a: &ReplayAlloc) {
        let layout = a.layout();

        // Addresses strictly increase and tile without overlap.
        for w in layout.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0, "overlapping chunks");
            assert!(w[0].0 < w[1].0, "address order violated");
        }

        // No two adjacent FREE chunks.
        for w in layout.windows(2) {
            assert!(w[0].2 || w[1].2, "adjacent free chunks");
        }

        // Every FREE chunk is in exactly one bin list.
        let mut seen = std::collections::HashSet::new();
        for bin in 0..BIN_QTY {
            let mut cur = a.bins[bin];
            while cur != INVALID_IDX {
                let c = &a.chunks[cur as usize];
                assert_eq!(c.state, ChunkState::Free);
                assert_eq!(c.bin_nbr, bin);
                assert!(seen.insert(cur), "chunk in two bin lists");
                cur = c.bin_next_cidx;
            }
        }
        let free_qty = a
            .chunks
            .iter()
            .filter(|c| c.state == ChunkState::Free)
            .count();
        assert_eq!(seen.len(), free_qty);

        // The pointer index holds exactly the USED chunks.
        let used_qty = a
            .chunks
            .iter()
            .filter(|c| c.state == ChunkState::Used)
            .count();
        assert_eq!(a.lkup_ptr_to_used_cidx.len(), used_qty);
        a.lkup_ptr_to_used_cidx.for_each(|ptr, cidx| {
            let c = &a.chunks[*cidx as usize];
            assert_eq!(c.state, ChunkState::Used);
            assert_eq!(c.v_ptr, ptr);
        });
    }

    #[test]
    fn bin_schedule() {
        let a = ReplayAlloc::default();

        // Linear 8-byte bins up to 512.
        assert_eq!(a.bin_for_chunk(31), 3);
        assert_eq!(a.bin_for_request(31), 4);
        assert_eq!(a.bin_for_chunk(512), 64);
        assert_eq!(a.bin_for_request(512), 64);

        // Geometric bins above.
        assert_eq!(a.bin_for_request(513), 65);
        assert!(a.bin_for_chunk(513) >= 64);
        assert!(a.bin_for_request(1 << 30) < BIN_QTY);

        // Geometric sizes must cover the 2^31 range.
        assert!(a.high_bin_sizes[HIGH_BIN_QTY - 1] > (1u32 << 31) - 512);
    }

    #[test]
    fn freed_block_is_reused_best_fit() {
        let mut a = ReplayAlloc::default();

        let p1 = a.malloc(40).unwrap();
        let p2 = a.malloc(40).unwrap();
        assert_eq!(p1, 0);
        assert_eq!(p2, 40);

        assert!(a.free(p1));
        let p3 = a.malloc(40).unwrap();

        // Best fit from bin 5: the freed block, no fragmentation.
        assert_eq!(p3, p1);
        assert_eq!(a.wilderness_start(), 80);
        check_invariants(&a);
    }

    #[test]
    fn coalescing_merges_both_sides() {
        let mut a = ReplayAlloc::default();

        let pa = a.malloc(16).unwrap();
        let pb = a.malloc(16).unwrap();
        let pc = a.malloc(16).unwrap();
        assert_eq!((pa, pb, pc), (0, 16, 32));

        assert!(a.free(pa));
        assert!(a.free(pc));
        check_invariants(&a);
        assert!(a.free(pb));
        check_invariants(&a);

        // One FREE chunk of 48 bytes; the wilderness did not move.
        assert_eq!(a.layout(), vec![(0, 48, false)]);
        assert_eq!(a.wilderness_start(), 48);
    }

    #[test]
    fn split_leaves_trailing_free_chunk() {
        let mut a = ReplayAlloc::default();

        let p1 = a.malloc(100).unwrap();
        a.malloc(8).unwrap(); // Barrier against wilderness merge.
        assert!(a.free(p1));

        let p2 = a.malloc(40).unwrap();
        assert_eq!(p2, p1);

        // 60 bytes split off and re-binned.
        let layout = a.layout();
        assert_eq!(layout[0], (0, 40, true));
        assert_eq!(layout[1], (40, 60, false));
        check_invariants(&a);
    }

    #[test]
    fn unknown_free_is_reported() {
        let mut a = ReplayAlloc::default();
        a.malloc(32).unwrap();

        assert!(!a.free(9999));
        check_invariants(&a);
    }

    #[test]
    fn oversized_request_fails_cleanly() {
        let mut a = ReplayAlloc::default();
        let p = a.malloc(u32::MAX - 100).unwrap();
        assert_eq!(p, 0);

        assert!(a.malloc(1000).is_none());
        check_invariants(&a);
    }

    #[test]
    fn balanced_session_returns_to_reset_state() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut a = ReplayAlloc::default();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut live = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..4096);
                live.push(a.malloc(size).unwrap());
            } else {
                let i = rng.gen_range(0..live.len());
                assert!(a.free(live.swap_remove(i)));
            }
        }
        check_invariants(&a);

        let peak = a.wilderness_start();
        for p in live.drain(..) {
            assert!(a.free(p));
        }
        check_invariants(&a);

        // Everything free again: a single FREE chunk spanning the peak (or
        // nothing at all if nothing was ever allocated).
        assert_eq!(a.layout(), vec![(0, peak, false)]);
        assert_eq!(a.wilderness_start(), peak);
    }
}
