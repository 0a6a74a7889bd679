// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-thread build state.
//!
//! The recorder thread owns one [ThreadBuild] per source thread. Each keeps
//! the open-scope nesting stack, one [NestingLevelBuild] per depth with its
//! chunk streams and scope pyramid, per-kind event counters, running memory
//! totals, two short-date resolvers, the memory snapshot schedule, and the
//! lock-wait state.
//!
//! These types hold no I/O: chunk streams buffer [Evt] entries and hand
//! sealed bodies back to [crate::recording], which writes them and records
//! the locations.

use crate::{
    consts::{CHUNK_SIZE, INVALID_IDX, MEMORY_SNAPSHOT_EVENT_INTERVAL},
    hashing,
    pyramid::ScopePyramid,
    record::{encode_events, ChunkLoc, Evt},
    shortdate::ShortDateResolver,
};

/// An in-RAM buffer of events for one named stream, sealed into chunk
/// bodies every [CHUNK_SIZE] entries.
#[derive(Default)]
pub struct ChunkStream {
    events: Vec<Evt>,
    entry_qty: u64,
    pub locs: Vec<ChunkLoc>,
}

impl ChunkStream {
    /// Append one event; returns a sealed chunk body when the buffer
    /// reached [CHUNK_SIZE].
    pub fn push(&mut self, evt: Evt) -> Option<Vec<u8>> {
        self.events.push(evt);
        self.entry_qty += 1;

        if self.events.len() == CHUNK_SIZE {
            Some(self.seal())
        } else {
            None
        }
    }

    /// Drain whatever is buffered into a chunk body.
    pub fn seal(&mut self) -> Vec<u8> {
        let body = encode_events(&self.events);
        self.events.clear();
        body
    }

    pub fn has_pending(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn is_unused(&self) -> bool {
        self.entry_qty == 0
    }

    /// Stream-local index of the most recently pushed entry.
    pub fn last_lidx(&self) -> u32 {
        debug_assert!(self.entry_qty > 0);
        (self.entry_qty - 1) as u32
    }
}

/// Build state of one (thread, nesting level) pair.
#[derive(Default)]
pub struct NestingLevelBuild {
    pub scope: ChunkStream,
    pub non_scope: ChunkStream,
    pub pyramid: ScopePyramid,

    /// Chained path hash up to and including this level's scope name.
    pub hash_path: u64,
    /// Start of the currently open scope at this level.
    pub scope_start_ns: u64,
    pub scope_name_idx: u32,
    pub scope_name_hash: u64,
    pub scope_line_nbr: u16,
    pub scope_flags: u8,
    pub is_scope_open: bool,
    /// Elem id of the scope currently open at this level.
    pub elem_idx: u32,
}

/// One live allocation, attributed on dealloc.
#[derive(Clone, Copy, Debug)]
pub struct VMemAlloc {
    pub thread_id: u16,
    pub size: u32,
    /// Index of the alloc event in the thread's alloc stream.
    pub m_idx: u32,
    /// Slot in the thread's live-allocation set.
    pub slot: u32,
}

/// Per-source-thread build state.
pub struct ThreadBuild {
    pub thread_id: u16,
    pub stream_id: u8,
    pub thread_hash: u64,
    /// Equal to `thread_hash` until the thread is named.
    pub thread_unique_hash: u64,
    pub name_idx: u32,

    pub cur_level: usize,
    /// Depth of scope begins refused past the level cap, so their matching
    /// ends are also dropped.
    pub overflow_depth: usize,
    pub last_time_ns: u64,

    // Per-kind counters, surfaced through the delta view.
    pub elem_event_qty: u32,
    pub mem_event_qty: u32,
    pub ctx_switch_event_qty: u32,
    pub lock_event_qty: u32,
    pub marker_event_qty: u32,
    pub dropped_event_qty: u32,

    pub date_resolver: ShortDateResolver,
    pub date_resolver_cswitch: ShortDateResolver,

    // Running memory totals.
    pub sum_alloc_qty: u64,
    pub sum_alloc_size: u64,
    pub sum_dealloc_qty: u64,
    pub sum_dealloc_size: u64,

    // Live-allocation set: slots hold alloc stream indices.
    pub mem_ss_current_alloc: Vec<u32>,
    pub mem_ss_empty_slots: Vec<u32>,
    pub mem_events_before_snapshot: u32,
    /// Location of each written snapshot block; the snapshot time sits in
    /// the block body.
    pub mem_snapshot_locs: Vec<ChunkLoc>,

    // Lock-wait state.
    pub lock_wait_currently_waiting: bool,
    pub lock_wait_begin_ns: u64,
    pub lock_wait_name_idx: u32,

    pub mem_alloc: ChunkStream,
    pub mem_dealloc: ChunkStream,
    pub mem_plot: ChunkStream,
    pub ctx_switch: ChunkStream,
    pub soft_irq: ChunkStream,
    pub lock_wait: ChunkStream,

    pub levels: Vec<NestingLevelBuild>,
    /// Running elem path: thread step, then one step per open scope.
    pub path_stack: Vec<u64>,
}

impl ThreadBuild {
    pub fn new(thread_id: u16, stream_id: u8, date_wrap_bits: u32) -> Self {
        let thread_hash = hashing::hash_u64(((stream_id as u64) << 16) | thread_id as u64);

        Self {
            thread_id,
            stream_id,
            thread_hash,
            thread_unique_hash: thread_hash,
            name_idx: INVALID_IDX,
            cur_level: 0,
            overflow_depth: 0,
            last_time_ns: 0,
            elem_event_qty: 0,
            mem_event_qty: 0,
            ctx_switch_event_qty: 0,
            lock_event_qty: 0,
            marker_event_qty: 0,
            dropped_event_qty: 0,
            date_resolver: ShortDateResolver::new(date_wrap_bits, true),
            date_resolver_cswitch: ShortDateResolver::new(date_wrap_bits, false),
            sum_alloc_qty: 0,
            sum_alloc_size: 0,
            sum_dealloc_qty: 0,
            sum_dealloc_size: 0,
            mem_ss_current_alloc: Vec::new(),
            mem_ss_empty_slots: Vec::new(),
            mem_events_before_snapshot: MEMORY_SNAPSHOT_EVENT_INTERVAL,
            mem_snapshot_locs: Vec::new(),
            lock_wait_currently_waiting: false,
            lock_wait_begin_ns: 0,
            lock_wait_name_idx: INVALID_IDX,
            mem_alloc: ChunkStream::default(),
            mem_dealloc: ChunkStream::default(),
            mem_plot: ChunkStream::default(),
            ctx_switch: ChunkStream::default(),
            soft_irq: ChunkStream::default(),
            lock_wait: ChunkStream::default(),
            levels: Vec::new(),
            path_stack: vec![thread_hash],
        }
    }

    pub fn level_mut(&mut self, level: usize) -> &mut NestingLevelBuild {
        while self.levels.len() <= level {
            self.levels.push(NestingLevelBuild::default());
        }
        &mut self.levels[level]
    }

    /// Claim a live-allocation slot for an alloc event.
    pub fn live_alloc_add(&mut self, m_idx: u32) -> u32 {
        if let Some(slot) = self.mem_ss_empty_slots.pop() {
            self.mem_ss_current_alloc[slot as usize] = m_idx;
            slot
        } else {
            self.mem_ss_current_alloc.push(m_idx);
            (self.mem_ss_current_alloc.len() - 1) as u32
        }
    }

    pub fn live_alloc_remove(&mut self, slot: u32) {
        self.mem_ss_current_alloc[slot as usize] = INVALID_IDX;
        self.mem_ss_empty_slots.push(slot);
    }

    /// The live allocation set, compacted, as a snapshot block body.
    pub fn encode_snapshot(&self, time_ns: u64) -> Vec<u8> {
        let live = self
            .mem_ss_current_alloc
            .iter()
            .filter(|m| **m != INVALID_IDX)
            .collect::<Vec<_>>();

        let mut body = Vec::with_capacity(12 + live.len() * 4);
        body.extend(time_ns.to_le_bytes());
        body.extend((live.len() as u32).to_le_bytes());
        for m in live {
            body.extend(m.to_le_bytes());
        }
        body
    }

    /// Serialize one thread-table row.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend(self.thread_hash.to_le_bytes());
        buf.extend(self.thread_unique_hash.to_le_bytes());
        buf.extend(self.thread_id.to_le_bytes());
        buf.push(self.stream_id);
        buf.push(self.levels.len() as u8);
        buf.extend(self.name_idx.to_le_bytes());
        buf.extend(self.elem_event_qty.to_le_bytes());
        buf.extend(self.mem_event_qty.to_le_bytes());
        buf.extend(self.ctx_switch_event_qty.to_le_bytes());
        buf.extend(self.lock_event_qty.to_le_bytes());
        buf.extend(self.marker_event_qty.to_le_bytes());
        buf.extend(self.dropped_event_qty.to_le_bytes());
        buf.extend(self.sum_alloc_qty.to_le_bytes());
        buf.extend(self.sum_alloc_size.to_le_bytes());
        buf.extend(self.sum_dealloc_qty.to_le_bytes());
        buf.extend(self.sum_dealloc_size.to_le_bytes());
        buf.extend(self.last_time_ns.to_le_bytes());
    }
}

/// Build state of one lock, identified by its name.
pub struct LockBuild {
    pub name_idx: u32,
    pub is_in_use: bool,
    pub using_start_thread_id: u16,
    pub using_start_time_ns: u64,
    pub waiting_thread_ids: Vec<u16>,
}

impl LockBuild {
    pub fn new(name_idx: u32) -> Self {
        Self {
            name_idx,
            is_in_use: false,
            using_start_thread_id: 0,
            using_start_time_ns: 0,
            waiting_thread_ids: Vec::new(),
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend(self.name_idx.to_le_bytes());
        buf.push(self.is_in_use as u8);
        buf.extend([0u8; 3]);
        buf.extend((self.waiting_thread_ids.len() as u32).to_le_bytes());
        for t in &self.waiting_thread_ids {
            buf.extend(t.to_le_bytes());
        }
    }
}

/// The session-global chunk streams.
#[derive(Default)]
pub struct GlobalStreams {
    pub lock_use: ChunkStream,
    pub lock_ntf: ChunkStream,
    pub core_usage: ChunkStream,
    pub marker: ChunkStream,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chunk_stream_seals_at_chunk_size() {
        let mut s = ChunkStream::default();

        let mut sealed = None;
        for i in 0..CHUNK_SIZE {
            let evt = Evt {
                time_ns: i as u64,
                ..Default::default()
            };
            let r = s.push(evt);
            if i < CHUNK_SIZE - 1 {
                assert!(r.is_none());
            } else {
                sealed = r;
            }
        }

        let body = sealed.expect("chunk must seal at capacity");
        assert_eq!(body.len(), CHUNK_SIZE * Evt::SIZE);
        assert!(!s.has_pending());
        assert_eq!(s.last_lidx(), (CHUNK_SIZE - 1) as u32);

        s.push(Evt::default());
        assert_eq!(s.last_lidx(), CHUNK_SIZE as u32);
        assert!(s.has_pending());
    }

    #[test]
    fn live_alloc_slots_recycle() {
        let mut t = ThreadBuild::new(0, 0, 32);

        let s1 = t.live_alloc_add(100);
        let s2 = t.live_alloc_add(200);
        assert_ne!(s1, s2);

        t.live_alloc_remove(s1);
        let s3 = t.live_alloc_add(300);
        assert_eq!(s3, s1);

        let body = t.encode_snapshot(999);
        // time + qty + two live entries.
        assert_eq!(body.len(), 8 + 4 + 2 * 4);
        let qty = u32::from_le_bytes(body[8..12].try_into().unwrap());
        assert_eq!(qty, 2);
    }

    #[test]
    fn levels_grow_on_demand() {
        let mut t = ThreadBuild::new(3, 0, 32);
        assert!(t.levels.is_empty());

        t.level_mut(2).is_scope_open = true;
        assert_eq!(t.levels.len(), 3);
        assert!(t.levels[2].is_scope_open);
    }
}
