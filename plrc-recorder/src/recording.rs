// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Session recording.
//!
//! [Recording] owns every piece of build state for one session: the string
//! table, the thread and lock builders, the elem index, the global chunk
//! streams and the record writer. It consumes decoded string and event
//! batches (in arrival order, which the transport guarantees per source
//! thread), routes each event by kind, and incrementally writes sealed
//! chunks.
//!
//! [Recording::end] is the finalizer: it synthesizes ends for scopes left
//! open, flushes every stream, writes the tables and the directory, and
//! atomically publishes the record file.

use crate::{
    builder::{ChunkStream, GlobalStreams, LockBuild, ThreadBuild, VMemAlloc},
    consts::{
        CORE_USAGE_NAMEIDX, CTX_SWITCH_NAMEIDX, DELTARECORD_PERIOD_US, INVALID_IDX,
        LOCK_NTF_NAMEIDX, LOCK_USE_NAMEIDX, LOCK_WAIT_NAMEIDX, MARKER_NAMEIDX,
        MAX_LEVEL_QTY, MAX_STREAM_QTY, MAX_THREAD_QTY, MEMORY_ALLOCQTY_NAMEIDX,
        MEMORY_ALLOCSIZE_NAMEIDX, MEMORY_DEALLOCQTY_NAMEIDX,
        MEMORY_SNAPSHOT_EVENT_INTERVAL, SOFTIRQ_NAMEIDX,
    },
    delta::DeltaSnapshot,
    elem::{ElemIndex, ElemKey},
    error::{Error, Result, SessionErrorCounters, SessionErrorKind},
    hashing,
    lookup::Lookup,
    record::{BlockKind, ChunkLoc, Directory, Evt, RecordWriter, StreamId},
    session::SessionInfo,
    wire::{EventFlags, EventKind, RawEvent},
};
use bitflags::bitflags;
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};

bitflags! {
    /// Per-string-record flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct StringFlags: u8 {
        /// Interned from a hash-only announcement (external string table).
        const EXTERNAL = 0x01;
        /// Changed since the last delta snapshot.
        const DIRTY = 0x02;
    }
}

/// One interned string.
pub struct StringEntry {
    pub value: String,
    pub hash: u64,
    pub flags: StringFlags,
}

/// Wrap width of short dates, fixed by the wire encodings.
const SHORT_DATE_BITS: u32 = 32;

pub struct Recording {
    session: SessionInfo,
    writer: Option<RecordWriter>,
    record_path: PathBuf,

    // Strings.
    strings: Vec<StringEntry>,
    string_hash_to_idx: FxHashMap<u64, u32>,
    /// Per stream: wire string id (announcement order) to session index.
    stream_string_lkup: Vec<Vec<u32>>,
    new_string_ids: Vec<u32>,

    // Threads.
    threads: Vec<ThreadBuild>,
    stream_thread_lkup: FxHashMap<(u8, u16), u16>,
    name_updated_thread_ids: Vec<u16>,

    // Locks.
    locks: Vec<LockBuild>,
    lock_name_to_idx: FxHashMap<u32, u32>,
    new_lock_ids: Vec<u32>,

    elems: ElemIndex,
    global: GlobalStreams,

    /// Live allocations across all threads: virtual pointer to attribution.
    mem_alloc_lkup: Lookup<u64, VMemAlloc>,

    marker_category_name_idxs: Vec<u32>,

    errors: SessionErrorCounters,
    duration_ns: u64,
    is_date_short: bool,
}

impl Recording {
    /// Open the record file and set up the session build state.
    pub fn begin(storage_dir: &Path, record_name: &str, session: SessionInfo) -> Result<Self> {
        std::fs::create_dir_all(storage_dir)
            .map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        let record_path = storage_dir.join(format!("{}.plrc", record_name));
        let writer = RecordWriter::create(&record_path)?;

        info!(
            "recording session of '{}' into {}",
            session.app_name,
            record_path.display()
        );

        let is_date_short = session.is_date_short();

        let mut rec = Self {
            session,
            writer: Some(writer),
            record_path,
            strings: Vec::with_capacity(1024),
            string_hash_to_idx: FxHashMap::default(),
            stream_string_lkup: (0..MAX_STREAM_QTY).map(|_| Vec::new()).collect(),
            new_string_ids: Vec::new(),
            threads: Vec::new(),
            stream_thread_lkup: FxHashMap::default(),
            name_updated_thread_ids: Vec::new(),
            locks: Vec::new(),
            lock_name_to_idx: FxHashMap::default(),
            new_lock_ids: Vec::new(),
            elems: ElemIndex::default(),
            global: GlobalStreams::default(),
            mem_alloc_lkup: Lookup::with_capacity(4096),
            marker_category_name_idxs: Vec::new(),
            errors: SessionErrorCounters::default(),
            duration_ns: 0,
            is_date_short,
        };

        // The canonical empty string owns index 0.
        rec.intern(hashing::hash_string(b""), b"");

        Ok(rec)
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Where the finalized record will land.
    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    pub fn errors(&self) -> &SessionErrorCounters {
        &self.errors
    }

    pub fn count_error(&mut self, kind: SessionErrorKind) {
        self.errors.bump(kind);
    }

    pub fn string(&self, idx: u32) -> Option<&StringEntry> {
        self.strings.get(idx as usize)
    }

    pub fn thread_qty(&self) -> usize {
        self.threads.len()
    }

    pub fn elem_qty(&self) -> usize {
        self.elems.len()
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    fn intern(&mut self, hash: u64, value: &[u8]) -> u32 {
        let hash = if hash == 0 { 1 } else { hash };

        if let Some(idx) = self.string_hash_to_idx.get(&hash) {
            // Repeated announcements are silently ignored.
            return *idx;
        }

        let idx = self.strings.len() as u32;
        let (value, flags) = if value.is_empty() && idx != 0 {
            // Hash-only announcement: external string table.
            (
                format!("@{:016x}", hash),
                StringFlags::EXTERNAL | StringFlags::DIRTY,
            )
        } else {
            (
                String::from_utf8_lossy(value).into_owned(),
                StringFlags::DIRTY,
            )
        };

        self.strings.push(StringEntry { value, hash, flags });
        self.string_hash_to_idx.insert(hash, idx);
        self.new_string_ids.push(idx);

        idx
    }

    /// Store one announced string and map its stream-local id.
    pub fn store_new_string(&mut self, stream_id: u8, hash: u64, value: &[u8]) -> u32 {
        let idx = self.intern(hash, value);
        self.stream_string_lkup[stream_id as usize % MAX_STREAM_QTY].push(idx);
        idx
    }

    /// Resolve a wire name index to a session string index.
    ///
    /// An index never announced interns a placeholder: late or lost STRING
    /// frames must not lose events.
    fn resolve_name(&mut self, stream_id: u8, wire_idx: u16) -> u32 {
        let lkup = &self.stream_string_lkup[stream_id as usize % MAX_STREAM_QTY];
        if let Some(idx) = lkup.get(wire_idx as usize) {
            return *idx;
        }

        warn!(
            "event names string {} of stream {} before its announcement",
            wire_idx, stream_id
        );
        let hash = hashing::hash_u64(0x8000_0000_0000_0000 | wire_idx as u64);
        self.intern(hash, format!("@unannounced-{}", wire_idx).as_bytes())
    }

    fn name_hash(&self, name_idx: u32) -> u64 {
        if name_idx & 0x7000_0000 == 0x7000_0000 {
            hashing::hash_u64(name_idx as u64)
        } else {
            self.strings[name_idx as usize].hash
        }
    }

    // ------------------------------------------------------------------
    // Event routing
    // ------------------------------------------------------------------

    fn thread_index(&mut self, stream_id: u8, wire_thread: u16) -> Option<usize> {
        if let Some(idx) = self.stream_thread_lkup.get(&(stream_id, wire_thread)) {
            return Some(*idx as usize);
        }

        if self.threads.len() >= MAX_THREAD_QTY {
            self.errors.bump(SessionErrorKind::TooManyThreads);
            return None;
        }

        let idx = self.threads.len() as u16;
        self.threads
            .push(ThreadBuild::new(idx, stream_id, SHORT_DATE_BITS));
        self.stream_thread_lkup.insert((stream_id, wire_thread), idx);
        debug!("thread {} appeared on stream {}", wire_thread, stream_id);

        Some(idx as usize)
    }

    fn time_ns(&self, tick: u64) -> u64 {
        let delta = tick.saturating_sub(self.session.tick_origin);
        (delta as f64 * self.session.tick_to_ns) as u64
    }

    /// Ingest one decoded event buffer.
    pub fn store_new_events(
        &mut self,
        stream_id: u8,
        buffer_id: u32,
        sync_tick: Option<u64>,
        events: &[RawEvent],
    ) -> Result<()> {
        for ev in events {
            let kind = match ev.kind() {
                Ok(kind) => kind,
                Err(e) => {
                    self.errors.bump(e);
                    continue;
                }
            };

            let tidx = match self.thread_index(stream_id, ev.thread_id) {
                Some(idx) => idx,
                None => continue,
            };

            // Context-switch family dates resolve against their own state.
            let tick = if self.is_date_short {
                let t = &mut self.threads[tidx];
                let resolver = match kind {
                    EventKind::CtxSwitch | EventKind::CoreUsage | EventKind::SoftIrq => {
                        &mut t.date_resolver_cswitch
                    }
                    _ => &mut t.date_resolver,
                };
                resolver.resolve(ev.tick, buffer_id, sync_tick)
            } else {
                ev.tick
            };
            let time_ns = self.time_ns(tick);

            {
                let t = &mut self.threads[tidx];
                t.last_time_ns = t.last_time_ns.max(time_ns);
            }
            self.duration_ns = self.duration_ns.max(time_ns);

            match kind {
                EventKind::ScopeBegin => self.process_scope_begin(tidx, ev, time_ns)?,
                EventKind::ScopeEnd => self.process_scope_end(tidx, time_ns, 0)?,
                EventKind::MemAlloc | EventKind::MemDealloc | EventKind::MemPlot => {
                    self.process_memory_event(tidx, kind, ev, time_ns)?
                }
                EventKind::CtxSwitch => self.process_ctx_switch(tidx, ev, time_ns)?,
                EventKind::CoreUsage => self.process_core_usage(tidx, ev, time_ns)?,
                EventKind::SoftIrq => self.process_soft_irq(tidx, ev, time_ns)?,
                EventKind::LockWaitBegin => self.process_lock_wait_begin(tidx, ev, time_ns),
                EventKind::LockWaitEnd => self.process_lock_wait_end(tidx, time_ns)?,
                EventKind::LockUse => self.process_lock_use(tidx, ev, time_ns)?,
                EventKind::LockNotify => self.process_lock_notify(tidx, ev, time_ns)?,
                EventKind::Marker => self.process_marker(tidx, ev, time_ns)?,
                EventKind::Plot => self.process_plot(tidx, ev, time_ns)?,
                EventKind::ThreadName => self.process_thread_name(tidx, ev),
            }
        }

        Ok(())
    }

    fn write_block(&mut self, kind: BlockKind, body: &[u8]) -> Result<ChunkLoc> {
        self.writer
            .as_mut()
            .ok_or(Error::NotRecording)?
            .write_block(kind, body)
    }

    /// Ensure-and-observe one elem value; writes the sealed chunk if the
    /// elem's buffer filled up.
    #[allow(clippy::too_many_arguments)]
    fn observe_elem(
        &mut self,
        path_steps: &[u64],
        is_thread_hashed: bool,
        thread_id: u16,
        level: u8,
        name_idx: u32,
        hl_name_idx: u32,
        prev_elem_idx: u32,
        flags: u8,
        do_represent_scope: bool,
        lidx: u32,
        time_ns: u64,
        value: f64,
    ) -> Result<u32> {
        let idx = self.elems.ensure(&ElemKey {
            path_steps,
            is_thread_hashed,
            thread_id,
            nesting_level: level,
            name_idx,
            hl_name_idx,
            prev_elem_idx,
            flags,
            do_represent_scope,
        });

        if let Some(body) = self.elems.push_value(idx, lidx, time_ns, value) {
            let loc = self.write_block(BlockKind::ElemChunk, &body)?;
            self.elems.push_chunk_loc(idx, loc);
        }

        Ok(idx)
    }

    /// Observe a per-thread synthetic counter elem (memory totals,
    /// context switches, soft IRQs).
    fn observe_builtin(
        &mut self,
        tidx: usize,
        builtin_name_idx: u32,
        lidx: u32,
        time_ns: u64,
        value: f64,
    ) -> Result<u32> {
        let t = &self.threads[tidx];
        let steps = [t.thread_hash, hashing::hash_u64(builtin_name_idx as u64)];
        let thread_id = t.thread_id;

        self.observe_elem(
            &steps,
            true,
            thread_id,
            0,
            builtin_name_idx,
            builtin_name_idx,
            INVALID_IDX,
            0,
            false,
            lidx,
            time_ns,
            value,
        )
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    fn process_scope_begin(&mut self, tidx: usize, ev: &RawEvent, time_ns: u64) -> Result<()> {
        let name_idx = self.resolve_name(self.threads[tidx].stream_id, ev.name_idx);
        let name_hash = self.name_hash(name_idx);

        let t = &mut self.threads[tidx];
        if t.overflow_depth > 0 || t.cur_level >= MAX_LEVEL_QTY {
            t.overflow_depth += 1;
            t.dropped_event_qty += 1;
            self.errors.bump(SessionErrorKind::UnbalancedScope);
            return Ok(());
        }

        let level = t.cur_level;
        let parent_path = if level == 0 {
            hashing::hash_chain_start(t.thread_hash)
        } else {
            t.levels[level - 1].hash_path
        };
        t.path_stack.push(name_hash);
        t.elem_event_qty += 1;

        let lvl = t.level_mut(level);
        lvl.hash_path = hashing::hash_step(name_hash, parent_path);
        lvl.scope_start_ns = time_ns;
        lvl.scope_name_idx = name_idx;
        lvl.scope_name_hash = name_hash;
        lvl.scope_line_nbr = ev.line_nbr;
        lvl.scope_flags = ev.flags;
        lvl.is_scope_open = true;
        t.cur_level += 1;

        // The scope's elem exists from its first begin so children can
        // link to it before the scope ever closes.
        let prev_elem_idx = if level == 0 {
            INVALID_IDX
        } else {
            self.threads[tidx].levels[level - 1].elem_idx
        };
        let t = &self.threads[tidx];
        let steps = t.path_stack.clone();
        let thread_id = t.thread_id;

        let elem_idx = self.elems.ensure(&ElemKey {
            path_steps: &steps,
            is_thread_hashed: true,
            thread_id,
            nesting_level: level as u8,
            name_idx,
            hl_name_idx: name_idx,
            prev_elem_idx,
            flags: ev.flags,
            do_represent_scope: true,
        });
        self.threads[tidx].level_mut(level).elem_idx = elem_idx;

        Ok(())
    }

    fn process_scope_end(&mut self, tidx: usize, time_ns: u64, flags: u8) -> Result<()> {
        {
            let t = &mut self.threads[tidx];
            if t.overflow_depth > 0 {
                t.overflow_depth -= 1;
                t.dropped_event_qty += 1;
                return Ok(());
            }
            if t.cur_level == 0 {
                self.errors.bump(SessionErrorKind::UnbalancedScope);
                t.dropped_event_qty += 1;
                return Ok(());
            }
        }

        let t = &mut self.threads[tidx];
        let level = t.cur_level - 1;
        let thread_id = t.thread_id;
        let lvl = &mut t.levels[level];

        let start_ns = lvl.scope_start_ns;
        let dur_ns = time_ns.saturating_sub(start_ns);
        let evt = Evt {
            thread_id,
            line_nbr: lvl.scope_line_nbr,
            kind: EventKind::ScopeBegin as u8,
            flags,
            level: level as u8,
            name_idx: lvl.scope_name_idx,
            value: 0,
            time_ns: start_ns,
            payload: dur_ns,
        };

        let elem_idx = lvl.elem_idx;
        let sealed = lvl.scope.push(evt);
        let lidx = lvl.scope.last_lidx();
        lvl.pyramid.push_scope(lidx, start_ns, dur_ns);
        lvl.is_scope_open = false;
        t.cur_level -= 1;
        t.path_stack.pop();
        t.elem_event_qty += 1;

        if let Some(body) = sealed {
            let loc = self.write_block(BlockKind::EventChunk, &body)?;
            self.threads[tidx].levels[level].scope.locs.push(loc);
        }

        if let Some(body) = self.elems.push_value(elem_idx, lidx, start_ns, dur_ns as f64) {
            let loc = self.write_block(BlockKind::ElemChunk, &body)?;
            self.elems.push_chunk_loc(elem_idx, loc);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    fn process_memory_event(
        &mut self,
        tidx: usize,
        kind: EventKind,
        ev: &RawEvent,
        time_ns: u64,
    ) -> Result<()> {
        let name_idx = self.resolve_name(self.threads[tidx].stream_id, ev.name_idx);
        let thread_id = self.threads[tidx].thread_id;

        match kind {
            EventKind::MemAlloc => {
                let size = ev.value;
                let t = &mut self.threads[tidx];
                t.sum_alloc_qty += 1;
                t.sum_alloc_size += size as u64;
                t.mem_event_qty += 1;

                let evt = Evt {
                    thread_id,
                    line_nbr: ev.line_nbr,
                    kind: kind as u8,
                    flags: ev.flags,
                    level: t.cur_level as u8,
                    name_idx,
                    value: size,
                    time_ns,
                    payload: ev.payload,
                };
                let sealed = t.mem_alloc.push(evt);
                let m_idx = t.mem_alloc.last_lidx();
                let slot = t.live_alloc_add(m_idx);
                self.mem_alloc_lkup.insert(
                    ev.payload,
                    VMemAlloc {
                        thread_id,
                        size,
                        m_idx,
                        slot,
                    },
                );
                if let Some(body) = sealed {
                    let loc = self.write_block(BlockKind::EventChunk, &body)?;
                    self.threads[tidx].mem_alloc.locs.push(loc);
                }

                let (used, qty, lidx) = {
                    let t = &self.threads[tidx];
                    (
                        t.sum_alloc_size - t.sum_dealloc_size,
                        t.sum_alloc_qty - t.sum_dealloc_qty,
                        m_idx,
                    )
                };
                self.observe_builtin(tidx, MEMORY_ALLOCSIZE_NAMEIDX, lidx, time_ns, used as f64)?;
                self.observe_builtin(tidx, MEMORY_ALLOCQTY_NAMEIDX, lidx, time_ns, qty as f64)?;
            }
            EventKind::MemDealloc => {
                let alloc = match self.mem_alloc_lkup.find(ev.payload) {
                    Some(a) => *a,
                    None => {
                        self.errors.bump(SessionErrorKind::UnknownDealloc);
                        self.threads[tidx].dropped_event_qty += 1;
                        return Ok(());
                    }
                };
                self.mem_alloc_lkup.erase(ev.payload);

                // Attribute the release to the allocating thread's totals.
                let owner_tidx = alloc.thread_id as usize;
                {
                    let t = &mut self.threads[owner_tidx];
                    t.sum_dealloc_qty += 1;
                    t.sum_dealloc_size += alloc.size as u64;
                    t.live_alloc_remove(alloc.slot);
                }

                let t = &mut self.threads[tidx];
                t.mem_event_qty += 1;
                let evt = Evt {
                    thread_id,
                    line_nbr: ev.line_nbr,
                    kind: kind as u8,
                    flags: ev.flags,
                    level: t.cur_level as u8,
                    name_idx,
                    value: alloc.size,
                    time_ns,
                    payload: ev.payload,
                };
                let sealed = t.mem_dealloc.push(evt);
                let lidx = t.mem_dealloc.last_lidx();
                if let Some(body) = sealed {
                    let loc = self.write_block(BlockKind::EventChunk, &body)?;
                    self.threads[tidx].mem_dealloc.locs.push(loc);
                }

                let (used, qty) = {
                    let t = &self.threads[owner_tidx];
                    (
                        t.sum_alloc_size.saturating_sub(t.sum_dealloc_size),
                        t.sum_dealloc_qty,
                    )
                };
                self.observe_builtin(
                    owner_tidx,
                    MEMORY_ALLOCSIZE_NAMEIDX,
                    lidx,
                    time_ns,
                    used as f64,
                )?;
                self.observe_builtin(
                    owner_tidx,
                    MEMORY_DEALLOCQTY_NAMEIDX,
                    lidx,
                    time_ns,
                    qty as f64,
                )?;
            }
            EventKind::MemPlot => {
                let t = &mut self.threads[tidx];
                t.mem_event_qty += 1;
                let evt = Evt {
                    thread_id,
                    line_nbr: ev.line_nbr,
                    kind: kind as u8,
                    flags: ev.flags,
                    level: t.cur_level as u8,
                    name_idx,
                    value: ev.value,
                    time_ns,
                    payload: ev.payload,
                };
                let sealed = t.mem_plot.push(evt);
                let lidx = t.mem_plot.last_lidx();
                if let Some(body) = sealed {
                    let loc = self.write_block(BlockKind::EventChunk, &body)?;
                    self.threads[tidx].mem_plot.locs.push(loc);
                }

                let name_hash = self.name_hash(name_idx);
                let t = &self.threads[tidx];
                let steps = [t.thread_hash, name_hash];
                self.observe_elem(
                    &steps,
                    true,
                    thread_id,
                    0,
                    name_idx,
                    name_idx,
                    INVALID_IDX,
                    ev.flags,
                    false,
                    lidx,
                    time_ns,
                    ev.payload as f64,
                )?;
            }
            _ => unreachable!(),
        }

        self.maybe_snapshot_memory(tidx, time_ns)?;

        Ok(())
    }

    /// Write the live-allocation snapshot when the schedule elapses.
    fn maybe_snapshot_memory(&mut self, tidx: usize, time_ns: u64) -> Result<()> {
        let due = {
            let t = &mut self.threads[tidx];
            t.mem_events_before_snapshot -= 1;
            if t.mem_events_before_snapshot == 0 {
                t.mem_events_before_snapshot = MEMORY_SNAPSHOT_EVENT_INTERVAL;
                true
            } else {
                false
            }
        };

        if due {
            let body = self.threads[tidx].encode_snapshot(time_ns);
            let loc = self.write_block(BlockKind::MemSnapshot, &body)?;
            self.threads[tidx].mem_snapshot_locs.push(loc);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Context switches, core usage, soft IRQs
    // ------------------------------------------------------------------

    fn process_ctx_switch(&mut self, tidx: usize, ev: &RawEvent, time_ns: u64) -> Result<()> {
        let thread_id = self.threads[tidx].thread_id;
        let t = &mut self.threads[tidx];
        t.ctx_switch_event_qty += 1;

        let evt = Evt {
            thread_id,
            line_nbr: 0,
            kind: EventKind::CtxSwitch as u8,
            flags: ev.flags,
            level: 0,
            name_idx: CTX_SWITCH_NAMEIDX,
            value: ev.value,
            time_ns,
            payload: ev.payload,
        };
        let sealed = t.ctx_switch.push(evt);
        let lidx = t.ctx_switch.last_lidx();
        if let Some(body) = sealed {
            let loc = self.write_block(BlockKind::EventChunk, &body)?;
            self.threads[tidx].ctx_switch.locs.push(loc);
        }

        self.observe_builtin(tidx, CTX_SWITCH_NAMEIDX, lidx, time_ns, ev.value as f64)?;

        Ok(())
    }

    fn process_core_usage(&mut self, tidx: usize, ev: &RawEvent, time_ns: u64) -> Result<()> {
        self.threads[tidx].ctx_switch_event_qty += 1;
        let thread_id = self.threads[tidx].thread_id;

        let evt = Evt {
            thread_id,
            line_nbr: 0,
            kind: EventKind::CoreUsage as u8,
            flags: ev.flags,
            level: 0,
            name_idx: CORE_USAGE_NAMEIDX,
            value: ev.value,
            time_ns,
            payload: ev.payload,
        };
        let sealed = self.global.core_usage.push(evt);
        let lidx = self.global.core_usage.last_lidx();
        if let Some(body) = sealed {
            let loc = self.write_block(BlockKind::EventChunk, &body)?;
            self.global.core_usage.locs.push(loc);
        }

        // One session-wide curve of busy cores.
        let steps = [hashing::hash_u64(CORE_USAGE_NAMEIDX as u64)];
        self.observe_elem(
            &steps,
            false,
            thread_id,
            0,
            CORE_USAGE_NAMEIDX,
            CORE_USAGE_NAMEIDX,
            INVALID_IDX,
            0,
            false,
            lidx,
            time_ns,
            ev.value as f64,
        )?;

        Ok(())
    }

    fn process_soft_irq(&mut self, tidx: usize, ev: &RawEvent, time_ns: u64) -> Result<()> {
        let thread_id = self.threads[tidx].thread_id;
        let t = &mut self.threads[tidx];
        t.ctx_switch_event_qty += 1;

        let evt = Evt {
            thread_id,
            line_nbr: 0,
            kind: EventKind::SoftIrq as u8,
            flags: ev.flags,
            level: 0,
            name_idx: SOFTIRQ_NAMEIDX,
            value: ev.value,
            time_ns,
            payload: ev.payload,
        };
        let sealed = t.soft_irq.push(evt);
        let lidx = t.soft_irq.last_lidx();
        if let Some(body) = sealed {
            let loc = self.write_block(BlockKind::EventChunk, &body)?;
            self.threads[tidx].soft_irq.locs.push(loc);
        }

        self.observe_builtin(tidx, SOFTIRQ_NAMEIDX, lidx, time_ns, ev.payload as f64)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// A lock's identity is its name.
    fn lock_index(&mut self, name_idx: u32) -> u32 {
        if let Some(idx) = self.lock_name_to_idx.get(&name_idx) {
            return *idx;
        }

        let idx = self.locks.len() as u32;
        self.locks.push(LockBuild::new(name_idx));
        self.lock_name_to_idx.insert(name_idx, idx);
        self.new_lock_ids.push(idx);
        debug!("lock '{}' appeared", self.strings[name_idx as usize].value);

        idx
    }

    fn process_lock_wait_begin(&mut self, tidx: usize, ev: &RawEvent, time_ns: u64) {
        let name_idx = self.resolve_name(self.threads[tidx].stream_id, ev.name_idx);
        let lock_idx = self.lock_index(name_idx);
        let thread_id = self.threads[tidx].thread_id;

        let t = &mut self.threads[tidx];
        t.lock_event_qty += 1;
        t.lock_wait_currently_waiting = true;
        t.lock_wait_begin_ns = time_ns;
        t.lock_wait_name_idx = name_idx;

        let lock = &mut self.locks[lock_idx as usize];
        if !lock.waiting_thread_ids.contains(&thread_id) {
            lock.waiting_thread_ids.push(thread_id);
        }
    }

    fn process_lock_wait_end(&mut self, tidx: usize, time_ns: u64) -> Result<()> {
        let (waiting, begin_ns, name_idx, thread_id) = {
            let t = &self.threads[tidx];
            (
                t.lock_wait_currently_waiting,
                t.lock_wait_begin_ns,
                t.lock_wait_name_idx,
                t.thread_id,
            )
        };
        if !waiting {
            // A wait that began before the session; nothing to pair with.
            return Ok(());
        }

        let dur_ns = time_ns.saturating_sub(begin_ns);
        let lock_idx = self.lock_index(name_idx);
        self.locks[lock_idx as usize]
            .waiting_thread_ids
            .retain(|t| *t != thread_id);

        let t = &mut self.threads[tidx];
        t.lock_event_qty += 1;
        t.lock_wait_currently_waiting = false;

        let evt = Evt {
            thread_id,
            line_nbr: 0,
            kind: EventKind::LockWaitBegin as u8,
            flags: 0,
            level: t.cur_level as u8,
            name_idx,
            value: 0,
            time_ns: begin_ns,
            payload: dur_ns,
        };
        let sealed = t.lock_wait.push(evt);
        let lidx = t.lock_wait.last_lidx();
        if let Some(body) = sealed {
            let loc = self.write_block(BlockKind::EventChunk, &body)?;
            self.threads[tidx].lock_wait.locs.push(loc);
        }

        let name_hash = self.name_hash(name_idx);
        let t = &self.threads[tidx];
        let steps = [
            t.thread_hash,
            name_hash,
            hashing::hash_u64(LOCK_WAIT_NAMEIDX as u64),
        ];
        self.observe_elem(
            &steps,
            true,
            thread_id,
            0,
            name_idx,
            LOCK_WAIT_NAMEIDX,
            INVALID_IDX,
            0,
            false,
            lidx,
            begin_ns,
            dur_ns as f64,
        )?;

        Ok(())
    }

    fn process_lock_use(&mut self, tidx: usize, ev: &RawEvent, time_ns: u64) -> Result<()> {
        let is_acquire = ev.payload & 1 == 1;

        // Acquiring a lock ends any wait of the same thread: the client
        // only sends the use transition. Derived deterministically so
        // replay reproduces the stream bit for bit.
        if is_acquire && self.threads[tidx].lock_wait_currently_waiting {
            self.process_lock_wait_end(tidx, time_ns)?;
        }

        let name_idx = self.resolve_name(self.threads[tidx].stream_id, ev.name_idx);
        let lock_idx = self.lock_index(name_idx);
        let thread_id = self.threads[tidx].thread_id;
        self.threads[tidx].lock_event_qty += 1;

        let evt = Evt {
            thread_id,
            line_nbr: ev.line_nbr,
            kind: EventKind::LockUse as u8,
            flags: ev.flags,
            level: 0,
            name_idx,
            value: is_acquire as u32,
            time_ns,
            payload: ev.payload,
        };
        let sealed = self.global.lock_use.push(evt);
        let lidx = self.global.lock_use.last_lidx();
        if let Some(body) = sealed {
            let loc = self.write_block(BlockKind::EventChunk, &body)?;
            self.global.lock_use.locs.push(loc);
        }

        let lock = &mut self.locks[lock_idx as usize];
        if is_acquire {
            lock.is_in_use = true;
            lock.using_start_thread_id = thread_id;
            lock.using_start_time_ns = time_ns;
        } else if lock.is_in_use {
            let start_ns = lock.using_start_time_ns;
            let dur_ns = time_ns.saturating_sub(start_ns);
            lock.is_in_use = false;

            let name_hash = self.name_hash(name_idx);
            let steps = [name_hash, hashing::hash_u64(LOCK_USE_NAMEIDX as u64)];
            self.observe_elem(
                &steps,
                false,
                thread_id,
                0,
                name_idx,
                LOCK_USE_NAMEIDX,
                INVALID_IDX,
                0,
                false,
                lidx,
                start_ns,
                dur_ns as f64,
            )?;
        }

        Ok(())
    }

    fn process_lock_notify(&mut self, tidx: usize, ev: &RawEvent, time_ns: u64) -> Result<()> {
        let name_idx = self.resolve_name(self.threads[tidx].stream_id, ev.name_idx);
        self.lock_index(name_idx);
        let thread_id = self.threads[tidx].thread_id;
        self.threads[tidx].lock_event_qty += 1;

        let evt = Evt {
            thread_id,
            line_nbr: ev.line_nbr,
            kind: EventKind::LockNotify as u8,
            flags: ev.flags,
            level: 0,
            name_idx,
            value: 0,
            time_ns,
            payload: ev.payload,
        };
        let sealed = self.global.lock_ntf.push(evt);
        let lidx = self.global.lock_ntf.last_lidx();
        if let Some(body) = sealed {
            let loc = self.write_block(BlockKind::EventChunk, &body)?;
            self.global.lock_ntf.locs.push(loc);
        }

        let name_hash = self.name_hash(name_idx);
        let steps = [name_hash, hashing::hash_u64(LOCK_NTF_NAMEIDX as u64)];
        self.observe_elem(
            &steps,
            false,
            thread_id,
            0,
            name_idx,
            LOCK_NTF_NAMEIDX,
            INVALID_IDX,
            0,
            false,
            lidx,
            time_ns,
            1.0,
        )?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Markers, plots, thread names
    // ------------------------------------------------------------------

    fn process_marker(&mut self, tidx: usize, ev: &RawEvent, time_ns: u64) -> Result<()> {
        let name_idx = self.resolve_name(self.threads[tidx].stream_id, ev.name_idx);
        let thread_id = self.threads[tidx].thread_id;
        self.threads[tidx].marker_event_qty += 1;

        if !self.marker_category_name_idxs.contains(&name_idx) {
            self.marker_category_name_idxs.push(name_idx);
        }

        let evt = Evt {
            thread_id,
            line_nbr: ev.line_nbr,
            kind: EventKind::Marker as u8,
            flags: ev.flags,
            level: self.threads[tidx].cur_level as u8,
            name_idx,
            value: ev.value,
            time_ns,
            payload: ev.payload,
        };
        let sealed = self.global.marker.push(evt);
        let lidx = self.global.marker.last_lidx();
        if let Some(body) = sealed {
            let loc = self.write_block(BlockKind::EventChunk, &body)?;
            self.global.marker.locs.push(loc);
        }

        let name_hash = self.name_hash(name_idx);
        let t = &self.threads[tidx];
        let steps = [
            t.thread_hash,
            name_hash,
            hashing::hash_u64(MARKER_NAMEIDX as u64),
        ];
        self.observe_elem(
            &steps,
            true,
            thread_id,
            0,
            name_idx,
            MARKER_NAMEIDX,
            INVALID_IDX,
            0,
            false,
            lidx,
            time_ns,
            1.0,
        )?;

        Ok(())
    }

    fn process_plot(&mut self, tidx: usize, ev: &RawEvent, time_ns: u64) -> Result<()> {
        let name_idx = self.resolve_name(self.threads[tidx].stream_id, ev.name_idx);
        let name_hash = self.name_hash(name_idx);
        let thread_id = self.threads[tidx].thread_id;

        let value = if EventFlags::from_bits_retain(ev.flags).contains(EventFlags::VALUE_IS_FLOAT)
        {
            f64::from_bits(ev.payload)
        } else {
            ev.payload as f64
        };

        let t = &mut self.threads[tidx];
        t.elem_event_qty += 1;
        let level = t.cur_level.saturating_sub(1);
        let prev_elem_idx = if t.cur_level > 0 {
            t.levels[level].elem_idx
        } else {
            INVALID_IDX
        };

        let evt = Evt {
            thread_id,
            line_nbr: ev.line_nbr,
            kind: EventKind::Plot as u8,
            flags: ev.flags,
            level: t.cur_level as u8,
            name_idx,
            value: ev.value,
            time_ns,
            payload: ev.payload,
        };
        let lvl = t.level_mut(level);
        let sealed = lvl.non_scope.push(evt);
        let lidx = lvl.non_scope.last_lidx();
        if let Some(body) = sealed {
            let loc = self.write_block(BlockKind::EventChunk, &body)?;
            self.threads[tidx].levels[level].non_scope.locs.push(loc);
        }

        // Plot curves hang off the enclosing scope path.
        let t = &mut self.threads[tidx];
        t.path_stack.push(name_hash);
        let steps = t.path_stack.clone();
        t.path_stack.pop();
        let cur_level = t.cur_level as u8;

        self.observe_elem(
            &steps,
            true,
            thread_id,
            cur_level,
            name_idx,
            name_idx,
            prev_elem_idx,
            ev.flags,
            false,
            lidx,
            time_ns,
            value,
        )?;

        Ok(())
    }

    fn process_thread_name(&mut self, tidx: usize, ev: &RawEvent) {
        let name_idx = self.resolve_name(self.threads[tidx].stream_id, ev.name_idx);
        let name_hash = self.name_hash(name_idx);

        let t = &mut self.threads[tidx];
        if t.name_idx != name_idx {
            t.name_idx = name_idx;
            t.thread_unique_hash = name_hash;
            let id = t.thread_id;
            self.name_updated_thread_ids.push(id);
        }
    }

    // ------------------------------------------------------------------
    // Delta view
    // ------------------------------------------------------------------

    /// Period of the delta schedule, for the recorder loop.
    pub fn delta_period() -> std::time::Duration {
        std::time::Duration::from_micros(DELTARECORD_PERIOD_US)
    }

    /// Fill a recycled snapshot with everything that changed since the
    /// previous one.
    pub fn create_delta(&mut self, out: &mut DeltaSnapshot) {
        out.clear();

        out.last_time_ns = self.duration_ns;
        out.name_updated_thread_ids = std::mem::take(&mut self.name_updated_thread_ids);
        out.updated_elem_ids = self.elems.take_dirty_ids();
        out.new_lock_ids = std::mem::take(&mut self.new_lock_ids);
        out.new_string_ids = std::mem::take(&mut self.new_string_ids);
        for idx in &out.new_string_ids {
            self.strings[*idx as usize].flags.remove(StringFlags::DIRTY);
        }

        out.thread_qty = self.threads.len() as u32;
        out.elem_qty = self.elems.len() as u32;
        out.string_qty = self.strings.len() as u32;
        out.lock_qty = self.locks.len() as u32;
        out.errors = self.errors;

        for t in &self.threads {
            out.totals.elem += t.elem_event_qty as u64;
            out.totals.memory += t.mem_event_qty as u64;
            out.totals.ctx_switch += t.ctx_switch_event_qty as u64;
            out.totals.lock += t.lock_event_qty as u64;
            out.totals.marker += t.marker_event_qty as u64;
            out.totals.dropped += t.dropped_event_qty as u64;
        }
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    /// Close every open scope with a synthetic end at the thread's last
    /// observed time.
    fn auto_close_scopes(&mut self) -> Result<()> {
        for tidx in 0..self.threads.len() {
            self.threads[tidx].overflow_depth = 0;
            while self.threads[tidx].cur_level > 0 {
                self.errors.bump(SessionErrorKind::UnbalancedScope);
                let last = self.threads[tidx].last_time_ns;
                self.process_scope_end(tidx, last, EventFlags::AUTO_CLOSED.bits())?;
            }
        }

        Ok(())
    }

    fn encode_string_table(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend((self.strings.len() as u32).to_le_bytes());
        for s in &self.strings {
            buf.extend(s.hash.to_le_bytes());
            buf.push(s.flags.bits());
            buf.extend((s.value.len() as u32).to_le_bytes());
            buf.extend(s.value.as_bytes());
        }
        buf
    }

    fn encode_thread_table(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend((self.threads.len() as u32).to_le_bytes());
        for t in &self.threads {
            t.encode_into(&mut buf);
        }
        buf
    }

    fn encode_lock_table(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend((self.locks.len() as u32).to_le_bytes());
        for l in &self.locks {
            l.encode_into(&mut buf);
        }
        buf.extend((self.marker_category_name_idxs.len() as u32).to_le_bytes());
        for idx in &self.marker_category_name_idxs {
            buf.extend(idx.to_le_bytes());
        }
        buf
    }

    fn encode_session_info(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend(self.session.protocol_version.to_le_bytes());
        buf.push(self.session.flags.bits());
        buf.push(0);
        buf.extend(self.session.tick_origin.to_le_bytes());
        buf.extend(self.session.tick_to_ns.to_le_bytes());
        buf.extend(self.duration_ns.to_le_bytes());
        for s in [&self.session.app_name, &self.session.build_name] {
            buf.extend((s.len() as u16).to_le_bytes());
            buf.extend(s.as_bytes());
        }
        buf
    }

    /// Flush one stream's pending chunk and write its location table.
    ///
    /// The writer and the stream are disjoint borrows so this is a free
    /// helper rather than a method.
    fn flush_stream(
        writer: &mut RecordWriter,
        stream: &mut ChunkStream,
        id: StreamId,
        directory: &mut Directory,
    ) -> Result<()> {
        if stream.is_unused() {
            return Ok(());
        }

        if stream.has_pending() {
            let body = stream.seal();
            let loc = writer.write_block(BlockKind::EventChunk, &body)?;
            stream.locs.push(loc);
        }

        let locs = std::mem::take(&mut stream.locs);
        let table = writer.write_block(
            BlockKind::ChunkLocTable,
            &crate::record::encode_chunk_locs(&locs),
        )?;
        directory.streams.push((id, table));

        Ok(())
    }

    /// Finalize the record: flush everything, write the tables and the
    /// directory, fsync and publish.
    pub fn end(mut self) -> Result<PathBuf> {
        self.auto_close_scopes()?;

        let mut directory = Directory::default();
        let writer = self.writer.as_mut().ok_or(Error::NotRecording)?;

        // Per-thread streams.
        for t in self.threads.iter_mut() {
            let thread_id = t.thread_id;

            for (level, lvl) in t.levels.iter_mut().enumerate() {
                let level = level as u8;
                Self::flush_stream(
                    writer,
                    &mut lvl.scope,
                    StreamId::Scope { thread_id, level },
                    &mut directory,
                )?;
                Self::flush_stream(
                    writer,
                    &mut lvl.non_scope,
                    StreamId::NonScope { thread_id, level },
                    &mut directory,
                )?;

                lvl.pyramid.finish();
                if !lvl.pyramid.levels().is_empty() {
                    let loc = writer.write_block(BlockKind::MrTable, &lvl.pyramid.encode())?;
                    directory
                        .pyramids
                        .push((StreamId::Scope { thread_id, level }, loc));
                }
            }

            Self::flush_stream(
                writer,
                &mut t.mem_alloc,
                StreamId::MemAlloc { thread_id },
                &mut directory,
            )?;
            Self::flush_stream(
                writer,
                &mut t.mem_dealloc,
                StreamId::MemDealloc { thread_id },
                &mut directory,
            )?;
            Self::flush_stream(
                writer,
                &mut t.mem_plot,
                StreamId::MemPlot { thread_id },
                &mut directory,
            )?;
            Self::flush_stream(
                writer,
                &mut t.ctx_switch,
                StreamId::CtxSwitch { thread_id },
                &mut directory,
            )?;
            Self::flush_stream(
                writer,
                &mut t.soft_irq,
                StreamId::SoftIrq { thread_id },
                &mut directory,
            )?;
            Self::flush_stream(
                writer,
                &mut t.lock_wait,
                StreamId::LockWait { thread_id },
                &mut directory,
            )?;

            // Memory snapshot index.
            let locs = std::mem::take(&mut t.mem_snapshot_locs);
            if !locs.is_empty() {
                let table = writer.write_block(
                    BlockKind::ChunkLocTable,
                    &crate::record::encode_chunk_locs(&locs),
                )?;
                directory
                    .streams
                    .push((StreamId::MemSnapshots { thread_id }, table));
            }
        }

        // Global streams.
        Self::flush_stream(writer, &mut self.global.lock_use, StreamId::LockUse, &mut directory)?;
        Self::flush_stream(writer, &mut self.global.lock_ntf, StreamId::LockNtf, &mut directory)?;
        Self::flush_stream(
            writer,
            &mut self.global.core_usage,
            StreamId::CoreUsage,
            &mut directory,
        )?;
        Self::flush_stream(writer, &mut self.global.marker, StreamId::Marker, &mut directory)?;

        // Elem chunks and pyramids.
        for idx in 0..self.elems.len() as u32 {
            if self.elems.get(idx).has_pending_chunk() {
                let body = self.elems.get_mut(idx).seal_chunk();
                let loc = writer.write_block(BlockKind::ElemChunk, &body)?;
                self.elems.push_chunk_loc(idx, loc);
            }

            let locs = std::mem::take(&mut self.elems.get_mut(idx).chunk_locs);
            if !locs.is_empty() {
                let table = writer.write_block(
                    BlockKind::ChunkLocTable,
                    &crate::record::encode_chunk_locs(&locs),
                )?;
                directory
                    .streams
                    .push((StreamId::Elem { elem_idx: idx }, table));
            }

            self.elems.get_mut(idx).pyramid.finish();
            if !self.elems.get(idx).pyramid.levels().is_empty() {
                let body = self.elems.get(idx).pyramid.encode();
                let loc = writer.write_block(BlockKind::MrTable, &body)?;
                directory
                    .pyramids
                    .push((StreamId::Elem { elem_idx: idx }, loc));
            }
        }

        // Session tables. The writer is taken out of self so the table
        // encoders can borrow the whole session state.
        let mut writer = self.writer.take().ok_or(Error::NotRecording)?;
        for (kind, body) in [
            (BlockKind::SessionInfo, self.encode_session_info()),
            (BlockKind::StringTable, self.encode_string_table()),
            (BlockKind::ThreadTable, self.encode_thread_table()),
            (BlockKind::LockTable, self.encode_lock_table()),
            (BlockKind::ElemTable, self.elems.encode_table()),
        ] {
            let loc = writer.write_block(kind, &body)?;
            directory.tables.push((kind, loc));
        }

        let path = writer.finalize(&directory)?;

        info!(
            "record finalized: {} threads, {} elems, {} strings, {} errors",
            self.threads.len(),
            self.elems.len(),
            self.strings.len(),
            self.errors.total()
        );

        Ok(path)
    }

    /// Abort the session, deleting the partial temporary file.
    pub fn abort(mut self) {
        if let Some(writer) = self.writer.take() {
            writer.discard();
        }
    }
}
