// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Live delta snapshots.
//!
//! Every [crate::consts::DELTARECORD_PERIOD_US] the recorder fills a
//! [DeltaSnapshot] with what changed since the previous one and publishes
//! it to the UI thread through a [crate::exchange::LatestWins]. The UI owns
//! its frame cadence; snapshots it never looks at are recycled unseen.

use crate::error::SessionErrorCounters;
use crate::exchange::LatestWins;

/// Aggregate per-kind event totals for the whole session so far.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EventTotals {
    pub elem: u64,
    pub memory: u64,
    pub ctx_switch: u64,
    pub lock: u64,
    pub marker: u64,
    pub dropped: u64,
}

/// What changed since the previous snapshot.
#[derive(Clone, Debug, Default)]
pub struct DeltaSnapshot {
    /// Highest time covered; monotonically increasing across snapshots.
    pub last_time_ns: u64,
    pub name_updated_thread_ids: Vec<u16>,
    pub updated_elem_ids: Vec<u32>,
    pub new_lock_ids: Vec<u32>,
    pub new_string_ids: Vec<u32>,
    pub thread_qty: u32,
    pub elem_qty: u32,
    pub string_qty: u32,
    pub lock_qty: u32,
    pub totals: EventTotals,
    pub errors: SessionErrorCounters,
}

impl DeltaSnapshot {
    /// Reset a recycled snapshot before refilling it.
    pub fn clear(&mut self) {
        self.last_time_ns = 0;
        self.name_updated_thread_ids.clear();
        self.updated_elem_ids.clear();
        self.new_lock_ids.clear();
        self.new_string_ids.clear();
        self.thread_qty = 0;
        self.elem_qty = 0;
        self.string_qty = 0;
        self.lock_qty = 0;
        self.totals = EventTotals::default();
        self.errors = SessionErrorCounters::default();
    }
}

/// The recorder-to-UI hand-off channel.
pub type DeltaPublisher = LatestWins<DeltaSnapshot>;
