// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Multi-resolution pyramids.
//!
//! Interactive exploration needs coarse views of arbitrarily long streams.
//! Every scope stream and every plot elem maintains a cascade of "speck"
//! levels: one speck at level `k` summarizes [crate::consts::MR_SCOPE_SIZE]
//! (or [crate::consts::MR_ELEM_SIZE]) consecutive entries of level `k-1`,
//! with level 0 summarizing the raw entries.
//!
//! Scopes merge toward *density*: a speck keeps the outermost timestamps,
//! the duration sum, a child-occupancy mask, and the index of the longest
//! scope as its representative. Plots merge toward *subsampling*: a speck
//! keeps (min, max, first-time, last-time) over its window.
//!
//! All levels stay in RAM (they shrink geometrically) and are flushed to
//! the record at finalization.

use crate::consts::{MR_ELEM_SIZE, MR_SCOPE_SIZE};
use crate::error::ParseResult;
use nom::number::complete::{le_f64, le_u32, le_u64};

/// One density-mode summary of a scope window.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScopeSpeck {
    pub first_time_ns: u64,
    pub last_time_ns: u64,
    pub dur_sum_ns: u64,
    /// Bit `i` set when child `i` of the window was present.
    pub coverage: u32,
    /// Base-level index of the longest scope under this speck.
    pub rep_lidx: u32,
}

impl ScopeSpeck {
    pub const SIZE: usize = 32;

    fn merge(children: &[Self]) -> Self {
        let mut out = Self {
            first_time_ns: children[0].first_time_ns,
            last_time_ns: children[children.len() - 1].last_time_ns,
            ..Default::default()
        };

        let mut best_dur = 0u64;
        for (i, c) in children.iter().enumerate() {
            out.dur_sum_ns += c.dur_sum_ns;
            if c.coverage != 0 {
                out.coverage |= 1 << i;
            }
            if c.dur_sum_ns >= best_dur {
                best_dur = c.dur_sum_ns;
                out.rep_lidx = c.rep_lidx;
            }
        }

        out
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend(self.first_time_ns.to_le_bytes());
        buf.extend(self.last_time_ns.to_le_bytes());
        buf.extend(self.dur_sum_ns.to_le_bytes());
        buf.extend(self.coverage.to_le_bytes());
        buf.extend(self.rep_lidx.to_le_bytes());
    }

    pub fn parse(s: &[u8]) -> ParseResult<Self> {
        let (s, first_time_ns) = le_u64(s)?;
        let (s, last_time_ns) = le_u64(s)?;
        let (s, dur_sum_ns) = le_u64(s)?;
        let (s, coverage) = le_u32(s)?;
        let (s, rep_lidx) = le_u32(s)?;

        Ok((
            s,
            Self {
                first_time_ns,
                last_time_ns,
                dur_sum_ns,
                coverage,
                rep_lidx,
            },
        ))
    }
}

/// One subsampling-mode summary of a plot window.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ElemSpeck {
    pub min_value: f64,
    pub max_value: f64,
    pub first_time_ns: u64,
    pub last_time_ns: u64,
}

impl ElemSpeck {
    pub const SIZE: usize = 32;

    fn merge(children: &[Self]) -> Self {
        let mut out = children[0];
        for c in &children[1..] {
            out.min_value = out.min_value.min(c.min_value);
            out.max_value = out.max_value.max(c.max_value);
            out.last_time_ns = c.last_time_ns;
        }
        out
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend(self.min_value.to_le_bytes());
        buf.extend(self.max_value.to_le_bytes());
        buf.extend(self.first_time_ns.to_le_bytes());
        buf.extend(self.last_time_ns.to_le_bytes());
    }

    pub fn parse(s: &[u8]) -> ParseResult<Self> {
        let (s, min_value) = le_f64(s)?;
        let (s, max_value) = le_f64(s)?;
        let (s, first_time_ns) = le_u64(s)?;
        let (s, last_time_ns) = le_u64(s)?;

        Ok((
            s,
            Self {
                min_value,
                max_value,
                first_time_ns,
                last_time_ns,
            },
        ))
    }
}

/// The generic cascade: sealed specks per level plus the working window of
/// each level.
struct Cascade<T> {
    window_size: usize,
    levels: Vec<Vec<T>>,
    accum: Vec<Vec<T>>,
}

impl<T: Copy> Cascade<T> {
    fn new(window_size: usize) -> Self {
        Self {
            window_size,
            levels: Vec::new(),
            accum: Vec::new(),
        }
    }

    fn feed(&mut self, mut level: usize, mut speck: T, merge: fn(&[T]) -> T) {
        loop {
            while self.accum.len() <= level {
                self.accum.push(Vec::with_capacity(self.window_size));
                self.levels.push(Vec::new());
            }

            self.accum[level].push(speck);
            if self.accum[level].len() < self.window_size {
                return;
            }

            let merged = merge(&self.accum[level]);
            self.accum[level].clear();
            self.levels[level].push(merged);

            speck = merged;
            level += 1;
        }
    }

    /// Seal every partial window bottom-up.
    ///
    /// Remnants only propagate into levels that already exist: creating a
    /// fresh level out of a finalization remnant adds no resolution.
    fn finish(&mut self, merge: fn(&[T]) -> T) {
        let mut level = 0;
        while level < self.accum.len() {
            if !self.accum[level].is_empty() {
                let merged = merge(&self.accum[level]);
                self.accum[level].clear();
                self.levels[level].push(merged);
                if level + 1 < self.accum.len() {
                    self.accum[level + 1].push(merged);
                }
            }
            level += 1;
        }
    }
}

/// Density pyramid over one scope stream.
pub struct ScopePyramid {
    cascade: Cascade<ScopeSpeck>,
}

impl Default for ScopePyramid {
    fn default() -> Self {
        Self {
            cascade: Cascade::new(MR_SCOPE_SIZE),
        }
    }
}

impl ScopePyramid {
    /// Account one closed scope at base-level index `lidx`.
    pub fn push_scope(&mut self, lidx: u32, start_ns: u64, dur_ns: u64) {
        let speck = ScopeSpeck {
            first_time_ns: start_ns,
            last_time_ns: start_ns + dur_ns,
            dur_sum_ns: dur_ns,
            coverage: 1,
            rep_lidx: lidx,
        };
        self.cascade.feed(0, speck, ScopeSpeck::merge);
    }

    pub fn finish(&mut self) {
        self.cascade.finish(ScopeSpeck::merge);
    }

    pub fn levels(&self) -> &[Vec<ScopeSpeck>] {
        &self.cascade.levels
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend((self.cascade.levels.len() as u32).to_le_bytes());
        for level in &self.cascade.levels {
            buf.extend((level.len() as u32).to_le_bytes());
            for s in level {
                s.encode_into(&mut buf);
            }
        }
        buf
    }
}

/// Subsampling pyramid over one plot elem.
pub struct ElemPyramid {
    cascade: Cascade<ElemSpeck>,
}

impl Default for ElemPyramid {
    fn default() -> Self {
        Self {
            cascade: Cascade::new(MR_ELEM_SIZE),
        }
    }
}

impl ElemPyramid {
    pub fn push_value(&mut self, time_ns: u64, value: f64) {
        let speck = ElemSpeck {
            min_value: value,
            max_value: value,
            first_time_ns: time_ns,
            last_time_ns: time_ns,
        };
        self.cascade.feed(0, speck, ElemSpeck::merge);
    }

    pub fn finish(&mut self) {
        self.cascade.finish(ElemSpeck::merge);
    }

    pub fn levels(&self) -> &[Vec<ElemSpeck>] {
        &self.cascade.levels
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend((self.cascade.levels.len() as u32).to_le_bytes());
        for level in &self.cascade.levels {
            buf.extend((level.len() as u32).to_le_bytes());
            for s in level {
                s.encode_into(&mut buf);
            }
        }
        buf
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scope_cascade_preserves_durations() {
        let mut p = ScopePyramid::default();

        // 64 scopes of 10ns each: exactly fills two pyramid levels.
        for i in 0..64u64 {
            p.push_scope(i as u32, i * 100, 10);
        }

        let levels = p.levels();
        assert_eq!(levels[0].len(), 8);
        assert_eq!(levels[1].len(), 1);

        let top = levels[1][0];
        assert_eq!(top.dur_sum_ns, 64 * 10);
        assert_eq!(top.first_time_ns, 0);
        assert_eq!(top.last_time_ns, 63 * 100 + 10);
        assert_eq!(top.coverage, 0xff);
    }

    #[test]
    fn scope_representative_is_longest() {
        let mut p = ScopePyramid::default();

        for i in 0..8u64 {
            let dur = if i == 5 { 1000 } else { 10 };
            p.push_scope(i as u32, i * 10_000, dur);
        }

        assert_eq!(p.levels()[0][0].rep_lidx, 5);
    }

    #[test]
    fn finish_seals_partial_windows() {
        let mut p = ScopePyramid::default();

        for i in 0..11u64 {
            p.push_scope(i as u32, i * 100, 7);
        }
        p.finish();

        // 8 full + 3 partial at level 0 => 2 specks; level 1 gets both.
        assert_eq!(p.levels()[0].len(), 2);
        let total: u64 = p.levels()[0].iter().map(|s| s.dur_sum_ns).sum();
        assert_eq!(total, 11 * 7);
    }

    #[test]
    fn elem_subsampling_keeps_extremes() {
        let mut p = ElemPyramid::default();

        let values = [3.0, -1.0, 4.0, 1.0, -5.0, 9.0, 2.0, 6.0];
        for (i, v) in values.iter().enumerate() {
            p.push_value(i as u64 * 50, *v);
        }

        let s = p.levels()[0][0];
        assert_eq!(s.min_value, -5.0);
        assert_eq!(s.max_value, 9.0);
        assert_eq!(s.first_time_ns, 0);
        assert_eq!(s.last_time_ns, 350);
    }

    #[test]
    fn speck_serialization_round_trips() {
        let s = ScopeSpeck {
            first_time_ns: 1,
            last_time_ns: 2,
            dur_sum_ns: 3,
            coverage: 0x55,
            rep_lidx: 7,
        };
        let mut buf = Vec::new();
        s.encode_into(&mut buf);
        assert_eq!(buf.len(), ScopeSpeck::SIZE);
        assert_eq!(ScopeSpeck::parse(&buf).unwrap().1, s);

        let e = ElemSpeck {
            min_value: -1.5,
            max_value: 2.5,
            first_time_ns: 10,
            last_time_ns: 20,
        };
        buf.clear();
        e.encode_into(&mut buf);
        assert_eq!(buf.len(), ElemSpeck::SIZE);
        assert_eq!(ElemSpeck::parse(&buf).unwrap().1, e);
    }
}
