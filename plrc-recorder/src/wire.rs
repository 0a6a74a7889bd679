// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Wire protocol structures.
//!
//! Everything an instrumented process sends is framed: an 8 byte header
//! ([FrameHeader]) followed by a body whose interpretation depends on the
//! frame type. Bodies are decoded with streaming nom parsers so a partial
//! body can be detected and buffered by the frame parser.
//!
//! All integers are little-endian.

use crate::error::{ParseResult, Result, SessionErrorKind};
use bitflags::bitflags;
use nom::{
    bytes::streaming::take,
    error::context,
    number::streaming::{le_f64, le_u16, le_u32, le_u64, le_u8},
};
use num_enum::TryFromPrimitive;

/// Protocol version advertised in HELLO frames. Major in the high byte.
pub const PROTOCOL_VERSION: u16 = 0x0100;

/// Frame type discriminants.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Hello = 1,
    Strings = 2,
    Events = 3,
    Remote = 4,
    Bye = 5,
}

bitflags! {
    /// Per-frame flags.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct FrameFlags: u8 {
        /// The event body starts with a u64 short-date resync marker.
        const DATE_SYNC = 0x01;
        /// This event buffer closes a collection tick on the client.
        const COLLECTION_TICK = 0x02;
        const _ = !0;
    }
}

/// The fixed 8-byte frame header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub frame_type: u8,
    pub flags: FrameFlags,
    /// Item count, interpreted per frame type (events or strings carried).
    pub count: u16,
    pub byte_len: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 8;

    pub fn parse(s: &[u8]) -> ParseResult<Self> {
        let (s, frame_type) = le_u8(s)?;
        let (s, flags) = le_u8(s)?;
        let (s, count) = le_u16(s)?;
        let (s, byte_len) = le_u32(s)?;

        Ok((
            s,
            Self {
                frame_type,
                flags: FrameFlags::from_bits_retain(flags),
                count,
                byte_len,
            },
        ))
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.frame_type;
        buf[1] = self.flags.bits();
        buf[2..4].copy_from_slice(&self.count.to_le_bytes());
        buf[4..8].copy_from_slice(&self.byte_len.to_le_bytes());
        buf
    }
}

bitflags! {
    /// Encoding options negotiated at HELLO and immutable for the session.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct SessionFlags: u8 {
        /// Strings are never transmitted; only hashes cross the wire.
        const STRINGS_EXTERNAL = 0x01;
        /// String hashes are 32-bit on the wire.
        const STRING_HASH_SHORT = 0x02;
        /// The client accepts remote control commands.
        const CONTROL_ENABLED = 0x04;
        /// Event ticks carry only their low 32 bits.
        const DATE_SHORT = 0x08;
        /// Events use the 16-byte compact encoding.
        const COMPACT_MODEL = 0x10;
        /// The client byte-toggles its buffers between collection ticks.
        const RECORD_TOGGLE_BYTES = 0x20;
    }
}

/// The HELLO body.
#[derive(Clone, Debug, PartialEq)]
pub struct Hello {
    pub protocol_version: u16,
    pub flags: SessionFlags,
    pub tick_origin: u64,
    pub tick_to_ns: f64,
    pub app_name: String,
    pub build_name: String,
}

fn length_prefixed_string(s: &[u8]) -> ParseResult<String> {
    let (s, len) = le_u16(s)?;
    let (s, raw) = take(len as usize)(s)?;

    // Hello strings are small; decode permissively.
    Ok((s, String::from_utf8_lossy(raw).into_owned()))
}

impl Hello {
    pub fn parse(s: &[u8]) -> ParseResult<Self> {
        let (s, protocol_version) = context("hello protocol version", le_u16)(s)?;
        let (s, flags) = le_u8(s)?;
        let (s, _reserved) = le_u8(s)?;
        let (s, tick_origin) = le_u64(s)?;
        let (s, tick_to_ns) = le_f64(s)?;
        let (s, app_name) = context("hello app name", length_prefixed_string)(s)?;
        let (s, build_name) = context("hello build name", length_prefixed_string)(s)?;

        Ok((
            s,
            Self {
                protocol_version,
                flags: SessionFlags::from_bits_retain(flags),
                tick_origin,
                tick_to_ns,
                app_name,
                build_name,
            },
        ))
    }

    pub fn major_version(&self) -> u8 {
        (self.protocol_version >> 8) as u8
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24 + self.app_name.len() + self.build_name.len());
        buf.extend(self.protocol_version.to_le_bytes());
        buf.push(self.flags.bits());
        buf.push(0);
        buf.extend(self.tick_origin.to_le_bytes());
        buf.extend(self.tick_to_ns.to_le_bytes());
        for s in [&self.app_name, &self.build_name] {
            buf.extend((s.len() as u16).to_le_bytes());
            buf.extend(s.as_bytes());
        }
        buf
    }
}

/// One entry of a STRING body: an interning request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StringRecord<'a> {
    pub hash: u64,
    pub value: &'a [u8],
}

impl<'a> StringRecord<'a> {
    /// Parse one record. With `short_hash`, the wire hash is a
    /// zero-extended u32.
    pub fn parse(s: &'a [u8], short_hash: bool) -> ParseResult<'a, Self> {
        let (s, hash) = if short_hash {
            let (s, h) = le_u32(s)?;
            (s, h as u64)
        } else {
            le_u64(s)?
        };
        let (s, len) = le_u16(s)?;
        let (s, value) = take(len as usize)(s)?;

        Ok((s, Self { hash, value }))
    }

    pub fn encode(&self, short_hash: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + self.value.len());
        if short_hash {
            buf.extend((self.hash as u32).to_le_bytes());
        } else {
            buf.extend(self.hash.to_le_bytes());
        }
        buf.extend((self.value.len() as u16).to_le_bytes());
        buf.extend(self.value);
        buf
    }
}

/// Event kind tags.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum EventKind {
    ScopeBegin = 0,
    ScopeEnd = 1,
    MemAlloc = 2,
    MemDealloc = 3,
    MemPlot = 4,
    CtxSwitch = 5,
    CoreUsage = 6,
    SoftIrq = 7,
    LockWaitBegin = 8,
    LockWaitEnd = 9,
    LockUse = 10,
    LockNotify = 11,
    Marker = 12,
    Plot = 13,
    /// Declares the name of a source thread.
    ThreadName = 14,
}

impl EventKind {
    /// Kinds that contribute to per-thread memory accounting.
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::MemAlloc | Self::MemDealloc | Self::MemPlot)
    }

    pub fn is_scope(&self) -> bool {
        matches!(self, Self::ScopeBegin | Self::ScopeEnd)
    }

    pub fn is_lock(&self) -> bool {
        matches!(
            self,
            Self::LockWaitBegin | Self::LockWaitEnd | Self::LockUse | Self::LockNotify
        )
    }
}

bitflags! {
    /// Per-event flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct EventFlags: u8 {
        /// A scope end synthesized by the finalizer, not observed.
        const AUTO_CLOSED = 0x01;
        /// Event value slot holds a float encoded in its bits.
        const VALUE_IS_FLOAT = 0x02;
        const _ = !0;
    }
}

/// A decoded wire event.
///
/// The full model is 32 bytes; the compact model is 16 bytes and overlaps
/// the payload with the value slot while shortening the tick to 32 bits.
/// [RawEvent::parse_compact] reconstructs the full shape; only the tick
/// remains short and must go through a [crate::shortdate::ShortDateResolver].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RawEvent {
    pub name_idx: u16,
    pub thread_id: u16,
    pub kind: u8,
    pub flags: u8,
    pub line_nbr: u16,
    pub value: u32,
    pub tick: u64,
    pub payload: u64,
}

impl RawEvent {
    pub const SIZE: usize = 32;
    pub const SIZE_COMPACT: usize = 16;

    pub fn parse(s: &[u8]) -> ParseResult<Self> {
        let (s, name_idx) = le_u16(s)?;
        let (s, thread_id) = le_u16(s)?;
        let (s, kind) = le_u8(s)?;
        let (s, flags) = le_u8(s)?;
        let (s, line_nbr) = le_u16(s)?;
        let (s, value) = le_u32(s)?;
        let (s, _reserved) = le_u32(s)?;
        let (s, tick) = le_u64(s)?;
        let (s, payload) = le_u64(s)?;

        Ok((
            s,
            Self {
                name_idx,
                thread_id,
                kind,
                flags,
                line_nbr,
                value,
                tick,
                payload,
            },
        ))
    }

    pub fn parse_compact(s: &[u8]) -> ParseResult<Self> {
        let (s, name_idx) = le_u16(s)?;
        let (s, thread_id) = le_u16(s)?;
        let (s, kind) = le_u8(s)?;
        let (s, flags) = le_u8(s)?;
        let (s, line_nbr) = le_u16(s)?;
        let (s, value) = le_u32(s)?;
        let (s, short_tick) = le_u32(s)?;

        Ok((
            s,
            Self {
                name_idx,
                thread_id,
                kind,
                flags,
                line_nbr,
                value,
                tick: short_tick as u64,
                payload: value as u64,
            },
        ))
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.name_idx.to_le_bytes());
        buf[2..4].copy_from_slice(&self.thread_id.to_le_bytes());
        buf[4] = self.kind;
        buf[5] = self.flags;
        buf[6..8].copy_from_slice(&self.line_nbr.to_le_bytes());
        buf[8..12].copy_from_slice(&self.value.to_le_bytes());
        buf[16..24].copy_from_slice(&self.tick.to_le_bytes());
        buf[24..32].copy_from_slice(&self.payload.to_le_bytes());
        buf
    }

    pub fn encode_compact(&self) -> [u8; Self::SIZE_COMPACT] {
        let mut buf = [0u8; Self::SIZE_COMPACT];
        buf[0..2].copy_from_slice(&self.name_idx.to_le_bytes());
        buf[2..4].copy_from_slice(&self.thread_id.to_le_bytes());
        buf[4] = self.kind;
        buf[5] = self.flags;
        buf[6..8].copy_from_slice(&self.line_nbr.to_le_bytes());
        buf[8..12].copy_from_slice(&self.value.to_le_bytes());
        buf[12..16].copy_from_slice(&((self.tick as u32).to_le_bytes()));
        buf
    }

    /// Classify the kind tag, or report it as unknown.
    pub fn kind(&self) -> Result<EventKind, SessionErrorKind> {
        EventKind::try_from(self.kind).map_err(|_| SessionErrorKind::UnknownEventKind)
    }
}

/// Decode an EVENT body into its optional sync marker and event array.
pub fn parse_event_body<'a>(
    s: &'a [u8],
    flags: FrameFlags,
    count: usize,
    compact: bool,
) -> ParseResult<'a, (Option<u64>, Vec<RawEvent>)> {
    let (mut s, sync_tick) = if flags.contains(FrameFlags::DATE_SYNC) {
        let (s, t) = context("event body sync marker", le_u64)(s)?;
        (s, Some(t))
    } else {
        (s, None)
    };

    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        let (rest, ev) = if compact {
            RawEvent::parse_compact(s)?
        } else {
            RawEvent::parse(s)?
        };
        s = rest;
        events.push(ev);
    }

    Ok((s, (sync_tick, events)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_header_round_trip() {
        let h = FrameHeader {
            frame_type: FrameType::Events as u8,
            flags: FrameFlags::DATE_SYNC,
            count: 12,
            byte_len: 0x1234,
        };

        let raw = h.encode();
        let (rest, parsed) = FrameHeader::parse(&raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, h);
    }

    #[test]
    fn frame_header_fixture() {
        // type=3 (EVENT), flags=1, count=2, byteLen=64.
        let raw = hex::decode("0301020040000000").unwrap();
        let (_, h) = FrameHeader::parse(&raw).unwrap();

        assert!(matches!(
            FrameType::try_from(h.frame_type),
            Ok(FrameType::Events)
        ));
        assert!(h.flags.contains(FrameFlags::DATE_SYNC));
        assert_eq!(h.count, 2);
        assert_eq!(h.byte_len, 64);
    }

    #[test]
    fn hello_round_trip() {
        let hello = Hello {
            protocol_version: PROTOCOL_VERSION,
            flags: SessionFlags::CONTROL_ENABLED | SessionFlags::DATE_SHORT,
            tick_origin: 1_000_000,
            tick_to_ns: 2.5,
            app_name: "editor".to_string(),
            build_name: "v1.2".to_string(),
        };

        let raw = hello.encode();
        let (rest, parsed) = Hello::parse(&raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, hello);
        assert_eq!(parsed.major_version(), 1);
    }

    #[test]
    fn hello_incomplete_is_streaming() {
        let hello = Hello {
            protocol_version: PROTOCOL_VERSION,
            flags: SessionFlags::empty(),
            tick_origin: 0,
            tick_to_ns: 1.0,
            app_name: "x".to_string(),
            build_name: String::new(),
        };
        let raw = hello.encode();

        assert!(matches!(
            Hello::parse(&raw[..raw.len() - 1]),
            Err(nom::Err::Incomplete(_))
        ));
    }

    #[test]
    fn string_record_hash_widths() {
        let rec = StringRecord {
            hash: 0x1122_3344,
            value: b"worker",
        };

        for short in [false, true] {
            let raw = rec.encode(short);
            let (rest, parsed) = StringRecord::parse(&raw, short).unwrap();
            assert!(rest.is_empty());
            assert_eq!(parsed, rec);
        }
    }

    #[test]
    fn event_fixture() {
        use indoc::indoc;

        const EVENT_HEX: &str = indoc! {"
            07000300 00007800 2a000000 00000000
            08070605 04030201 efbeadde 00000000
        "};

        let raw = hex::decode(
            EVENT_HEX
                .bytes()
                .filter(|x| !x.is_ascii_whitespace())
                .collect::<Vec<_>>(),
        )
        .unwrap();

        let (rest, ev) = RawEvent::parse(&raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            ev,
            RawEvent {
                name_idx: 7,
                thread_id: 3,
                kind: EventKind::ScopeBegin as u8,
                flags: 0,
                line_nbr: 120,
                value: 42,
                tick: 0x0102_0304_0506_0708,
                payload: 0xdead_beef,
            }
        );
    }

    #[test]
    fn event_round_trip() {
        let ev = RawEvent {
            name_idx: 7,
            thread_id: 3,
            kind: EventKind::ScopeBegin as u8,
            flags: 0,
            line_nbr: 120,
            value: 42,
            tick: 0x0102_0304_0506_0708,
            payload: 0xdead_beef,
        };

        let raw = ev.encode();
        let (rest, parsed) = RawEvent::parse(&raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, ev);
    }

    #[test]
    fn compact_event_overlaps_payload() {
        let ev = RawEvent {
            name_idx: 1,
            thread_id: 0,
            kind: EventKind::Plot as u8,
            flags: 0,
            line_nbr: 0,
            value: 99,
            tick: 0x4455_6677,
            payload: 99,
        };

        let raw = ev.encode_compact();
        assert_eq!(raw.len(), RawEvent::SIZE_COMPACT);

        let (rest, parsed) = RawEvent::parse_compact(&raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, ev);
        assert_eq!(parsed.payload, parsed.value as u64);
    }

    #[test]
    fn event_body_with_sync_marker() {
        let mut body = 0x1000u64.to_le_bytes().to_vec();
        body.extend(RawEvent::default().encode());
        body.extend(RawEvent::default().encode());

        let (rest, (sync, events)) =
            parse_event_body(&body, FrameFlags::DATE_SYNC, 2, false).unwrap();
        assert!(rest.is_empty());
        assert_eq!(sync, Some(0x1000));
        assert_eq!(events.len(), 2);
    }
}
