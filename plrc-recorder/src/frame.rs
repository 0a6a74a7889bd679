// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Frame-level stream parsing.
//!
//! The transport delivers arbitrary byte runs. [FrameParser] reassembles
//! them into frames: it accumulates the 8-byte header, then the body, then
//! decodes the body according to the session's negotiated encoding flags
//! and emits a [Frame].
//!
//! The parser runs after the handshake (the HELLO exchange is handled
//! synchronously by [crate::session]); [FrameParser::reset] restores the
//! initial state so a parser can be reused across sessions.

use crate::{
    consts::{MAX_FRAME_BYTE_SIZE, MAX_REMOTE_COMMAND_BYTE_SIZE},
    error::{Error, Result},
    wire::{parse_event_body, FrameHeader, FrameType, RawEvent, SessionFlags, StringRecord},
};

/// A fully reassembled and decoded frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// Interning requests: (hash, UTF-8 bytes).
    Strings(Vec<(u64, Vec<u8>)>),
    /// One event buffer.
    Events {
        /// Monotonic id of this event buffer within the session.
        buffer_id: u32,
        /// Full-tick resync marker, when the buffer carries one.
        sync_tick: Option<u64>,
        events: Vec<RawEvent>,
        /// Whether this buffer closes a client collection tick.
        collection_tick: bool,
    },
    /// An opaque remote-command response body.
    Remote(Vec<u8>),
    /// Orderly end of session.
    Bye,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Header,
    StringBody,
    EventBody,
    RemoteBody,
}

pub struct FrameParser {
    flags: SessionFlags,
    state: State,
    header_buf: Vec<u8>,
    pending: Option<FrameHeader>,
    body: Vec<u8>,
    remaining: usize,
    event_buffer_id: u32,
}

impl FrameParser {
    pub fn new(flags: SessionFlags) -> Self {
        Self {
            flags,
            state: State::Header,
            header_buf: Vec::with_capacity(FrameHeader::SIZE),
            pending: None,
            body: Vec::new(),
            remaining: 0,
            event_buffer_id: 0,
        }
    }

    /// Restore the initial state. Negotiated flags are kept.
    pub fn reset(&mut self) {
        self.state = State::Header;
        self.header_buf.clear();
        self.pending = None;
        self.body.clear();
        self.remaining = 0;
        self.event_buffer_id = 0;
    }

    /// Whether the parser sits at a frame boundary.
    ///
    /// False at transport EOF means the session died mid-frame.
    pub fn is_idle(&self) -> bool {
        self.state == State::Header && self.header_buf.is_empty()
    }

    /// Consume a run of transport bytes, appending decoded frames to `out`.
    pub fn push(&mut self, mut data: &[u8], out: &mut Vec<Frame>) -> Result<()> {
        while !data.is_empty() {
            match self.state {
                State::Header => {
                    let need = FrameHeader::SIZE - self.header_buf.len();
                    let take = need.min(data.len());
                    self.header_buf.extend_from_slice(&data[..take]);
                    data = &data[take..];

                    if self.header_buf.len() == FrameHeader::SIZE {
                        self.begin_body(out)?;
                    }
                }
                State::StringBody | State::EventBody | State::RemoteBody => {
                    let take = self.remaining.min(data.len());
                    self.body.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    self.remaining -= take;

                    if self.remaining == 0 {
                        self.finish_body(out)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn begin_body(&mut self, out: &mut Vec<Frame>) -> Result<()> {
        let (_, header) =
            FrameHeader::parse(&self.header_buf).map_err(Error::from)?;
        self.header_buf.clear();

        let frame_type = FrameType::try_from(header.frame_type)
            .map_err(|_| Error::UnknownFrameType(header.frame_type))?;

        let byte_len = header.byte_len as usize;
        let limit = match frame_type {
            FrameType::Remote => MAX_REMOTE_COMMAND_BYTE_SIZE,
            _ => MAX_FRAME_BYTE_SIZE,
        };
        if byte_len > limit {
            return Err(Error::FrameTooLarge(byte_len));
        }

        let state = match frame_type {
            FrameType::Hello => return Err(Error::DuplicateHello),
            FrameType::Strings => State::StringBody,
            FrameType::Events => State::EventBody,
            FrameType::Remote => State::RemoteBody,
            FrameType::Bye if byte_len == 0 => {
                out.push(Frame::Bye);
                return Ok(());
            }
            // A BYE is not expected to carry a body; drain it anyway so
            // the stream stays framed.
            FrameType::Bye => State::RemoteBody,
        };

        self.pending = Some(header);
        self.body.clear();
        self.remaining = byte_len;
        self.state = state;

        // Zero-length bodies complete immediately.
        if self.remaining == 0 {
            self.finish_body(out)?;
        }

        Ok(())
    }

    fn finish_body(&mut self, out: &mut Vec<Frame>) -> Result<()> {
        let header = self.pending.take().expect("body without header");
        let state = self.state;
        self.state = State::Header;

        match state {
            State::Header => unreachable!(),
            State::StringBody => {
                let short = self.flags.contains(SessionFlags::STRING_HASH_SHORT);
                let mut s = self.body.as_slice();
                let mut records = Vec::with_capacity(header.count as usize);
                for _ in 0..header.count {
                    let (rest, rec) = StringRecord::parse(s, short)?;
                    s = rest;
                    records.push((rec.hash, rec.value.to_vec()));
                }
                out.push(Frame::Strings(records));
            }
            State::EventBody => {
                let compact = self.flags.contains(SessionFlags::COMPACT_MODEL);
                let (_, (sync_tick, events)) = parse_event_body(
                    &self.body,
                    header.flags,
                    header.count as usize,
                    compact,
                )?;

                self.event_buffer_id += 1;
                out.push(Frame::Events {
                    buffer_id: self.event_buffer_id,
                    sync_tick,
                    events,
                    collection_tick: header
                        .flags
                        .contains(crate::wire::FrameFlags::COLLECTION_TICK),
                });
            }
            State::RemoteBody => {
                if header.frame_type == FrameType::Bye as u8 {
                    out.push(Frame::Bye);
                } else {
                    out.push(Frame::Remote(std::mem::take(&mut self.body)));
                }
            }
        }

        self.body.clear();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::{EventKind, FrameFlags};

    fn event_frame_bytes(events: &[RawEvent], sync: Option<u64>) -> Vec<u8> {
        let mut body = Vec::new();
        let mut flags = FrameFlags::empty();
        if let Some(t) = sync {
            flags |= FrameFlags::DATE_SYNC;
            body.extend(t.to_le_bytes());
        }
        for ev in events {
            body.extend(ev.encode());
        }

        let mut raw = FrameHeader {
            frame_type: FrameType::Events as u8,
            flags,
            count: events.len() as u16,
            byte_len: body.len() as u32,
        }
        .encode()
        .to_vec();
        raw.extend(body);
        raw
    }

    #[test]
    fn whole_frame_in_one_push() {
        let ev = RawEvent {
            kind: EventKind::ScopeBegin as u8,
            tick: 100,
            ..Default::default()
        };
        let raw = event_frame_bytes(&[ev], Some(0x40));

        let mut p = FrameParser::new(SessionFlags::empty());
        let mut out = Vec::new();
        p.push(&raw, &mut out).unwrap();

        assert_eq!(out.len(), 1);
        match &out[0] {
            Frame::Events {
                buffer_id,
                sync_tick,
                events,
                ..
            } => {
                assert_eq!(*buffer_id, 1);
                assert_eq!(*sync_tick, Some(0x40));
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].tick, 100);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(p.is_idle());
    }

    #[test]
    fn bytes_split_at_every_boundary() {
        let ev = RawEvent {
            kind: EventKind::ScopeEnd as u8,
            tick: 7,
            ..Default::default()
        };
        let raw = event_frame_bytes(&[ev, ev], None);

        for split in 1..raw.len() {
            let mut p = FrameParser::new(SessionFlags::empty());
            let mut out = Vec::new();
            p.push(&raw[..split], &mut out).unwrap();
            assert!(out.is_empty());
            p.push(&raw[split..], &mut out).unwrap();

            assert_eq!(out.len(), 1, "split at {}", split);
            assert!(p.is_idle());
        }
    }

    #[test]
    fn string_frame_decoding() {
        let mut body = Vec::new();
        for (h, v) in [(5u64, "A"), (7, "B")] {
            body.extend(
                StringRecord {
                    hash: h,
                    value: v.as_bytes(),
                }
                .encode(false),
            );
        }

        let mut raw = FrameHeader {
            frame_type: FrameType::Strings as u8,
            flags: FrameFlags::empty(),
            count: 2,
            byte_len: body.len() as u32,
        }
        .encode()
        .to_vec();
        raw.extend(body);

        let mut p = FrameParser::new(SessionFlags::empty());
        let mut out = Vec::new();
        p.push(&raw, &mut out).unwrap();

        assert_eq!(
            out,
            vec![Frame::Strings(vec![
                (5, b"A".to_vec()),
                (7, b"B".to_vec())
            ])]
        );
    }

    #[test]
    fn bye_has_no_body() {
        let raw = FrameHeader {
            frame_type: FrameType::Bye as u8,
            flags: FrameFlags::empty(),
            count: 0,
            byte_len: 0,
        }
        .encode();

        let mut p = FrameParser::new(SessionFlags::empty());
        let mut out = Vec::new();
        p.push(&raw, &mut out).unwrap();

        assert_eq!(out, vec![Frame::Bye]);
        assert!(p.is_idle());
    }

    #[test]
    fn oversized_remote_frame_is_fatal() {
        let raw = FrameHeader {
            frame_type: FrameType::Remote as u8,
            flags: FrameFlags::empty(),
            count: 0,
            byte_len: (MAX_REMOTE_COMMAND_BYTE_SIZE + 1) as u32,
        }
        .encode();

        let mut p = FrameParser::new(SessionFlags::empty());
        let mut out = Vec::new();
        assert!(matches!(
            p.push(&raw, &mut out),
            Err(Error::FrameTooLarge(_))
        ));
    }

    #[test]
    fn unknown_frame_type_is_fatal() {
        let raw = FrameHeader {
            frame_type: 0x7f,
            flags: FrameFlags::empty(),
            count: 0,
            byte_len: 0,
        }
        .encode();

        let mut p = FrameParser::new(SessionFlags::empty());
        let mut out = Vec::new();
        assert!(matches!(
            p.push(&raw, &mut out),
            Err(Error::UnknownFrameType(0x7f))
        ));
    }

    #[test]
    fn reset_restarts_mid_body() {
        let ev = RawEvent::default();
        let raw = event_frame_bytes(&[ev], None);

        let mut p = FrameParser::new(SessionFlags::empty());
        let mut out = Vec::new();
        p.push(&raw[..12], &mut out).unwrap();
        assert!(!p.is_idle());

        p.reset();
        assert!(p.is_idle());

        p.push(&raw, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Frame::Events { buffer_id, .. } => assert_eq!(*buffer_id, 1),
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
