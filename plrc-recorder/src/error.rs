// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types.
//!
//! Two layers coexist. [Error] is the fatal taxonomy: an error of this type
//! terminates the session (after finalizing the record where possible).
//! [SessionErrorKind] names the recoverable, counted conditions: they are
//! logged, tallied in [SessionErrorCounters], surfaced through the delta
//! view, and never abort the session.

use nom::{
    error::{ContextError, ErrorKind, ParseError},
    IResult,
};
use strum::{EnumCount, EnumIter, IntoStaticStr};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct NomParseError {
    pub input: Vec<u8>,
    pub kind: ErrorKind,
    pub contexts: Vec<&'static str>,
}

impl<'a> ParseError<&'a [u8]> for NomParseError {
    fn from_error_kind(input: &'a [u8], kind: ErrorKind) -> Self {
        Self {
            input: input.to_vec(),
            kind,
            contexts: vec![],
        }
    }

    fn append(_: &'a [u8], _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<'a> ContextError<&'a [u8]> for NomParseError {
    fn add_context(_input: &'a [u8], ctx: &'static str, mut other: Self) -> Self {
        other.contexts.push(ctx);

        other
    }
}

pub type ParseResult<'a, T> = IResult<&'a [u8], T, NomParseError>;

/// Fatal session errors.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("insufficient input data for parsing: {0:?}")]
    ParseIncomplete(nom::Needed),

    #[error("parse error: {0:?}")]
    ParseError(NomParseError),

    #[error("parse failure: {0:?}")]
    ParseFailure(NomParseError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("protocol version mismatch: peer has major {peer}, we support major {ours}")]
    ProtocolVersionMismatch { peer: u8, ours: u8 },

    #[error("frame of {0} bytes exceeds the maximum allowed size")]
    FrameTooLarge(usize),

    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("frame received before the session handshake")]
    FrameBeforeHello,

    #[error("duplicate HELLO frame after the handshake")]
    DuplicateHello,

    #[error("storage write failed: {0}")]
    StorageWriteFailed(String),

    #[error("record file is corrupt: {0}")]
    CorruptRecord(&'static str),

    #[error("session is not recording")]
    NotRecording,
}

impl From<nom::Err<NomParseError>> for Error {
    fn from(value: nom::Err<NomParseError>) -> Self {
        match value {
            nom::Err::Incomplete(needed) => Self::ParseIncomplete(needed),
            nom::Err::Error(e) => Self::ParseError(e),
            nom::Err::Failure(e) => Self::ParseFailure(e),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Recoverable, counted error conditions.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, EnumCount, EnumIter, IntoStaticStr,
)]
#[repr(usize)]
pub enum SessionErrorKind {
    /// A frame body was cut short by the transport closing.
    TruncatedBody,
    /// An event carried a kind tag we do not recognize.
    UnknownEventKind,
    /// A scope begin/end did not pair up (depth overflow or session end).
    UnbalancedScope,
    /// A dealloc referenced a pointer with no live alloc.
    UnknownDealloc,
    /// A short-date resync marker was missed or inconsistent.
    DateResyncMiss,
    /// An event referenced a thread beyond the per-session maximum.
    TooManyThreads,
}

/// Per-session tallies of [SessionErrorKind] occurrences.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SessionErrorCounters {
    counts: [u32; <SessionErrorKind as strum::EnumCount>::COUNT],
}

impl SessionErrorCounters {
    pub fn bump(&mut self, kind: SessionErrorKind) {
        self.counts[kind as usize] += 1;
    }

    pub fn get(&self, kind: SessionErrorKind) -> u32 {
        self.counts[kind as usize]
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().sum()
    }

    /// Iterate non-zero counters with their static names.
    pub fn iter_non_zero(&self) -> impl Iterator<Item = (&'static str, u32)> + '_ {
        <SessionErrorKind as strum::IntoEnumIterator>::iter()
            .filter(|k| self.get(*k) > 0)
            .map(|k| (<&'static str>::from(k), self.get(k)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters() {
        let mut c = SessionErrorCounters::default();
        c.bump(SessionErrorKind::UnbalancedScope);
        c.bump(SessionErrorKind::UnbalancedScope);
        c.bump(SessionErrorKind::UnknownDealloc);

        assert_eq!(c.get(SessionErrorKind::UnbalancedScope), 2);
        assert_eq!(c.get(SessionErrorKind::TruncatedBody), 0);
        assert_eq!(c.total(), 3);

        let named = c.iter_non_zero().collect::<Vec<_>>();
        assert_eq!(
            named,
            vec![("UnbalancedScope", 2), ("UnknownDealloc", 1)]
        );
    }
}
