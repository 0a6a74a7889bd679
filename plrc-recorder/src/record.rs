// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! PLRC record files.
//!
//! A record file is an append-only sequence of blocks:
//!
//! ```text
//! "PLRC" u8 version
//! repeated { u8 kind, u32 uncompressedLen, u32 compressedLen, bytes }
//! ... directory block ...
//! u64 directory offset
//! ```
//!
//! Block bodies are lz4 block-compressed. When compression would not
//! shrink a body it is stored raw and bit 7 of the kind byte marks it
//! "stored", so chunk writes never expand. The final block is a directory
//! locating every stream's chunk-location table and the session tables;
//! its offset sits in the trailing 8 bytes.
//!
//! [RecordWriter] appends to a temporary name and atomically renames into
//! place at finalization: a session killed mid-write leaves no partial
//! record visible.

use crate::error::{Error, ParseResult, Result};
use log::debug;
use nom::{
    error::context,
    multi::count,
    number::complete::{le_u32, le_u64, le_u8},
};
use num_enum::TryFromPrimitive;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const MAGIC: [u8; 4] = *b"PLRC";
pub const FORMAT_VERSION: u8 = 1;

/// High bit of the on-disk kind byte: body stored without compression.
const STORED_BIT: u8 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum BlockKind {
    /// Session metadata: app/build names, tick origin, tick-to-ns.
    SessionInfo = 1,
    /// A batch of [Evt] entries from one stream.
    EventChunk = 2,
    /// A batch of packed elem observations.
    ElemChunk = 3,
    /// A live-allocation snapshot of one thread.
    MemSnapshot = 4,
    /// One stream's ordered [ChunkLoc] list.
    ChunkLocTable = 5,
    StringTable = 6,
    ThreadTable = 7,
    LockTable = 8,
    ElemTable = 9,
    /// MR pyramid levels for one stream or elem.
    MrTable = 10,
    Directory = 11,
}

/// Location of one written block.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChunkLoc {
    pub offset: u64,
    pub uncompressed: u32,
    pub compressed: u32,
}

impl ChunkLoc {
    pub const SIZE: usize = 16;

    pub fn parse(s: &[u8]) -> ParseResult<Self> {
        let (s, offset) = le_u64(s)?;
        let (s, uncompressed) = le_u32(s)?;
        let (s, compressed) = le_u32(s)?;

        Ok((
            s,
            Self {
                offset,
                uncompressed,
                compressed,
            },
        ))
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend(self.offset.to_le_bytes());
        buf.extend(self.uncompressed.to_le_bytes());
        buf.extend(self.compressed.to_le_bytes());
    }
}

/// Identifies one chunk stream in the directory.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StreamId {
    /// Scope events of one (thread, nesting level).
    Scope { thread_id: u16, level: u8 },
    /// Non-scope events of one (thread, nesting level).
    NonScope { thread_id: u16, level: u8 },
    MemAlloc { thread_id: u16 },
    MemDealloc { thread_id: u16 },
    MemPlot { thread_id: u16 },
    CtxSwitch { thread_id: u16 },
    SoftIrq { thread_id: u16 },
    LockWait { thread_id: u16 },
    MemSnapshots { thread_id: u16 },
    LockUse,
    LockNtf,
    CoreUsage,
    Marker,
    /// Packed observations of one elem.
    Elem { elem_idx: u32 },
}

impl StreamId {
    const SIZE: usize = 9;

    fn tag_and_args(&self) -> (u8, u32, u32) {
        match *self {
            Self::Scope { thread_id, level } => (1, thread_id as u32, level as u32),
            Self::NonScope { thread_id, level } => (2, thread_id as u32, level as u32),
            Self::MemAlloc { thread_id } => (3, thread_id as u32, 0),
            Self::MemDealloc { thread_id } => (4, thread_id as u32, 0),
            Self::MemPlot { thread_id } => (5, thread_id as u32, 0),
            Self::CtxSwitch { thread_id } => (6, thread_id as u32, 0),
            Self::SoftIrq { thread_id } => (7, thread_id as u32, 0),
            Self::LockWait { thread_id } => (8, thread_id as u32, 0),
            Self::MemSnapshots { thread_id } => (9, thread_id as u32, 0),
            Self::LockUse => (10, 0, 0),
            Self::LockNtf => (11, 0, 0),
            Self::CoreUsage => (12, 0, 0),
            Self::Marker => (13, 0, 0),
            Self::Elem { elem_idx } => (14, elem_idx, 0),
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let (t, a, b) = self.tag_and_args();
        buf.push(t);
        buf.extend(a.to_le_bytes());
        buf.extend(b.to_le_bytes());
    }

    pub fn parse(s: &[u8]) -> ParseResult<Self> {
        let (s, t) = le_u8(s)?;
        let (s, a) = le_u32(s)?;
        let (s, b) = le_u32(s)?;

        let id = match t {
            1 => Self::Scope {
                thread_id: a as u16,
                level: b as u8,
            },
            2 => Self::NonScope {
                thread_id: a as u16,
                level: b as u8,
            },
            3 => Self::MemAlloc { thread_id: a as u16 },
            4 => Self::MemDealloc { thread_id: a as u16 },
            5 => Self::MemPlot { thread_id: a as u16 },
            6 => Self::CtxSwitch { thread_id: a as u16 },
            7 => Self::SoftIrq { thread_id: a as u16 },
            8 => Self::LockWait { thread_id: a as u16 },
            9 => Self::MemSnapshots { thread_id: a as u16 },
            10 => Self::LockUse,
            11 => Self::LockNtf,
            12 => Self::CoreUsage,
            13 => Self::Marker,
            14 => Self::Elem { elem_idx: a },
            _ => {
                return Err(nom::Err::Failure(
                    nom::error::ParseError::from_error_kind(
                        s,
                        nom::error::ErrorKind::Tag,
                    ),
                ))
            }
        };

        Ok((s, id))
    }
}

/// The directory written as the final block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Directory {
    /// Per stream: where its chunk-location table block lives.
    pub streams: Vec<(StreamId, ChunkLoc)>,
    /// Per stream or elem: where its MR pyramid block lives.
    pub pyramids: Vec<(StreamId, ChunkLoc)>,
    /// Singleton table blocks (session info, string/thread/lock/elem
    /// tables).
    pub tables: Vec<(BlockKind, ChunkLoc)>,
}

impl Directory {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            12 + (self.streams.len() + self.pyramids.len())
                * (StreamId::SIZE + ChunkLoc::SIZE)
                + self.tables.len() * (1 + ChunkLoc::SIZE),
        );

        for list in [&self.streams, &self.pyramids] {
            buf.extend((list.len() as u32).to_le_bytes());
            for (id, loc) in list {
                id.encode_into(&mut buf);
                loc.encode_into(&mut buf);
            }
        }

        buf.extend((self.tables.len() as u32).to_le_bytes());
        for (kind, loc) in &self.tables {
            buf.push(*kind as u8);
            loc.encode_into(&mut buf);
        }

        buf
    }

    pub fn parse(s: &[u8]) -> ParseResult<Self> {
        fn stream_entry(s: &[u8]) -> ParseResult<(StreamId, ChunkLoc)> {
            let (s, id) = StreamId::parse(s)?;
            let (s, loc) = ChunkLoc::parse(s)?;
            Ok((s, (id, loc)))
        }

        fn table_entry(s: &[u8]) -> ParseResult<(BlockKind, ChunkLoc)> {
            let (s, raw) = le_u8(s)?;
            let kind = BlockKind::try_from(raw).map_err(|_| {
                nom::Err::Failure(nom::error::ParseError::from_error_kind(
                    s,
                    nom::error::ErrorKind::Tag,
                ))
            })?;
            let (s, loc) = ChunkLoc::parse(s)?;
            Ok((s, (kind, loc)))
        }

        let (s, stream_qty) = context("directory stream count", le_u32)(s)?;
        let (s, streams) = count(stream_entry, stream_qty as usize)(s)?;
        let (s, pyramid_qty) = context("directory pyramid count", le_u32)(s)?;
        let (s, pyramids) = count(stream_entry, pyramid_qty as usize)(s)?;
        let (s, table_qty) = context("directory table count", le_u32)(s)?;
        let (s, tables) = count(table_entry, table_qty as usize)(s)?;

        Ok((
            s,
            Self {
                streams,
                pyramids,
                tables,
            },
        ))
    }

    pub fn find_table(&self, kind: BlockKind) -> Option<ChunkLoc> {
        self.tables.iter().find(|(k, _)| *k == kind).map(|(_, l)| *l)
    }
}

/// One stored event, the unit of every event chunk.
///
/// Unlike the wire event, `name_idx` is a session string index (or a
/// built-in name id) and the tick has been resolved and scaled to
/// nanoseconds. For scope entries the payload carries the duration.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Evt {
    pub thread_id: u16,
    pub line_nbr: u16,
    pub kind: u8,
    pub flags: u8,
    pub level: u8,
    pub name_idx: u32,
    pub value: u32,
    pub time_ns: u64,
    pub payload: u64,
}

impl Evt {
    pub const SIZE: usize = 32;

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend(self.thread_id.to_le_bytes());
        buf.extend(self.line_nbr.to_le_bytes());
        buf.push(self.kind);
        buf.push(self.flags);
        buf.push(self.level);
        buf.push(0);
        buf.extend(self.name_idx.to_le_bytes());
        buf.extend(self.value.to_le_bytes());
        buf.extend(self.time_ns.to_le_bytes());
        buf.extend(self.payload.to_le_bytes());
    }

    pub fn parse(s: &[u8]) -> ParseResult<Self> {
        let (s, thread_id) = nom::number::complete::le_u16(s)?;
        let (s, line_nbr) = nom::number::complete::le_u16(s)?;
        let (s, kind) = le_u8(s)?;
        let (s, flags) = le_u8(s)?;
        let (s, level) = le_u8(s)?;
        let (s, _pad) = le_u8(s)?;
        let (s, name_idx) = le_u32(s)?;
        let (s, value) = le_u32(s)?;
        let (s, time_ns) = le_u64(s)?;
        let (s, payload) = le_u64(s)?;

        Ok((
            s,
            Self {
                thread_id,
                line_nbr,
                kind,
                flags,
                level,
                name_idx,
                value,
                time_ns,
                payload,
            },
        ))
    }
}

pub fn encode_events(events: &[Evt]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(events.len() * Evt::SIZE);
    for e in events {
        e.encode_into(&mut buf);
    }
    buf
}

pub fn parse_events(s: &[u8]) -> Result<Vec<Evt>> {
    let qty = s.len() / Evt::SIZE;
    let (_, events) = count(Evt::parse, qty)(s).map_err(Error::from)?;
    Ok(events)
}

/// Appends blocks to a temporary file, renamed into place at finalization.
pub struct RecordWriter {
    writer: BufWriter<File>,
    final_path: PathBuf,
    tmp_path: PathBuf,
    offset: u64,
    scratch: Vec<u8>,
}

fn storage_err(e: std::io::Error) -> Error {
    Error::StorageWriteFailed(e.to_string())
}

impl RecordWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp_path = PathBuf::from(tmp);

        let file = File::create(&tmp_path).map_err(storage_err)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&MAGIC).map_err(storage_err)?;
        writer.write_all(&[FORMAT_VERSION]).map_err(storage_err)?;

        debug!("recording to {}", tmp_path.display());

        Ok(Self {
            writer,
            final_path: path.to_path_buf(),
            tmp_path,
            offset: (MAGIC.len() + 1) as u64,
            scratch: Vec::new(),
        })
    }

    /// Compress and append one block; returns where it landed.
    pub fn write_block(&mut self, kind: BlockKind, body: &[u8]) -> Result<ChunkLoc> {
        self.scratch = lz4_flex::block::compress(body);

        let (kind_byte, payload): (u8, &[u8]) = if self.scratch.len() < body.len() {
            (kind as u8, self.scratch.as_slice())
        } else {
            (kind as u8 | STORED_BIT, body)
        };

        let loc = ChunkLoc {
            offset: self.offset,
            uncompressed: body.len() as u32,
            compressed: payload.len() as u32,
        };

        self.writer.write_all(&[kind_byte]).map_err(storage_err)?;
        self.writer
            .write_all(&(loc.uncompressed).to_le_bytes())
            .map_err(storage_err)?;
        self.writer
            .write_all(&(loc.compressed).to_le_bytes())
            .map_err(storage_err)?;
        self.writer.write_all(payload).map_err(storage_err)?;

        self.offset += (1 + 4 + 4 + payload.len()) as u64;

        Ok(loc)
    }

    /// Write the directory and trailing offset, fsync, and atomically
    /// publish the record under its final name.
    pub fn finalize(mut self, directory: &Directory) -> Result<PathBuf> {
        let dir_loc = self.write_block(BlockKind::Directory, &directory.encode())?;
        self.writer
            .write_all(&dir_loc.offset.to_le_bytes())
            .map_err(storage_err)?;

        self.writer.flush().map_err(storage_err)?;
        self.writer.get_ref().sync_all().map_err(storage_err)?;

        std::fs::rename(&self.tmp_path, &self.final_path).map_err(storage_err)?;
        debug!("record published at {}", self.final_path.display());

        Ok(self.final_path.clone())
    }

    /// Discard the temporary file (session aborted before any content
    /// worth keeping was written).
    pub fn discard(self) {
        drop(self.writer);
        std::fs::remove_file(&self.tmp_path).ok();
    }
}

/// Reads back a finalized record.
pub struct RecordReader {
    file: File,
    pub directory: Directory,
}

impl RecordReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;

        let mut head = [0u8; 5];
        file.read_exact(&mut head)?;
        if head[0..4] != MAGIC {
            return Err(Error::CorruptRecord("bad magic"));
        }
        if head[4] != FORMAT_VERSION {
            return Err(Error::CorruptRecord("unsupported format version"));
        }

        let len = file.seek(SeekFrom::End(0))?;
        if len < 13 {
            return Err(Error::CorruptRecord("file too short"));
        }
        file.seek(SeekFrom::End(-8))?;
        let mut tail = [0u8; 8];
        file.read_exact(&mut tail)?;
        let dir_offset = u64::from_le_bytes(tail);

        let mut reader = Self {
            file,
            directory: Directory::default(),
        };

        let (kind, body) = reader.read_block_at(dir_offset)?;
        if kind != BlockKind::Directory {
            return Err(Error::CorruptRecord("trailing offset not a directory"));
        }
        let (_, directory) = Directory::parse(&body).map_err(Error::from)?;
        reader.directory = directory;

        Ok(reader)
    }

    /// Read and decompress the block starting at `offset`.
    pub fn read_block_at(&mut self, offset: u64) -> Result<(BlockKind, Vec<u8>)> {
        self.file.seek(SeekFrom::Start(offset))?;

        let mut header = [0u8; 9];
        self.file.read_exact(&mut header)?;
        let kind_byte = header[0];
        let uncompressed = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
        let compressed = u32::from_le_bytes(header[5..9].try_into().unwrap()) as usize;

        let kind = BlockKind::try_from(kind_byte & !STORED_BIT)
            .map_err(|_| Error::CorruptRecord("unknown block kind"))?;

        let mut payload = vec![0u8; compressed];
        self.file.read_exact(&mut payload)?;

        let body = if kind_byte & STORED_BIT != 0 {
            payload
        } else {
            lz4_flex::block::decompress(&payload, uncompressed)
                .map_err(|_| Error::CorruptRecord("block decompression failed"))?
        };

        if body.len() != uncompressed {
            return Err(Error::CorruptRecord("block length mismatch"));
        }

        Ok((kind, body))
    }

    pub fn read_block(&mut self, loc: ChunkLoc) -> Result<(BlockKind, Vec<u8>)> {
        self.read_block_at(loc.offset)
    }

    /// Resolve a stream's chunk-location table from the directory.
    pub fn stream_chunk_locs(&mut self, id: StreamId) -> Result<Vec<ChunkLoc>> {
        let table_loc = match self
            .directory
            .streams
            .iter()
            .find(|(sid, _)| *sid == id)
        {
            Some((_, loc)) => *loc,
            None => return Ok(vec![]),
        };

        let (kind, body) = self.read_block(table_loc)?;
        if kind != BlockKind::ChunkLocTable {
            return Err(Error::CorruptRecord("stream table has wrong kind"));
        }

        let qty = body.len() / ChunkLoc::SIZE;
        let (_, locs) = count(ChunkLoc::parse, qty)(body.as_slice()).map_err(Error::from)?;
        Ok(locs)
    }

    /// Read every event of one stream, in chunk order.
    pub fn stream_events(&mut self, id: StreamId) -> Result<Vec<Evt>> {
        let locs = self.stream_chunk_locs(id)?;

        let mut events = Vec::new();
        for loc in locs {
            let (kind, body) = self.read_block(loc)?;
            if kind != BlockKind::EventChunk {
                return Err(Error::CorruptRecord("event stream chunk has wrong kind"));
            }
            events.extend(parse_events(&body)?);
        }

        Ok(events)
    }
}

/// Encode a chunk-location table body.
pub fn encode_chunk_locs(locs: &[ChunkLoc]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(locs.len() * ChunkLoc::SIZE);
    for loc in locs {
        loc.encode_into(&mut buf);
    }
    buf
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn block_round_trip_compressible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.plrc");

        let mut w = RecordWriter::create(&path).unwrap();
        let body = vec![0x41u8; 4096];
        let loc = w.write_block(BlockKind::EventChunk, &body).unwrap();
        assert!(loc.compressed < loc.uncompressed);

        w.finalize(&Directory::default()).unwrap();

        let mut r = RecordReader::open(&path).unwrap();
        let (kind, got) = r.read_block(loc).unwrap();
        assert_eq!(kind, BlockKind::EventChunk);
        assert_eq!(got, body);
    }

    #[test]
    fn incompressible_block_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.plrc");

        let mut w = RecordWriter::create(&path).unwrap();
        // High-entropy body: xorshift bytes.
        let mut x = 0x12345678u32;
        let body = (0..256)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect::<Vec<_>>();
        let loc = w.write_block(BlockKind::EventChunk, &body).unwrap();
        assert_eq!(loc.compressed, loc.uncompressed);

        w.finalize(&Directory::default()).unwrap();

        let mut r = RecordReader::open(&path).unwrap();
        let (_, got) = r.read_block(loc).unwrap();
        assert_eq!(got, body);
    }

    #[test]
    fn directory_round_trip() {
        let d = Directory {
            streams: vec![
                (
                    StreamId::Scope {
                        thread_id: 2,
                        level: 3,
                    },
                    ChunkLoc {
                        offset: 100,
                        uncompressed: 50,
                        compressed: 20,
                    },
                ),
                (StreamId::LockUse, ChunkLoc::default()),
                (StreamId::Elem { elem_idx: 9 }, ChunkLoc::default()),
            ],
            pyramids: vec![(
                StreamId::Scope {
                    thread_id: 2,
                    level: 3,
                },
                ChunkLoc {
                    offset: 300,
                    uncompressed: 10,
                    compressed: 10,
                },
            )],
            tables: vec![(BlockKind::StringTable, ChunkLoc::default())],
        };

        let raw = d.encode();
        let (rest, parsed) = Directory::parse(&raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, d);
    }

    #[test]
    fn finalize_is_the_commit_point() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.plrc");

        let mut w = RecordWriter::create(&path).unwrap();
        w.write_block(BlockKind::EventChunk, &[1, 2, 3]).unwrap();

        // Not visible before finalize.
        assert!(!path.exists());

        w.finalize(&Directory::default()).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("plrc.tmp").exists());
    }

    #[test]
    fn discard_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.plrc");

        let w = RecordWriter::create(&path).unwrap();
        w.discard();

        assert!(!path.exists());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn evt_round_trip() {
        let e = Evt {
            thread_id: 1,
            line_nbr: 44,
            kind: 0,
            flags: 2,
            level: 7,
            name_idx: 0x7000_0003,
            value: 12,
            time_ns: 123_456_789,
            payload: 500,
        };

        let mut buf = Vec::new();
        e.encode_into(&mut buf);
        assert_eq!(buf.len(), Evt::SIZE);

        let got = parse_events(&buf).unwrap();
        assert_eq!(got, vec![e]);
    }

    #[test]
    fn stream_events_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.plrc");

        let id = StreamId::Scope {
            thread_id: 0,
            level: 0,
        };

        let mut w = RecordWriter::create(&path).unwrap();

        let events = (0..10u64)
            .map(|i| Evt {
                time_ns: i * 100,
                payload: 50,
                ..Default::default()
            })
            .collect::<Vec<_>>();

        let c1 = w
            .write_block(BlockKind::EventChunk, &encode_events(&events[..6]))
            .unwrap();
        let c2 = w
            .write_block(BlockKind::EventChunk, &encode_events(&events[6..]))
            .unwrap();
        let table = w
            .write_block(BlockKind::ChunkLocTable, &encode_chunk_locs(&[c1, c2]))
            .unwrap();

        let directory = Directory {
            streams: vec![(id, table)],
            ..Default::default()
        };
        w.finalize(&directory).unwrap();

        let mut r = RecordReader::open(&path).unwrap();
        assert_eq!(r.stream_events(id).unwrap(), events);
        // Unknown streams read as empty.
        assert!(r
            .stream_events(StreamId::Marker)
            .unwrap()
            .is_empty());
    }
}
