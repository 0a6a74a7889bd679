// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Session-wide constants.

/// Number of events batched into one storage chunk.
pub const CHUNK_SIZE: usize = 256;

/// Number of elem multi-resolution entries batched into one storage chunk.
///
/// Event chunks and elem chunks are storage-interchangeable:
/// `32 * CHUNK_SIZE == 4 * ELEM_CHUNK_SIZE`.
pub const ELEM_CHUNK_SIZE: usize = 2048;

/// Number of entries summarized by one scope speck at the next pyramid level.
pub const MR_SCOPE_SIZE: usize = 8;

/// Number of entries summarized by one elem speck at the next pyramid level.
pub const MR_ELEM_SIZE: usize = 8;

/// Maximum scope nesting depth per thread.
pub const MAX_LEVEL_QTY: usize = 254;

/// Maximum thread count per session.
pub const MAX_THREAD_QTY: usize = 254;

/// Maximum independent event streams per session.
pub const MAX_STREAM_QTY: usize = 8;

/// Upper bound on the body of a remote command frame.
pub const MAX_REMOTE_COMMAND_BYTE_SIZE: usize = 32 * 1024;

/// Upper bound on any frame body.
pub const MAX_FRAME_BYTE_SIZE: usize = 8 * 1024 * 1024;

/// Wall-clock period of live delta snapshots, in microseconds.
pub const DELTARECORD_PERIOD_US: u64 = 300_000;

/// A memory snapshot is taken every this many memory events per thread.
pub const MEMORY_SNAPSHOT_EVENT_INTERVAL: u32 = 4096;

/// Sentinel for "no index".
pub const INVALID_IDX: u32 = u32::MAX;

// Built-in name ids used to key synthetic elems. Outside the space reachable
// by interned strings (string indices are dense from 0).
pub const MEMORY_ALLOCSIZE_NAMEIDX: u32 = 0x7000_0000;
pub const MEMORY_ALLOCQTY_NAMEIDX: u32 = 0x7000_0001;
pub const MEMORY_DEALLOCQTY_NAMEIDX: u32 = 0x7000_0002;
pub const CTX_SWITCH_NAMEIDX: u32 = 0x7000_0003;
pub const CORE_USAGE_NAMEIDX: u32 = 0x7000_0004;
pub const SOFTIRQ_NAMEIDX: u32 = 0x7000_0006;
pub const LOCK_WAIT_NAMEIDX: u32 = 0x7000_0007;
pub const LOCK_USE_NAMEIDX: u32 = 0x7000_0008;
pub const LOCK_NTF_NAMEIDX: u32 = 0x7000_0009;
pub const MARKER_NAMEIDX: u32 = 0x7000_0011;

const _: () = assert!(32 * CHUNK_SIZE == 4 * ELEM_CHUNK_SIZE);
const _: () = assert!(CHUNK_SIZE % MR_SCOPE_SIZE == 0);
const _: () = assert!(ELEM_CHUNK_SIZE % MR_ELEM_SIZE == 0);
