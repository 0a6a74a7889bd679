// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! PLRC recorder: the recording core of a profiling and tracing system.
//!
//! An instrumented process streams framed binary events (scopes, memory
//! operations, locks, context switches, markers, plots) over TCP or from
//! a captured file. This crate ingests that stream, reconstructs a
//! hierarchical, multi-resolution, on-disk representation suitable for
//! interactive exploration, and maintains an in-memory delta view for a
//! live UI.
//!
//! The pipeline, in data-flow order:
//!
//! * [transport] delivers bytes (TCP acceptor or file replayer);
//! * [session] performs the HELLO handshake and fixes the session's
//!   encoding flags;
//! * [frame] reassembles and decodes frames ([wire] holds the encodings);
//! * [recording] routes each event into per-thread builders ([builder]),
//!   canonicalizes observable points ([elem]), maintains multi-resolution
//!   pyramids ([pyramid]), and appends compressed chunks to the record
//!   file ([record]);
//! * [delta] snapshots what changed for the live UI, crossing threads via
//!   the lock-free [exchange] primitives;
//! * [collector] wires the rx/recorder/tx worker threads together.
//!
//! [replay_alloc] is the viewer-side companion: it replays a recorded
//! alloc/free stream through a deterministic heap model to visualize
//! fragmentation.
//!
//! Short wrapped timestamps are reconciled by [shortdate]; [lookup] is the
//! flat open-addressing table used on the hot paths; [hashing] holds the
//! FNV-1a identity scheme.

pub mod builder;
pub mod collector;
pub mod consts;
pub mod delta;
pub mod elem;
pub mod error;
pub mod exchange;
pub mod frame;
pub mod hashing;
pub mod lookup;
pub mod pyramid;
pub mod record;
pub mod recording;
pub mod replay_alloc;
pub mod session;
pub mod shortdate;
pub mod transport;
pub mod wire;
