// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Session collection threads.
//!
//! [Collector::start] spawns the long-lived workers of one session:
//!
//! * `rx` performs the handshake, then reads the transport and feeds the
//!   frame parser; decoded batches go to `recorder` through a bounded
//!   queue (blocking when full, which backpressures the TCP socket all
//!   the way to the instrumented process);
//! * `recorder` owns the whole [Recording] state, consumes the queue, and
//!   publishes a delta snapshot on a timer (the delta worker is folded in);
//! * `tx` forwards remote-control commands to the instrumented process,
//!   fed through a single-slot exchanger and woken by a condvar.
//!
//! One atomic stop flag is polled at every suspension point. The UI thread
//! only ever touches the exchangers.

use crate::{
    consts::MAX_REMOTE_COMMAND_BYTE_SIZE,
    delta::{DeltaPublisher, DeltaSnapshot},
    error::{Error, Result, SessionErrorKind},
    exchange::MsgExchanger,
    frame::{Frame, FrameParser},
    recording::Recording,
    session::negotiate,
    transport::{Stop, Transport},
    wire::{FrameFlags, FrameHeader, FrameType, RawEvent},
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Capacity of the rx-to-recorder queue, in decoded frames.
const HANDOFF_QUEUE_LEN: usize = 16;

/// What rx hands to the recorder.
enum RecorderMsg {
    Begin(crate::session::SessionInfo),
    Strings(Vec<(u64, Vec<u8>)>),
    Events {
        buffer_id: u32,
        sync_tick: Option<u64>,
        events: Vec<RawEvent>,
    },
    /// Transport ended; true when it died mid-frame.
    Eof { mid_frame: bool },
}

/// A live collection session.
pub struct Collector {
    stop: Stop,
    rx_thread: Option<JoinHandle<()>>,
    tx_thread: Option<JoinHandle<()>>,
    recorder_thread: Option<JoinHandle<Result<Option<PathBuf>>>>,
    delta: Arc<DeltaPublisher>,
    commands: Arc<MsgExchanger<Vec<u8>>>,
    tx_wakeup: Arc<(Mutex<bool>, Condvar)>,
}

impl Collector {
    /// Spawn the session workers over an established transport.
    pub fn start(
        transport: Box<dyn Transport>,
        storage_dir: PathBuf,
        record_name: String,
        stop: Stop,
    ) -> Self {
        let delta = Arc::new(DeltaPublisher::default());
        let commands = Arc::new(MsgExchanger::<Vec<u8>>::default());
        let tx_wakeup = Arc::new((Mutex::new(false), Condvar::new()));

        let (sender, receiver) = bounded::<RecorderMsg>(HANDOFF_QUEUE_LEN);

        let tx_writer = transport.split_writer();

        let rx_stop = stop.clone();
        let rx_thread = std::thread::Builder::new()
            .name("plrc-rx".to_string())
            .spawn(move || run_rx(transport, sender, rx_stop))
            .expect("spawning rx thread");

        let rec_stop = stop.clone();
        let rec_delta = Arc::clone(&delta);
        let recorder_thread = std::thread::Builder::new()
            .name("plrc-recorder".to_string())
            .spawn(move || run_recorder(receiver, storage_dir, record_name, rec_delta, rec_stop))
            .expect("spawning recorder thread");

        let tx_stop = stop.clone();
        let tx_commands = Arc::clone(&commands);
        let tx_wake = Arc::clone(&tx_wakeup);
        let tx_thread = std::thread::Builder::new()
            .name("plrc-tx".to_string())
            .spawn(move || run_tx(tx_writer, tx_commands, tx_wake, tx_stop))
            .expect("spawning tx thread");

        Self {
            stop,
            rx_thread: Some(rx_thread),
            tx_thread: Some(tx_thread),
            recorder_thread: Some(recorder_thread),
            delta,
            commands,
            tx_wakeup,
        }
    }

    /// The channel live delta snapshots are published on.
    pub fn delta(&self) -> &Arc<DeltaPublisher> {
        &self.delta
    }

    /// Queue one remote command for the instrumented process.
    ///
    /// False when the previous command is still in flight.
    pub fn send_command(&self, command: &[u8]) -> bool {
        if command.len() > MAX_REMOTE_COMMAND_BYTE_SIZE {
            return false;
        }

        match self.commands.acquire_free() {
            None => false,
            Some(mut msg) => {
                msg.clear();
                msg.extend_from_slice(command);
                self.commands.send(msg);

                let (lock, cv) = &*self.tx_wakeup;
                *lock.lock().unwrap() = true;
                cv.notify_one();

                true
            }
        }
    }

    /// Request shutdown and wait for the workers; returns the finalized
    /// record path, if a session was recorded.
    pub fn shutdown(mut self) -> Result<Option<PathBuf>> {
        self.stop.set();
        let (lock, cv) = &*self.tx_wakeup;
        *lock.lock().unwrap() = true;
        cv.notify_one();

        if let Some(h) = self.rx_thread.take() {
            h.join().map_err(|_| Error::Io("rx thread panicked".to_string()))?;
        }
        if let Some(h) = self.tx_thread.take() {
            h.join().map_err(|_| Error::Io("tx thread panicked".to_string()))?;
        }
        match self.recorder_thread.take() {
            Some(h) => h
                .join()
                .map_err(|_| Error::Io("recorder thread panicked".to_string()))?,
            None => Ok(None),
        }
    }

    /// Wait for the session to end on its own (transport EOF or BYE).
    pub fn join(mut self) -> Result<Option<PathBuf>> {
        if let Some(h) = self.rx_thread.take() {
            h.join().map_err(|_| Error::Io("rx thread panicked".to_string()))?;
        }
        // rx exiting guarantees the recorder drains and exits; release tx.
        self.stop.set();
        let (lock, cv) = &*self.tx_wakeup;
        *lock.lock().unwrap() = true;
        cv.notify_one();

        if let Some(h) = self.tx_thread.take() {
            h.join().map_err(|_| Error::Io("tx thread panicked".to_string()))?;
        }
        match self.recorder_thread.take() {
            Some(h) => h
                .join()
                .map_err(|_| Error::Io("recorder thread panicked".to_string()))?,
            None => Ok(None),
        }
    }
}

/// The rx worker: handshake, then transport bytes to decoded frames.
fn run_rx(mut transport: Box<dyn Transport>, sender: Sender<RecorderMsg>, stop: Stop) {
    let info = match negotiate(transport.as_mut()) {
        Ok(info) => info,
        Err(e) => {
            error!("handshake failed: {}", e);
            sender.send(RecorderMsg::Eof { mid_frame: false }).ok();
            return;
        }
    };

    let flags = info.flags;
    if sender.send(RecorderMsg::Begin(info)).is_err() {
        return;
    }

    let mut parser = FrameParser::new(flags);
    let mut buf = vec![0u8; 256 * 1024];
    let mut frames = Vec::new();

    loop {
        if stop.is_set() {
            break;
        }

        let n = match transport.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("transport read failed: {}", e);
                break;
            }
        };

        if let Err(e) = parser.push(&buf[..n], &mut frames) {
            error!("frame parsing failed: {}", e);
            sender.send(RecorderMsg::Eof { mid_frame: true }).ok();
            return;
        }

        let mut saw_bye = false;
        for frame in frames.drain(..) {
            let msg = match frame {
                Frame::Strings(records) => RecorderMsg::Strings(records),
                Frame::Events {
                    buffer_id,
                    sync_tick,
                    events,
                    ..
                } => RecorderMsg::Events {
                    buffer_id,
                    sync_tick,
                    events,
                },
                Frame::Remote(body) => {
                    debug!("remote response of {} bytes", body.len());
                    continue;
                }
                Frame::Bye => {
                    saw_bye = true;
                    break;
                }
            };

            // Blocking send: the bounded queue backpressures the socket.
            if sender.send(msg).is_err() {
                return;
            }
        }

        if saw_bye {
            info!("session closed by peer");
            break;
        }
    }

    sender
        .send(RecorderMsg::Eof {
            mid_frame: !parser.is_idle(),
        })
        .ok();
}

/// Outcome of applying one queue message.
enum Step {
    Continue,
    /// Session is over; finalize. True when the transport died mid-frame.
    Finish { mid_frame: bool },
}

/// Apply one queue message to the (possibly not yet started) recording.
fn apply_msg(
    recording: &mut Option<Recording>,
    storage_dir: &PathBuf,
    record_name: &str,
    msg: RecorderMsg,
) -> Result<Step> {
    match msg {
        RecorderMsg::Begin(info) => {
            *recording = Some(Recording::begin(storage_dir, record_name, info)?);
            Ok(Step::Continue)
        }
        RecorderMsg::Strings(records) => {
            if let Some(rec) = recording.as_mut() {
                for (hash, value) in records {
                    rec.store_new_string(0, hash, &value);
                }
            }
            Ok(Step::Continue)
        }
        RecorderMsg::Events {
            buffer_id,
            sync_tick,
            events,
        } => {
            if let Some(rec) = recording.as_mut() {
                rec.store_new_events(0, buffer_id, sync_tick, &events)?;
            }
            Ok(Step::Continue)
        }
        RecorderMsg::Eof { mid_frame } => Ok(Step::Finish { mid_frame }),
    }
}

/// The recorder worker: consumes decoded frames, owns all build state,
/// publishes deltas on a timer.
fn run_recorder(
    receiver: Receiver<RecorderMsg>,
    storage_dir: PathBuf,
    record_name: String,
    delta: Arc<DeltaPublisher>,
    stop: Stop,
) -> Result<Option<PathBuf>> {
    let mut recording: Option<Recording> = None;
    let delta_period = Recording::delta_period();
    let mut next_delta = Instant::now() + delta_period;

    let finalize = |mut recording: Option<Recording>,
                    mid_frame: bool,
                    delta: &DeltaPublisher|
     -> Result<Option<PathBuf>> {
        match recording.take() {
            Some(mut rec) => {
                if mid_frame {
                    rec.count_error(SessionErrorKind::TruncatedBody);
                }
                publish_delta(&mut rec, delta);
                rec.end().map(Some)
            }
            None => Ok(None),
        }
    };

    loop {
        let timeout = next_delta.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(timeout) {
            Ok(msg) => match apply_msg(&mut recording, &storage_dir, &record_name, msg) {
                Ok(Step::Continue) => {}
                Ok(Step::Finish { mid_frame }) => {
                    return finalize(recording, mid_frame, &delta);
                }
                Err(e) => {
                    // Fatal (e.g. storage write failed): finalize what we
                    // have and surface the error.
                    error!("recording failed: {}", e);
                    finalize(recording, false, &delta).ok();
                    return Err(e);
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                if let Some(rec) = recording.as_mut() {
                    publish_delta(rec, &delta);
                }
                next_delta = Instant::now() + delta_period;

                // On stop, rx pushes a final Eof; drain up to it, but do
                // not wait forever if rx is already gone.
                if stop.is_set() {
                    while let Ok(msg) = receiver.recv_timeout(Duration::from_millis(200)) {
                        match apply_msg(&mut recording, &storage_dir, &record_name, msg) {
                            Ok(Step::Continue) => {}
                            Ok(Step::Finish { mid_frame }) => {
                                return finalize(recording, mid_frame, &delta);
                            }
                            Err(e) => {
                                error!("recording failed: {}", e);
                                finalize(recording, false, &delta).ok();
                                return Err(e);
                            }
                        }
                    }
                    return finalize(recording, false, &delta);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                // rx died without an EOF marker: treat as mid-frame.
                return finalize(recording, true, &delta);
            }
        }
    }
}

fn publish_delta(rec: &mut Recording, delta: &DeltaPublisher) {
    if let Some(mut snapshot) = delta.acquire() {
        rec.create_delta(&mut snapshot);
        delta.publish(snapshot);
    }
}

/// The tx worker: forwards queued remote commands to the peer.
fn run_tx(
    writer: Option<Box<dyn crate::transport::TransportWriter>>,
    commands: Arc<MsgExchanger<Vec<u8>>>,
    wakeup: Arc<(Mutex<bool>, Condvar)>,
    stop: Stop,
) {
    let mut writer = match writer {
        Some(w) => w,
        None => {
            // Replay transports have no back channel; drain and drop.
            while !stop.is_set() {
                let (lock, cv) = &*wakeup;
                let guard = lock.lock().unwrap();
                let mut guard = cv
                    .wait_timeout(guard, Duration::from_millis(200))
                    .unwrap()
                    .0;
                *guard = false;
                drop(guard);
                if let Some(msg) = commands.receive() {
                    commands.release(msg);
                }
            }
            return;
        }
    };

    while !stop.is_set() {
        {
            let (lock, cv) = &*wakeup;
            let guard = lock.lock().unwrap();
            let mut guard = cv
                .wait_timeout(guard, Duration::from_millis(200))
                .unwrap()
                .0;
            *guard = false;
        }

        while let Some(msg) = commands.receive() {
            let header = FrameHeader {
                frame_type: FrameType::Remote as u8,
                flags: FrameFlags::empty(),
                count: 0,
                byte_len: msg.len() as u32,
            };
            let ok = writer.write(&header.encode()).is_ok() && writer.write(&msg).is_ok();
            commands.release(msg);
            if !ok {
                warn!("remote command transmission failed");
            }
        }
    }
}

/// Run one complete replay or live session to completion.
///
/// Convenience entry for the CLI: performs the handshake, records until
/// the transport ends, and returns the finalized record path.
pub fn run_session(
    transport: Box<dyn Transport>,
    storage_dir: PathBuf,
    record_name: String,
    stop: Stop,
) -> Result<Option<PathBuf>> {
    let collector = Collector::start(transport, storage_dir, record_name, stop);
    collector.join()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::encode_hello_frame;
    use crate::transport::SliceTransport;
    use crate::wire::{EventKind, Hello, SessionFlags, PROTOCOL_VERSION};
    use tempfile::TempDir;

    fn hello_bytes(flags: SessionFlags) -> Vec<u8> {
        encode_hello_frame(&Hello {
            protocol_version: PROTOCOL_VERSION,
            flags,
            tick_origin: 0,
            tick_to_ns: 1.0,
            app_name: "itest".to_string(),
            build_name: "b1".to_string(),
        })
    }

    fn string_frame(records: &[(u64, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (h, v) in records {
            body.extend(
                crate::wire::StringRecord {
                    hash: *h,
                    value: v.as_bytes(),
                }
                .encode(false),
            );
        }
        let mut raw = FrameHeader {
            frame_type: FrameType::Strings as u8,
            flags: FrameFlags::empty(),
            count: records.len() as u16,
            byte_len: body.len() as u32,
        }
        .encode()
        .to_vec();
        raw.extend(body);
        raw
    }

    fn event_frame(events: &[RawEvent]) -> Vec<u8> {
        let mut body = Vec::new();
        for e in events {
            body.extend(e.encode());
        }
        let mut raw = FrameHeader {
            frame_type: FrameType::Events as u8,
            flags: FrameFlags::empty(),
            count: events.len() as u16,
            byte_len: body.len() as u32,
        }
        .encode()
        .to_vec();
        raw.extend(body);
        raw
    }

    fn bye_frame() -> Vec<u8> {
        FrameHeader {
            frame_type: FrameType::Bye as u8,
            flags: FrameFlags::empty(),
            count: 0,
            byte_len: 0,
        }
        .encode()
        .to_vec()
    }

    fn scope(kind: EventKind, tick: u64) -> RawEvent {
        RawEvent {
            name_idx: 0,
            thread_id: 0,
            kind: kind as u8,
            flags: 0,
            line_nbr: 0,
            value: 0,
            tick,
            payload: 0,
        }
    }

    #[test]
    fn complete_session_produces_a_record() {
        let dir = TempDir::new().unwrap();

        let mut stream = hello_bytes(SessionFlags::empty());
        stream.extend(string_frame(&[(5, "A")]));
        stream.extend(event_frame(&[
            scope(EventKind::ScopeBegin, 100),
            scope(EventKind::ScopeEnd, 200),
        ]));
        stream.extend(bye_frame());

        let transport = Box::new(SliceTransport::new(stream));
        let path = run_session(
            transport,
            dir.path().to_path_buf(),
            "session".to_string(),
            Stop::default(),
        )
        .unwrap()
        .expect("a record should exist");

        let mut reader = crate::record::RecordReader::open(&path).unwrap();
        let scopes = reader
            .stream_events(crate::record::StreamId::Scope {
                thread_id: 0,
                level: 0,
            })
            .unwrap();
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].time_ns, 100);
        assert_eq!(scopes[0].payload, 100);
    }

    #[test]
    fn session_killed_mid_frame_still_finalizes() {
        let dir = TempDir::new().unwrap();

        let mut stream = hello_bytes(SessionFlags::empty());
        stream.extend(string_frame(&[(5, "A")]));
        stream.extend(event_frame(&[
            scope(EventKind::ScopeBegin, 100),
            scope(EventKind::ScopeEnd, 200),
        ]));
        // Half an event frame, then the transport dies.
        let half = event_frame(&[scope(EventKind::ScopeBegin, 300)]);
        stream.extend(&half[..half.len() / 2]);

        let transport = Box::new(SliceTransport::new(stream));
        let path = run_session(
            transport,
            dir.path().to_path_buf(),
            "crashed".to_string(),
            Stop::default(),
        )
        .unwrap()
        .expect("a record should exist");

        // The record opens and contains the complete scope pair.
        let mut reader = crate::record::RecordReader::open(&path).unwrap();
        let scopes = reader
            .stream_events(crate::record::StreamId::Scope {
                thread_id: 0,
                level: 0,
            })
            .unwrap();
        assert_eq!(scopes.len(), 1);
    }

    #[test]
    fn no_record_without_handshake() {
        let dir = TempDir::new().unwrap();

        let transport = Box::new(SliceTransport::new(vec![]));
        let path = run_session(
            transport,
            dir.path().to_path_buf(),
            "none".to_string(),
            Stop::default(),
        )
        .unwrap();

        assert!(path.is_none());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
