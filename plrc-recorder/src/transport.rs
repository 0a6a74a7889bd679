// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Byte transports.
//!
//! A [Transport] delivers the raw session byte stream to the frame parser,
//! either live from an instrumented process over TCP or replayed from a
//! previously captured file. Both honor a shared [Stop] flag so blocking
//! reads return EOF cooperatively on shutdown.

use crate::error::{Error, Result};
use log::{debug, info, warn};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative shutdown flag shared by every blocking loop.
#[derive(Clone, Default)]
pub struct Stop(Arc<AtomicBool>);

impl Stop {
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A blocking, stoppable byte source with a best-effort back channel.
pub trait Transport: Send {
    /// Read up to `buf.len()` bytes. 0 means EOF (or stop requested).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write bytes back to the peer. A no-op for replayed files.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// An independent write handle for the tx thread, when the transport
    /// has a back channel.
    fn split_writer(&self) -> Option<Box<dyn TransportWriter>> {
        None
    }
}

/// The outbound half of a bidirectional transport.
pub trait TransportWriter: Send {
    fn write(&mut self, buf: &[u8]) -> Result<()>;
}

const POLL_PERIOD: Duration = Duration::from_millis(50);

/// Accepts one instrumented process at a time on a TCP port.
pub struct TcpAcceptor {
    listener: Arc<TcpListener>,
    stop: Stop,
}

impl TcpAcceptor {
    pub fn bind(port: u16, stop: Stop) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        info!("listening for instrumented processes on port {}", port);

        Ok(Self {
            listener: Arc::new(listener),
            stop,
        })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Block until a client connects or stop is requested.
    pub fn accept(&self) -> Result<Option<TcpTransport>> {
        loop {
            if self.stop.is_set() {
                return Ok(None);
            }

            match self.listener.accept() {
                Ok((stream, addr)) => {
                    info!("client connected from {}", addr);
                    stream.set_nodelay(true).ok();
                    stream.set_read_timeout(Some(POLL_PERIOD))?;
                    return Ok(Some(TcpTransport {
                        stream,
                        listener: Arc::clone(&self.listener),
                        stop: self.stop.clone(),
                    }));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(POLL_PERIOD);
                }
                Err(e) => return Err(Error::Io(e.to_string())),
            }
        }
    }
}

/// One live client connection.
pub struct TcpTransport {
    stream: TcpStream,
    listener: Arc<TcpListener>,
    stop: Stop,
}

impl TcpTransport {
    /// One client at a time: close any connection attempt made while this
    /// one is live.
    fn reject_pending(&self) {
        while let Ok((stream, addr)) = self.listener.accept() {
            warn!("rejecting concurrent client from {}", addr);
            drop(stream);
        }
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.stop.is_set() {
                return Ok(0);
            }

            match self.stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock
                        || e.kind() == ErrorKind::TimedOut =>
                {
                    self.reject_pending();
                }
                Err(e)
                    if e.kind() == ErrorKind::ConnectionReset
                        || e.kind() == ErrorKind::BrokenPipe =>
                {
                    debug!("transport aborted by peer: {}", e);
                    return Ok(0);
                }
                Err(e) => return Err(Error::Io(e.to_string())),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf)?;
        Ok(())
    }

    fn split_writer(&self) -> Option<Box<dyn TransportWriter>> {
        self.stream
            .try_clone()
            .ok()
            .map(|stream| Box::new(TcpWriter { stream }) as Box<dyn TransportWriter>)
    }
}

/// Outbound handle of a [TcpTransport].
pub struct TcpWriter {
    stream: TcpStream,
}

impl TransportWriter for TcpWriter {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf)?;
        Ok(())
    }
}

/// Replays a previously captured raw session stream.
pub struct FileReplayer {
    reader: std::io::BufReader<std::fs::File>,
    stop: Stop,
}

impl FileReplayer {
    pub fn open(path: &std::path::Path, stop: Stop) -> Result<Self> {
        debug!("replaying session from {}", path.display());
        let file = std::fs::File::open(path)?;

        Ok(Self {
            reader: std::io::BufReader::new(file),
            stop,
        })
    }
}

impl Transport for FileReplayer {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.stop.is_set() {
            return Ok(0);
        }

        Ok(self.reader.read(buf)?)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// An in-memory transport for tests and synthetic sessions.
pub struct SliceTransport {
    data: Vec<u8>,
    pos: usize,
    pub written: Vec<u8>,
}

impl SliceTransport {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            written: Vec::new(),
        }
    }
}

impl Transport for SliceTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.written.extend_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tcp_accept_read_and_stop() {
        let stop = Stop::default();
        let acceptor = TcpAcceptor::bind(0, stop.clone()).unwrap();
        let port = acceptor.local_port().unwrap();

        let client = std::thread::spawn(move || {
            let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
            s.write_all(b"abcdef").unwrap();
            std::thread::sleep(Duration::from_millis(100));
        });

        let mut transport = acceptor.accept().unwrap().unwrap();

        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        while got.len() < 6 {
            let n = transport.read(&mut buf).unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"abcdef");

        // Stop turns the blocking read into EOF.
        stop.set();
        assert_eq!(transport.read(&mut buf).unwrap(), 0);

        client.join().unwrap();
    }

    #[test]
    fn stopped_accept_returns_none() {
        let stop = Stop::default();
        let acceptor = TcpAcceptor::bind(0, stop.clone()).unwrap();
        stop.set();
        assert!(acceptor.accept().unwrap().is_none());
    }

    #[test]
    fn file_replayer_reads_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.raw");
        std::fs::write(&path, b"0123456789").unwrap();

        let mut t = FileReplayer::open(&path, Stop::default()).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(t.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
    }
}
