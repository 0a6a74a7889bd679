// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Session negotiation.
//!
//! The first frame of every session is a HELLO describing the peer and the
//! encoding variants it will use. [negotiate] performs the exchange
//! synchronously on the transport before the frame parser takes over: it
//! validates the major protocol version, fixes the session's encoding
//! flags, and answers with a minimal ack.

use crate::{
    error::{Error, Result},
    transport::Transport,
    wire::{FrameFlags, FrameHeader, FrameType, Hello, SessionFlags, PROTOCOL_VERSION},
};
use log::{debug, info};

/// Everything negotiated at session start. Immutable for the session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionInfo {
    pub protocol_version: u16,
    pub flags: SessionFlags,
    pub tick_origin: u64,
    pub tick_to_ns: f64,
    pub app_name: String,
    pub build_name: String,
}

impl SessionInfo {
    pub fn is_date_short(&self) -> bool {
        self.flags
            .intersects(SessionFlags::DATE_SHORT | SessionFlags::COMPACT_MODEL)
    }
}

/// Read exactly `buf.len()` bytes, treating EOF as a handshake failure.
fn read_full(transport: &mut dyn Transport, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = transport.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(Error::Io(
                "transport closed during handshake".to_string(),
            ));
        }
        filled += n;
    }

    Ok(())
}

/// Perform the handshake on a fresh transport.
pub fn negotiate(transport: &mut dyn Transport) -> Result<SessionInfo> {
    let mut header_buf = [0u8; FrameHeader::SIZE];
    read_full(transport, &mut header_buf)?;

    let (_, header) = FrameHeader::parse(&header_buf).map_err(Error::from)?;
    if !matches!(FrameType::try_from(header.frame_type), Ok(FrameType::Hello)) {
        return Err(Error::FrameBeforeHello);
    }

    let mut body = vec![0u8; header.byte_len as usize];
    read_full(transport, &mut body)?;

    let (_, hello) = Hello::parse(&body).map_err(Error::from)?;

    let ours = (PROTOCOL_VERSION >> 8) as u8;
    if hello.major_version() != ours {
        return Err(Error::ProtocolVersionMismatch {
            peer: hello.major_version(),
            ours,
        });
    }

    // Minimal ack: a HELLO frame carrying our protocol version.
    let ack_body = PROTOCOL_VERSION.to_le_bytes();
    let ack_header = FrameHeader {
        frame_type: FrameType::Hello as u8,
        flags: FrameFlags::empty(),
        count: 0,
        byte_len: ack_body.len() as u32,
    };
    transport.write(&ack_header.encode())?;
    transport.write(&ack_body)?;

    info!(
        "session established: app '{}' build '{}' protocol {:#06x}",
        hello.app_name, hello.build_name, hello.protocol_version
    );
    debug!("session flags: {:?}", hello.flags);

    Ok(SessionInfo {
        protocol_version: hello.protocol_version,
        flags: hello.flags,
        tick_origin: hello.tick_origin,
        tick_to_ns: hello.tick_to_ns,
        app_name: hello.app_name,
        build_name: hello.build_name,
    })
}

/// Encode a HELLO frame for tests and synthetic sessions.
pub fn encode_hello_frame(hello: &Hello) -> Vec<u8> {
    let body = hello.encode();
    let mut raw = FrameHeader {
        frame_type: FrameType::Hello as u8,
        flags: FrameFlags::empty(),
        count: 0,
        byte_len: body.len() as u32,
    }
    .encode()
    .to_vec();
    raw.extend(body);
    raw
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::SliceTransport;

    fn sample_hello(version: u16) -> Hello {
        Hello {
            protocol_version: version,
            flags: SessionFlags::CONTROL_ENABLED,
            tick_origin: 5,
            tick_to_ns: 1.0,
            app_name: "app".to_string(),
            build_name: "build".to_string(),
        }
    }

    #[test]
    fn handshake_fixes_session_info() {
        let mut t = SliceTransport::new(encode_hello_frame(&sample_hello(PROTOCOL_VERSION)));

        let info = negotiate(&mut t).unwrap();
        assert_eq!(info.app_name, "app");
        assert_eq!(info.flags, SessionFlags::CONTROL_ENABLED);
        assert!(!info.is_date_short());

        // The ack went out: one header plus a 2 byte body.
        assert_eq!(t.written.len(), FrameHeader::SIZE + 2);
        let (_, ack) = FrameHeader::parse(&t.written).unwrap();
        assert!(matches!(
            FrameType::try_from(ack.frame_type),
            Ok(FrameType::Hello)
        ));
    }

    #[test]
    fn major_version_mismatch_is_fatal() {
        let mut t = SliceTransport::new(encode_hello_frame(&sample_hello(0x0207)));

        assert!(matches!(
            negotiate(&mut t),
            Err(Error::ProtocolVersionMismatch { peer: 2, ours: 1 })
        ));
        // No ack on mismatch.
        assert!(t.written.is_empty());
    }

    #[test]
    fn non_hello_first_frame_is_fatal() {
        let raw = FrameHeader {
            frame_type: FrameType::Events as u8,
            flags: FrameFlags::empty(),
            count: 0,
            byte_len: 0,
        }
        .encode()
        .to_vec();
        let mut t = SliceTransport::new(raw);

        assert!(matches!(negotiate(&mut t), Err(Error::FrameBeforeHello)));
    }

    #[test]
    fn truncated_hello_is_io_error() {
        let mut raw = encode_hello_frame(&sample_hello(PROTOCOL_VERSION));
        raw.truncate(raw.len() - 3);
        let mut t = SliceTransport::new(raw);

        assert!(matches!(negotiate(&mut t), Err(Error::Io(_))));
    }

    #[test]
    fn compact_model_implies_short_dates() {
        let mut hello = sample_hello(PROTOCOL_VERSION);
        hello.flags = SessionFlags::COMPACT_MODEL;
        let mut t = SliceTransport::new(encode_hello_frame(&hello));

        let info = negotiate(&mut t).unwrap();
        assert!(info.is_date_short());
    }
}
