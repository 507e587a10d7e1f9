//! # TCP Frame Codec
//!
//! Peer sessions exchange length-prefixed frames:
//!
//! ```text
//! [version: u8] [type: u8] [len: u32 little-endian] [payload: len bytes]
//! ```
//!
//! Frame types:
//!
//! | Type | Meaning |
//! |------|---------|
//! | 0 | hello (handshake request) |
//! | 1 | hello-reply |
//! | 2 | ping (heartbeat request) |
//! | 3 | pong (heartbeat answer) |
//! | ≥ 4 | application-defined sub-protocols |
//!
//! Handshake payloads carry the sender id followed by the addressee id, 128
//! bytes total. The codec itself is type-agnostic; the handshake and the
//! peer session interpret types.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::identity::{NodeId, NODE_ID_LEN};

/// Protocol version stamped on every frame.
pub const FRAME_VERSION: u8 = 1;

/// Frame header: version, type, payload length.
pub const FRAME_HEADER_LEN: usize = 6;

pub const TYPE_HELLO: u8 = 0;
pub const TYPE_HELLO_REPLY: u8 = 1;
pub const TYPE_PING: u8 = 2;
pub const TYPE_PONG: u8 = 3;

/// Smallest type value available to application sub-protocols.
pub const TYPE_APPLICATION_MIN: u8 = 4;

/// Upper bound on a frame payload. Nothing the protocol sends comes close;
/// the cap only keeps a broken peer from ballooning the read buffer.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Frame-level failures on a peer stream. Any of these ends the session.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),
    #[error("handshake payload has wrong length: {0} bytes")]
    BadHandshakePayload(usize),
    #[error("frame i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub mtype: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(mtype: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            version: FRAME_VERSION,
            mtype,
            payload: payload.into(),
        }
    }
}

/// Encoder/decoder for [`Frame`] over a TCP stream.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(len));
        }
        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }
        let version = src.get_u8();
        let mtype = src.get_u8();
        src.advance(4);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame {
            version,
            mtype,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(frame.payload.len()));
        }
        dst.reserve(FRAME_HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.version);
        dst.put_u8(frame.mtype);
        dst.put_u32_le(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Handshake body for hello and hello-reply frames: who is talking, and who
/// they believe they are talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub sender: NodeId,
    pub addressee: NodeId,
}

impl Hello {
    pub fn to_frame(&self, mtype: u8) -> Frame {
        let mut payload = BytesMut::with_capacity(2 * NODE_ID_LEN);
        payload.put_slice(self.sender.as_bytes());
        payload.put_slice(self.addressee.as_bytes());
        Frame::new(mtype, payload.freeze())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        if frame.payload.len() != 2 * NODE_ID_LEN {
            return Err(FrameError::BadHandshakePayload(frame.payload.len()));
        }
        let mut sender = [0u8; NODE_ID_LEN];
        let mut addressee = [0u8; NODE_ID_LEN];
        sender.copy_from_slice(&frame.payload[..NODE_ID_LEN]);
        addressee.copy_from_slice(&frame.payload[NODE_ID_LEN..]);
        Ok(Self {
            sender: NodeId::from_bytes(sender),
            addressee: NodeId::from_bytes(addressee),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        let frame = Frame::new(TYPE_APPLICATION_MIN, vec![7u8; 300]);
        codec.encode(frame.clone(), &mut buf).unwrap();
        let got = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(got, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_layout_is_exact() {
        // A 300-byte type-4 message occupies exactly 306 bytes on the wire.
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(4, vec![0u8; 300]), &mut buf)
            .unwrap();
        assert_eq!(buf.len(), 306);
        assert_eq!(buf[0], FRAME_VERSION);
        assert_eq!(buf[1], 4);
        assert_eq!(&buf[2..6], &[0x2c, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = FrameCodec;
        let mut full = BytesMut::new();
        codec
            .encode(Frame::new(5, b"hello world".to_vec()), &mut full)
            .unwrap();

        let mut partial = BytesMut::new();
        for chunk in full.chunks(3) {
            let before = codec.decode(&mut partial).unwrap();
            if partial.len() + chunk.len() < full.len() {
                assert!(before.is_none());
            }
            partial.extend_from_slice(chunk);
        }
        let got = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(got.mtype, 5);
        assert_eq!(&got.payload[..], b"hello world");
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(4);
        buf.put_u32_le((MAX_FRAME_PAYLOAD + 1) as u32);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn hello_round_trip() {
        let hello = Hello {
            sender: NodeId::from_bytes([1u8; NODE_ID_LEN]),
            addressee: NodeId::from_bytes([2u8; NODE_ID_LEN]),
        };
        let frame = hello.to_frame(TYPE_HELLO);
        assert_eq!(frame.payload.len(), 128);
        assert_eq!(Hello::from_frame(&frame).unwrap(), hello);

        let bad = Frame::new(TYPE_HELLO, vec![0u8; 10]);
        assert!(matches!(
            Hello::from_frame(&bad),
            Err(FrameError::BadHandshakePayload(10))
        ));
    }
}
