//! # Peer Connection and Handshake
//!
//! A [`PeerConn`] wraps a freshly accepted or dialed TCP stream in the
//! frame codec and performs the identity handshake:
//!
//! - **Outbound** (client): write a hello naming ourselves and the node we
//!   believe we dialed, then read the hello-reply and check that the remote
//!   speaks our frame version and addressed the reply to us.
//! - **Inbound** (server): read the hello, check the version and that we
//!   are the addressee, learn the remote id, and write the hello-reply.
//!
//! Identity here is asserted, not proven; the handshake only pins which id
//! a session belongs to so the server can enforce one session per node.
//!
//! On success the connection is handed to the server through its add-peer
//! channel and becomes a [`Peer`](crate::peer::Peer).

use std::fmt;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::frame::{
    Frame, FrameCodec, FrameError, Hello, FRAME_VERSION, TYPE_HELLO, TYPE_HELLO_REPLY,
};
use crate::identity::NodeId;

/// Connection flag bits. A connection is inbound or outbound, and outbound
/// connections are additionally static (configured) or dynamic (discovered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerFlags(pub u8);

pub const FLAG_INBOUND: PeerFlags = PeerFlags(1);
pub const FLAG_OUTBOUND: PeerFlags = PeerFlags(1 << 1);
pub const FLAG_STATIC: PeerFlags = PeerFlags(1 << 2);
pub const FLAG_DYNAMIC: PeerFlags = PeerFlags(1 << 3);

impl PeerFlags {
    #[inline]
    pub fn contains(&self, flag: PeerFlags) -> bool {
        self.0 & flag.0 != 0
    }
}

impl std::ops::BitOr for PeerFlags {
    type Output = PeerFlags;

    fn bitor(self, rhs: PeerFlags) -> PeerFlags {
        PeerFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for PeerFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(FLAG_INBOUND) {
            parts.push("inbound");
        }
        if self.contains(FLAG_OUTBOUND) {
            parts.push("outbound");
        }
        if self.contains(FLAG_STATIC) {
            parts.push("static");
        }
        if self.contains(FLAG_DYNAMIC) {
            parts.push("dynamic");
        }
        f.write_str(&parts.join("+"))
    }
}

/// Handshake failures. All of them close the offending connection.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("connection closed during handshake")]
    ConnectionClosed,
    #[error("unexpected frame type {got} during handshake")]
    UnexpectedType { got: u8 },
    #[error("version mismatch: got {got}, want {want}")]
    Version { got: u8, want: u8 },
    #[error("handshake addressed to {got}, but our id is {want}")]
    AddresseeMismatch { got: Box<NodeId>, want: Box<NodeId> },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A framed TCP connection before it becomes a peer session.
pub struct PeerConn {
    pub(crate) stream: Framed<TcpStream, FrameCodec>,
    pub(crate) self_id: NodeId,
    pub(crate) remote_id: Option<NodeId>,
    pub(crate) flags: PeerFlags,
}

impl PeerConn {
    /// Wraps `stream` for a handshake. Outbound connections must name the
    /// node they dialed via `remote_id`.
    pub fn new(
        stream: TcpStream,
        self_id: NodeId,
        flags: PeerFlags,
        remote_id: Option<NodeId>,
    ) -> Self {
        Self {
            stream: Framed::new(stream, FrameCodec),
            self_id,
            flags,
            remote_id,
        }
    }

    pub fn remote_id(&self) -> Option<NodeId> {
        self.remote_id
    }

    pub fn flags(&self) -> PeerFlags {
        self.flags
    }

    async fn read_handshake_frame(&mut self, want_type: u8) -> Result<Hello, HandshakeError> {
        let frame: Frame = self
            .stream
            .next()
            .await
            .ok_or(HandshakeError::ConnectionClosed)??;
        if frame.version != FRAME_VERSION {
            return Err(HandshakeError::Version {
                got: frame.version,
                want: FRAME_VERSION,
            });
        }
        if frame.mtype != want_type {
            return Err(HandshakeError::UnexpectedType { got: frame.mtype });
        }
        Ok(Hello::from_frame(&frame)?)
    }

    fn check_addressee(&self, hello: &Hello) -> Result<(), HandshakeError> {
        if hello.addressee != self.self_id {
            return Err(HandshakeError::AddresseeMismatch {
                got: Box::new(hello.addressee),
                want: Box::new(self.self_id),
            });
        }
        Ok(())
    }

    /// Runs the dialing side of the handshake against the node named at
    /// construction.
    pub async fn client_handshake(&mut self) -> Result<(), HandshakeError> {
        let remote = self.remote_id.expect("outbound connections know their target");
        let hello = Hello {
            sender: self.self_id,
            addressee: remote,
        };
        debug!(to = %remote, "sending handshake hello");
        self.stream.send(hello.to_frame(TYPE_HELLO)).await?;

        let reply = self.read_handshake_frame(TYPE_HELLO_REPLY).await?;
        self.check_addressee(&reply)?;
        Ok(())
    }

    /// Runs the accepting side of the handshake and learns the remote id.
    pub async fn server_handshake(&mut self) -> Result<NodeId, HandshakeError> {
        let hello = self.read_handshake_frame(TYPE_HELLO).await?;
        self.check_addressee(&hello)?;
        self.remote_id = Some(hello.sender);
        debug!(from = %hello.sender, "handshake hello received");

        let reply = Hello {
            sender: self.self_id,
            addressee: hello.sender,
        };
        self.stream.send(reply.to_frame(TYPE_HELLO_REPLY)).await?;
        Ok(hello.sender)
    }
}
