//! Byte-stream plumbing: connectors that open a stream to an endpoint and
//! the [`FrameCodec`] that turns that stream into MTProto frames.

use std::io;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

use mtwire_mtproto::transport::{
    Abridged, Full, Intermediate, Obfuscated, Transport, TransportError, Unpacked,
};

// ─── Streams & connectors ────────────────────────────────────────────────────

/// A bidirectional byte stream a connection runs over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased stream produced by a [`Connector`].
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens one byte stream to an endpoint.
///
/// The supervisor calls this on every (re)connect with an entry of
/// [`crate::Config::endpoints`].
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `endpoint` (`host:port`).
    async fn connect(&self, endpoint: &str) -> io::Result<BoxedStream>;
}

/// Plain TCP with `TCP_NODELAY`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

// ─── TransportKind ───────────────────────────────────────────────────────────

/// Framing used on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportKind {
    /// [Abridged]: 1- or 4-byte length prefix in 4-byte words.
    ///
    /// [Abridged]: https://core.telegram.org/mtproto/mtproto-transports#abridged
    Abridged,
    /// [Intermediate]: 4-byte little-endian length prefix.
    ///
    /// [Intermediate]: https://core.telegram.org/mtproto/mtproto-transports#intermediate
    #[default]
    Intermediate,
    /// [Full]: length, sequence number and CRC-32 around every frame.
    ///
    /// [Full]: https://core.telegram.org/mtproto/mtproto-transports#full
    Full,
    /// [Obfuscated2]: AES-CTR over Abridged or Intermediate framing, for
    /// networks that filter recognisable protocols.
    ///
    /// [Obfuscated2]: https://core.telegram.org/mtproto/mtproto-transports#transport-obfuscation
    Obfuscated {
        /// Framing inside the obfuscation layer.
        inner: ObfuscatedInner,
    },
}

/// Framing wrapped by [`TransportKind::Obfuscated`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ObfuscatedInner {
    /// Abridged inside obfuscation.
    Abridged,
    /// Intermediate inside obfuscation.
    #[default]
    Intermediate,
}

impl TransportKind {
    /// A fresh sans-IO framing state for one connection.
    pub fn build(&self, max_frame_len: usize) -> Box<dyn Transport> {
        match self {
            Self::Abridged => Box::new(Abridged::with_max_frame_len(max_frame_len)),
            Self::Intermediate => Box::new(Intermediate::with_max_frame_len(max_frame_len)),
            Self::Full => Box::new(Full::with_max_frame_len(max_frame_len)),
            Self::Obfuscated { inner: ObfuscatedInner::Abridged } => {
                Box::new(Obfuscated::new(Abridged::with_max_frame_len(max_frame_len)))
            }
            Self::Obfuscated { inner: ObfuscatedInner::Intermediate } => {
                Box::new(Obfuscated::new(Intermediate::with_max_frame_len(max_frame_len)))
            }
        }
    }
}

// ─── FrameCodec ──────────────────────────────────────────────────────────────

/// Errors surfaced by [`FrameCodec`].
#[derive(Debug)]
pub enum FrameError {
    /// The underlying stream failed.
    Io(io::Error),
    /// The framing was violated, or the server sent a transport error code.
    Transport(TransportError),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O: {e}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<TransportError> for FrameError {
    fn from(e: TransportError) -> Self { Self::Transport(e) }
}

/// Adapts a sans-IO [`Transport`] to `tokio_util`'s `Framed`.
///
/// The transport's init bytes go out in front of the first encoded frame.
pub struct FrameCodec {
    transport: Box<dyn Transport>,
    init: Option<Vec<u8>>,
}

impl FrameCodec {
    /// Codec over `transport`.
    pub fn new(mut transport: Box<dyn Transport>) -> Self {
        let mut init = Vec::new();
        transport.init(&mut init);
        Self { transport, init: (!init.is_empty()).then_some(init) }
    }

    /// Codec for `kind` with frames capped at `max_frame_len` bytes.
    pub fn for_kind(kind: &TransportKind, max_frame_len: usize) -> Self {
        Self::new(kind.build(max_frame_len))
    }
}

impl Decoder for FrameCodec {
    type Item = Vec<u8>;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Vec<u8>>, FrameError> {
        match self.transport.unpack(&mut src[..]) {
            Ok(Unpacked { data_start, data_end, next_offset }) => {
                let frame = src[data_start..data_end].to_vec();
                src.advance(next_offset);
                Ok(Some(frame))
            }
            Err(TransportError::MissingBytes(n)) => {
                src.reserve(n);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Vec<u8>, dst: &mut BytesMut) -> Result<(), FrameError> {
        let mut out = self.init.take().unwrap_or_default();
        self.transport.pack(&payload, &mut out);
        dst.extend_from_slice(&out);
        Ok(())
    }
}
