//! Sans-IO transport framing.
//!
//! A [`Transport`] turns payloads into framed bytes and back without doing
//! any I/O itself. The async client feeds it socket bytes and writes out
//! whatever it produces.
//!
//! | Framing          | Init bytes           | Frame layout                          |
//! |------------------|----------------------|---------------------------------------|
//! | [`Abridged`]     | `0xef`               | `len/4` (1 or 4 bytes) ‖ payload      |
//! | [`Intermediate`] | `0xeeeeeeee`         | `len` (4 bytes) ‖ payload             |
//! | [`Full`]         | none                 | `len` ‖ `seq` ‖ payload ‖ `crc32`     |
//! | [`Obfuscated`]   | 64-byte random header | inner framing XOR AES-CTR stream     |

mod abridged;
mod full;
mod intermediate;
mod obfuscated;

pub use abridged::Abridged;
pub use full::Full;
pub use intermediate::Intermediate;
pub use obfuscated::{Obfuscated, is_valid_header};

use std::fmt;

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors from [`Transport::unpack`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// At least this many more bytes are needed before a frame is complete.
    MissingBytes(usize),
    /// The declared frame length exceeds the configured bound.
    #[allow(missing_docs)]
    FrameTooLarge { len: usize, max: usize },
    /// The declared frame length is impossible for this framing.
    #[allow(missing_docs)]
    BadLen { len: u32 },
    /// Full transport: the frame sequence number is not the expected one.
    #[allow(missing_docs)]
    BadSeq { expected: i32, got: i32 },
    /// Full transport: CRC-32 mismatch.
    #[allow(missing_docs)]
    BadCrc { expected: u32, got: u32 },
    /// The server sent a 4-byte negative error code instead of a message
    /// (e.g. `-404` unknown auth key, `-429` transport flood).
    ServerError(i32),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingBytes(n) => write!(f, "need {n} more bytes"),
            Self::FrameTooLarge { len, max } => write!(f, "frame of {len} bytes exceeds limit {max}"),
            Self::BadLen { len } => write!(f, "bad frame length {len}"),
            Self::BadSeq { expected, got } => write!(f, "bad seq: expected {expected}, got {got}"),
            Self::BadCrc { expected, got } => {
                write!(f, "bad crc: expected {expected:#010x}, got {got:#010x}")
            }
            Self::ServerError(code) => write!(f, "transport error {code} from server"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Location of one unpacked frame inside the input buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Unpacked {
    /// Payload starts here.
    pub data_start: usize,
    /// Payload ends here (exclusive).
    pub data_end: usize,
    /// Bytes consumed from the front of the buffer by this frame.
    pub next_offset: usize,
}

/// A framing scheme.
pub trait Transport: Send {
    /// Bytes to write once, right after the connection opens.
    fn init(&mut self, out: &mut Vec<u8>);

    /// Append the framed form of `payload` to `out`.
    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>);

    /// Parse one frame from the front of `buffer`.
    ///
    /// `buffer` is mutable so that stream-ciphered framings can decrypt in
    /// place. After `Ok`, the caller must drop `next_offset` bytes from the
    /// front before calling again; after `MissingBytes`, it must keep the
    /// buffer as-is and append more.
    fn unpack(&mut self, buffer: &mut [u8]) -> Result<Unpacked, TransportError>;
}

/// Framings that can run inside [`Obfuscated`].
pub trait Tagged: Transport {
    /// Protocol tag placed at bytes 56..60 of the obfuscation header.
    const TAG: [u8; 4];
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn init(&mut self, out: &mut Vec<u8>) {
        (**self).init(out)
    }

    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        (**self).pack(payload, out)
    }

    fn unpack(&mut self, buffer: &mut [u8]) -> Result<Unpacked, TransportError> {
        (**self).unpack(buffer)
    }
}

/// Report a 4-byte negative payload as a server transport error.
fn check_server_error(payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() == 4 {
        let code = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if code < 0 {
            return Err(TransportError::ServerError(code));
        }
    }
    Ok(())
}
