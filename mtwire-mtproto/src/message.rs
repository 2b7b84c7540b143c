//! MTProto message identifiers and the plaintext envelope.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A 64-bit MTProto message identifier.
///
/// The upper 32 bits hold the (server-corrected) Unix time in seconds; the
/// lower 32 bits a sub-second fraction. Client identifiers are divisible by
/// 4, server identifiers are odd.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MessageId(pub i64);

impl MessageId {
    /// Identifier derived from `now` shifted by `time_offset` seconds.
    pub fn from_time(now: SystemTime, time_offset: i32) -> Self {
        let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        let secs = (since_epoch.as_secs() as i64).wrapping_add(time_offset as i64);
        let frac = (since_epoch.subsec_nanos() as u64 * (1u64 << 32) / 1_000_000_000) as i64;
        Self(((secs << 32) | frac) & !3)
    }

    /// The Unix time embedded in the identifier.
    pub fn unix_secs(self) -> i64 {
        self.0 >> 32
    }
}

/// Allocates strictly increasing client message identifiers.
#[derive(Clone, Debug, Default)]
pub struct MsgIdGenerator {
    last: i64,
}

impl MsgIdGenerator {
    /// Next identifier: `max(last + 4, clock)`.
    pub fn next(&mut self, now: SystemTime, time_offset: i32) -> i64 {
        let clock = MessageId::from_time(now, time_offset).0;
        let id = if clock > self.last { clock } else { self.last + 4 };
        self.last = id;
        id
    }

    /// Most recently allocated identifier (0 if none).
    pub fn last(&self) -> i64 {
        self.last
    }
}

/// A plaintext (unencrypted) MTProto message, used during key exchange.
#[derive(Debug, PartialEq)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: MessageId,
    /// The serialized TL body (constructor ID + fields).
    pub body: Vec<u8>,
}

/// Errors from [`Message::from_plaintext_bytes`].
#[derive(Clone, Debug, PartialEq)]
pub enum PlaintextError {
    /// Fewer than the 20 header bytes.
    #[allow(missing_docs)]
    TooShort { len: usize },
    /// `auth_key_id` was not zero.
    #[allow(missing_docs)]
    NotPlaintext { auth_key_id: i64 },
    /// The declared body length does not match the frame.
    #[allow(missing_docs)]
    BadLength { declared: usize, actual: usize },
}

impl std::fmt::Display for PlaintextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "plaintext frame of {len} bytes is too short"),
            Self::NotPlaintext { auth_key_id } => {
                write!(f, "expected plaintext frame, got auth_key_id {auth_key_id}")
            }
            Self::BadLength { declared, actual } => {
                write!(f, "declared body length {declared} but {actual} bytes follow")
            }
        }
    }
}

impl std::error::Error for PlaintextError {}

impl Message {
    /// Construct a new plaintext message.
    pub fn plaintext(id: MessageId, body: Vec<u8>) -> Self {
        Self { id, body }
    }

    /// Serialize the message into the plaintext wire format:
    ///
    /// ```text
    /// auth_key_id:long  (0 for plaintext)
    /// message_id:long
    /// message_data_length:int
    /// message_data:bytes
    /// ```
    pub fn to_plaintext_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 8 + 4 + self.body.len());
        buf.extend(0i64.to_le_bytes());
        buf.extend(self.id.0.to_le_bytes());
        buf.extend((self.body.len() as u32).to_le_bytes());
        buf.extend(&self.body);
        buf
    }

    /// Parse a plaintext frame produced by [`Message::to_plaintext_bytes`].
    pub fn from_plaintext_bytes(frame: &[u8]) -> Result<Self, PlaintextError> {
        if frame.len() < 20 {
            return Err(PlaintextError::TooShort { len: frame.len() });
        }
        let auth_key_id = read_i64(&frame[..8]);
        if auth_key_id != 0 {
            return Err(PlaintextError::NotPlaintext { auth_key_id });
        }
        let id = MessageId(read_i64(&frame[8..16]));
        let declared = read_u32(&frame[16..20]) as usize;
        let actual = frame.len() - 20;
        if declared != actual {
            return Err(PlaintextError::BadLength { declared, actual });
        }
        Ok(Self { id, body: frame[20..].to_vec() })
    }
}

pub(crate) fn read_i64(b: &[u8]) -> i64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&b[..8]);
    i64::from_le_bytes(arr)
}

pub(crate) fn read_i32(b: &[u8]) -> i32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&b[..4]);
    i32::from_le_bytes(arr)
}

pub(crate) fn read_u32(b: &[u8]) -> u32 {
    read_i32(b) as u32
}
