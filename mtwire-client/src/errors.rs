//! Error types for mtwire-client.

use std::{fmt, io};

use mtwire_mtproto::authentication;
use mtwire_mtproto::encrypted::DecryptError;
use mtwire_mtproto::transport::TransportError;

use crate::transport::FrameError;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in response to an RPC call.
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with the numeric suffix removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw error message like `"FLOOD_WAIT_30"` into an `RpcError`.
    pub fn from_message(code: i32, message: &str) -> Self {
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    let name = message[..idx].to_string();
                    return Self { code, name, value: Some(v) };
                }
            }
        }
        Self { code, name: message.to_string(), value: None }
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("FLOOD_WAIT")`: exact match
    /// - `err.is("PHONE_CODE_*")`: starts-with match
    /// - `err.is("*_INVALID")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// Seconds to wait for `FLOOD_WAIT_X` and `FLOOD_PREMIUM_WAIT_X`.
    pub fn flood_wait_seconds(&self) -> Option<u32> {
        if self.code == 420 && (self.name == "FLOOD_WAIT" || self.name == "FLOOD_PREMIUM_WAIT") {
            self.value
        } else {
            None
        }
    }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned from every [`crate::Client`] call.
#[derive(Debug)]
pub enum InvocationError {
    /// The server rejected the request.
    Rpc(RpcError),
    /// The server asked us to slow down; no request leaves for `seconds`.
    FloodWait {
        /// How long the flood gate stays armed.
        seconds: u32,
    },
    /// No result arrived before the call's deadline.
    Timeout,
    /// The request queue is full, or the flood gate rejected the call.
    Backpressure,
    /// The client was stopped.
    ConnectionClosed,
    /// The peer closed the byte stream.
    TransportClosed,
    /// A frame exceeded the configured maximum length.
    #[allow(missing_docs)]
    FrameTooLarge { len: usize, max: usize },
    /// A response could not be decoded.
    MalformedData(String),
    /// The authorization key handshake failed.
    KeyExchangeFailed(String),
    /// A frame failed authentication.
    IntegrityCheckFailed,
    /// A server message id was outside the replay window.
    MessageIdOutOfWindow,
    /// The server refused the message with a non-recoverable
    /// `bad_msg_notification` code.
    #[allow(missing_docs)]
    BadMessage { code: i32 },
    /// Network / I/O failure.
    Io(io::Error),
    /// The result slot was dropped without an answer.
    Dropped,
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e)                     => write!(f, "{e}"),
            Self::FloodWait { seconds }      => write!(f, "flood wait of {seconds}s"),
            Self::Timeout                    => write!(f, "request timed out"),
            Self::Backpressure               => write!(f, "request queue is full"),
            Self::ConnectionClosed           => write!(f, "client is closed"),
            Self::TransportClosed            => write!(f, "transport closed by peer"),
            Self::FrameTooLarge { len, max } => write!(f, "frame of {len} bytes exceeds {max}"),
            Self::MalformedData(s)           => write!(f, "malformed data: {s}"),
            Self::KeyExchangeFailed(s)       => write!(f, "key exchange failed: {s}"),
            Self::IntegrityCheckFailed       => write!(f, "integrity check failed"),
            Self::MessageIdOutOfWindow       => write!(f, "message id outside the replay window"),
            Self::BadMessage { code }        => write!(f, "bad message notification {code}"),
            Self::Io(e)                      => write!(f, "I/O error: {e}"),
            Self::Dropped                    => write!(f, "request dropped"),
        }
    }
}

impl std::error::Error for InvocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rpc(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<mtwire_tl_types::deserialize::Error> for InvocationError {
    fn from(e: mtwire_tl_types::deserialize::Error) -> Self { Self::MalformedData(e.to_string()) }
}

impl From<authentication::Error> for InvocationError {
    fn from(e: authentication::Error) -> Self { Self::KeyExchangeFailed(e.to_string()) }
}

impl From<DecryptError> for InvocationError {
    fn from(e: DecryptError) -> Self {
        match e {
            DecryptError::MessageIdOutOfWindow(_) => Self::MessageIdOutOfWindow,
            _ => Self::IntegrityCheckFailed,
        }
    }
}

impl From<TransportError> for InvocationError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::FrameTooLarge { len, max } => Self::FrameTooLarge { len, max },
            TransportError::ServerError(code) => {
                Self::Rpc(RpcError::from_message(code, "TRANSPORT_ERROR"))
            }
            other => Self::MalformedData(other.to_string()),
        }
    }
}

impl From<FrameError> for InvocationError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => Self::Io(e),
            FrameError::Transport(e) => e.into(),
        }
    }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _            => false,
        }
    }

    /// If this is a flood wait, returns how many seconds to wait.
    pub fn flood_wait_seconds(&self) -> Option<u32> {
        match self {
            Self::FloodWait { seconds } => Some(*seconds),
            Self::Rpc(e)                => e.flood_wait_seconds(),
            _                           => None,
        }
    }

    /// Errors caused by the link rather than by the request itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::TransportClosed | Self::Timeout | Self::Dropped)
    }

    /// Convert a decoded `rpc_error` object.
    pub(crate) fn from_rpc(code: i32, message: &str) -> Self {
        let err = RpcError::from_message(code, message);
        match err.flood_wait_seconds() {
            Some(seconds) => Self::FloodWait { seconds },
            None => Self::Rpc(err),
        }
    }
}
