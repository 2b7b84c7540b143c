//! TL binary codec and the MTProto service schema.
//!
//! The schema covers the key-exchange handshake and the service messages a
//! session has to understand (`rpc_result`, containers, acks, salts, pings,
//! notifications). API-level requests and responses are opaque to this
//! crate: they travel as already-serialized bytes or [`Blob`]s.
//!
//! # Overview
//!
//! | Module        | Contents                                                   |
//! |---------------|------------------------------------------------------------|
//! | [`types`]     | Concrete constructors as `struct`s                         |
//! | [`functions`] | RPC functions as `struct`s implementing [`RemoteCall`]     |
//! | [`enums`]     | Boxed types as `enum`s implementing [`Deserializable`]     |
//!
//! # Usage
//!
//! ```rust
//! use mtwire_tl_types::{functions, Serializable, Deserializable};
//!
//! let ping = functions::Ping { ping_id: 42 };
//! let bytes = ping.to_bytes();
//! assert_eq!(&bytes[..4], &0x7abe77ec_u32.to_le_bytes());
//! ```

#![deny(unsafe_code)]

pub mod deserialize;
pub mod enums;
pub mod functions;
pub mod serialize;
pub mod types;

pub use deserialize::{Cursor, Deserializable};
pub use serialize::Serializable;

/// Constructor ID of the boxed `Vector` type.
pub const VECTOR_ID: u32 = 0x1cb5c415;

/// Bare vector: `vector` (lowercase) as opposed to the boxed `Vector`.
///
/// Used where the schema sends a length-prefixed list without the usual
/// `0x1cb5c415` constructor ID header.
#[derive(Clone, Debug, PartialEq)]
pub struct RawVec<T>(pub Vec<T>);

/// Opaque blob of bytes that should be passed through without interpretation.
///
/// Returned by functions whose response type is generic (e.g. `X`), and used
/// for the body of an `rpc_result`.
#[derive(Clone, Debug, PartialEq)]
pub struct Blob(pub Vec<u8>);

impl From<Vec<u8>> for Blob {
    fn from(v: Vec<u8>) -> Self { Self(v) }
}

// ─── Core traits ──────────────────────────────────────────────────────────────

/// Every schema type has a unique 32-bit constructor ID.
pub trait Identifiable {
    /// The constructor ID as specified in the TL schema.
    const CONSTRUCTOR_ID: u32;
}

/// Marks a function type that can be sent to the server as an RPC call.
///
/// `Return` is the type the server will respond with.
pub trait RemoteCall: Serializable {
    /// The deserialized response type.
    type Return: Deserializable;
}

// ─── Decode by schema id ─────────────────────────────────────────────────────

/// Read the leading constructor ID of a serialized object, if present.
pub fn peek_constructor(bytes: &[u8]) -> Option<u32> {
    bytes.get(..4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Decode a boxed `T` from `bytes`.
///
/// The leading constructor ID must be `T::CONSTRUCTOR_ID` and the whole
/// buffer must be consumed.
pub fn decode<T: Deserializable + Identifiable>(bytes: &[u8]) -> deserialize::Result<T> {
    let mut cursor = Cursor::from_slice(bytes);
    let id = u32::deserialize(&mut cursor)?;
    if id != T::CONSTRUCTOR_ID {
        return Err(deserialize::Error::UnexpectedConstructor { id });
    }
    let value = T::deserialize(&mut cursor)?;
    match cursor.remaining() {
        0 => Ok(value),
        remaining => Err(deserialize::Error::TrailingBytes { remaining }),
    }
}
