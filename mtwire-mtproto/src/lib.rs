//! Sans-IO MTProto 2.0 core.
//!
//! This crate handles:
//! * Message ids and the plaintext envelope used during key exchange
//! * The DH auth key handshake ([`authentication`])
//! * Encrypted sessions: seq_no, containers, salts, replay protection
//! * Transport framings (abridged, intermediate, full, obfuscated)
//!
//! Nothing here touches a socket: bring your own TCP stream and feed bytes
//! through a [`transport::Transport`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod authentication;
pub mod encrypted;
pub mod message;
pub mod replay;
pub mod salts;
pub mod session;
pub mod transport;

pub use encrypted::{BadMsgAction, DecryptError, DecryptedMessage, EncryptedSession, Packed};
pub use message::{Message, MessageId, MsgIdGenerator, PlaintextError};
pub use replay::{ReplayWindow, WindowError};
pub use salts::{Salt, SaltSet};
pub use session::Session;
