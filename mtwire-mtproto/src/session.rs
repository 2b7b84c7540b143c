//! Plaintext MTProto session, used only while no auth key exists.

use std::time::SystemTime;

use mtwire_tl_types::RemoteCall;

use crate::message::{Message, MessageId, MsgIdGenerator};

/// Message-id bookkeeping for the unencrypted key-exchange phase.
///
/// A `Session` is cheap to create and is discarded once the handshake
/// produces an auth key.
///
/// # Example
///
/// ```rust
/// use mtwire_mtproto::Session;
/// use mtwire_tl_types::functions;
///
/// let mut session = Session::new();
/// let msg = session.pack(&functions::ReqPqMulti { nonce: [0; 16] });
/// assert_eq!(&msg.to_plaintext_bytes()[..8], &[0u8; 8]);
/// ```
#[derive(Default)]
pub struct Session {
    msg_ids: MsgIdGenerator,
}

impl Session {
    /// Create a fresh session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new message ID.
    pub fn next_msg_id(&mut self) -> MessageId {
        MessageId(self.msg_ids.next(SystemTime::now(), 0))
    }

    /// Serialize an RPC function into a [`Message`] ready to send.
    pub fn pack<R: RemoteCall>(&mut self, call: &R) -> Message {
        let id = self.next_msg_id();
        Message::plaintext(id, call.to_bytes())
    }
}
