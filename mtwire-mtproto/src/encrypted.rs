//! Encrypted MTProto 2.0 session (post auth-key).
//!
//! Once you have a `Finished` from [`crate::authentication`], construct an
//! [`EncryptedSession`] and use it to serialize/deserialize all subsequent
//! messages.
//!
//! Outgoing messages are queued with [`EncryptedSession::push`] and turned
//! into wire bytes by [`EncryptedSession::finalize`], which wraps several
//! queued messages into a single `msg_container`.

use std::time::{SystemTime, UNIX_EPOCH};

use mtwire_crypto::{AuthKey, Envelope, decrypt_data_v2, encrypt_data_v2};
use mtwire_tl_types::types::{FutureSalt, Message as ContainerMessage, MsgContainer};
use mtwire_tl_types::Serializable;

use crate::message::{MessageId, MsgIdGenerator, read_i32, read_i64};
use crate::replay::{ReplayWindow, WindowError};
use crate::salts::SaltSet;

/// Header in front of every encrypted body:
/// salt, session_id, msg_id, seq_no, length.
const HEADER_LEN: usize = 8 + 8 + 8 + 4 + 4;

/// Upper bound on the serialized size of one container.
pub const MAX_CONTAINER_BYTES: usize = 1_044_456 - 8;

/// Errors that can occur when decrypting a server message.
#[derive(Debug, PartialEq)]
pub enum DecryptError {
    /// The underlying crypto layer rejected the message.
    Crypto(mtwire_crypto::DecryptError),
    /// The decrypted inner message was too short to contain a valid header.
    FrameTooShort,
    /// The inner length field or the padding size is inconsistent.
    #[allow(missing_docs)]
    BadLength { declared: usize, available: usize },
    /// Session-ID mismatch (possible replay or wrong connection).
    SessionMismatch,
    /// The server msg_id failed the replay window.
    MessageIdOutOfWindow(WindowError),
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "crypto: {e}"),
            Self::FrameTooShort => write!(f, "inner plaintext too short"),
            Self::BadLength { declared, available } => {
                write!(f, "inner length {declared} inconsistent with {available} bytes")
            }
            Self::SessionMismatch => write!(f, "session_id mismatch"),
            Self::MessageIdOutOfWindow(e) => write!(f, "msg_id rejected: {e}"),
        }
    }
}

impl std::error::Error for DecryptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Crypto(e) => Some(e),
            Self::MessageIdOutOfWindow(e) => Some(e),
            _ => None,
        }
    }
}

impl DecryptError {
    /// True for failures where the ciphertext itself did not authenticate.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Crypto(_) | Self::FrameTooShort | Self::BadLength { .. })
    }
}

/// The inner payload extracted from a successfully decrypted server frame.
#[derive(Debug, PartialEq)]
pub struct DecryptedMessage {
    /// `salt` sent by the server.
    pub salt:       i64,
    /// The `session_id` from the frame.
    pub session_id: i64,
    /// The `msg_id` of the inner message.
    pub msg_id:     i64,
    /// `seq_no` of the inner message.
    pub seq_no:     i32,
    /// TL-serialized body of the inner message.
    pub body:       Vec<u8>,
}

impl DecryptedMessage {
    /// Content-related messages (odd `seq_no`) must be acknowledged.
    pub fn is_content_related(&self) -> bool {
        self.seq_no & 1 == 1
    }
}

/// Output of [`EncryptedSession::finalize`].
#[derive(Debug)]
pub struct Packed {
    /// Ready-to-frame ciphertext (`key_id ‖ msg_key ‖ data`).
    pub wire: Vec<u8>,
    /// msg_ids of the messages carried, in push order.
    pub msg_ids: Vec<i64>,
    /// Id of the enclosing `msg_container`, when more than one message was
    /// packed.
    pub container_id: Option<i64>,
}

/// What to do about a `bad_msg_notification`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BadMsgAction {
    /// Session state was corrected; send the affected messages again.
    Resend,
    /// The clock moved backwards and the session was renewed. Every message
    /// sent under the old session id must go out again.
    NewSession,
    /// The message can never succeed.
    Fatal(i32),
}

struct Outgoing {
    msg_id: i64,
    seq_no: i32,
    body:   Vec<u8>,
}

fn random_session_id() -> i64 {
    let mut rnd = [0u8; 8];
    getrandom::getrandom(&mut rnd).expect("getrandom");
    i64::from_le_bytes(rnd)
}

fn unix_secs(now: SystemTime) -> i64 {
    now.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// MTProto 2.0 encrypted session state.
///
/// Wraps an `AuthKey` and tracks per-session state (session_id, seq_no,
/// msg_id generator, salts, time offset, replay window).
pub struct EncryptedSession {
    auth_key:    AuthKey,
    session_id:  i64,
    sequence:    i32,
    msg_ids:     MsgIdGenerator,
    salts:       SaltSet,
    time_offset: i32,
    replay:      ReplayWindow,
    outbox:      Vec<Outgoing>,
}

impl EncryptedSession {
    /// Create a new encrypted session with a random session id.
    pub fn new(auth_key: AuthKey, first_salt: i64, time_offset: i32) -> Self {
        Self::with_session_id(auth_key, first_salt, time_offset, random_session_id())
    }

    /// Like [`EncryptedSession::new`] with an explicit session id.
    pub fn with_session_id(auth_key: AuthKey, first_salt: i64, time_offset: i32, session_id: i64) -> Self {
        let now = unix_secs(SystemTime::now()).wrapping_add(time_offset as i64) as i32;
        Self {
            auth_key,
            session_id,
            sequence: 0,
            msg_ids: MsgIdGenerator::default(),
            salts: SaltSet::new(first_salt, now),
            time_offset,
            replay: ReplayWindow::new(),
            outbox: Vec::new(),
        }
    }

    /// Server time in Unix seconds, as far as this session knows.
    pub fn server_time(&self, now: SystemTime) -> i32 {
        unix_secs(now).wrapping_add(self.time_offset as i64) as i32
    }

    fn next_seq_no(&mut self, content_related: bool) -> i32 {
        if content_related {
            let n = self.sequence * 2 + 1;
            self.sequence += 1;
            n
        } else {
            self.sequence * 2
        }
    }

    // ─── Outgoing ────────────────────────────────────────────────────────────

    /// Queue an already-serialized body. Returns its msg_id.
    ///
    /// RPC calls are content-related; acks and other service messages are not.
    pub fn push(&mut self, body: Vec<u8>, content_related: bool) -> i64 {
        self.push_at(body, content_related, SystemTime::now())
    }

    /// [`EncryptedSession::push`] with an explicit clock reading.
    pub fn push_at(&mut self, body: Vec<u8>, content_related: bool, now: SystemTime) -> i64 {
        let msg_id = self.msg_ids.next(now, self.time_offset);
        let seq_no = self.next_seq_no(content_related);
        self.outbox.push(Outgoing { msg_id, seq_no, body });
        msg_id
    }

    /// Number of queued messages not yet finalized.
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Encrypt queued messages into one wire payload.
    ///
    /// Returns `None` when nothing is queued. At most
    /// [`MsgContainer::MAXIMUM_LENGTH`] messages (and
    /// [`MAX_CONTAINER_BYTES`]) go into one payload; call again while
    /// [`EncryptedSession::queued`] is non-zero.
    pub fn finalize(&mut self) -> Option<Packed> {
        self.finalize_at(SystemTime::now())
    }

    /// [`EncryptedSession::finalize`] with an explicit clock reading.
    pub fn finalize_at(&mut self, now: SystemTime) -> Option<Packed> {
        if self.outbox.is_empty() {
            return None;
        }

        let mut take = 0;
        let mut size = 0;
        for msg in &self.outbox {
            let len = ContainerMessage::HEADER_LEN + msg.body.len();
            if take > 0 && (take == MsgContainer::MAXIMUM_LENGTH || size + len > MAX_CONTAINER_BYTES) {
                break;
            }
            take += 1;
            size += len;
        }
        let batch: Vec<Outgoing> = self.outbox.drain(..take).collect();
        let msg_ids: Vec<i64> = batch.iter().map(|m| m.msg_id).collect();

        let (msg_id, seq_no, body, container_id) = if batch.len() == 1 {
            let Some(only) = batch.into_iter().next() else { return None };
            (only.msg_id, only.seq_no, only.body, None)
        } else {
            let container = MsgContainer {
                messages: batch
                    .into_iter()
                    .map(|m| ContainerMessage { msg_id: m.msg_id, seqno: m.seq_no, body: m.body })
                    .collect(),
            };
            let id = self.msg_ids.next(now, self.time_offset);
            let seq = self.next_seq_no(false);
            (id, seq, container.to_bytes(), Some(id))
        };

        let salt = self.salts.current(self.server_time(now));
        let wire = self.encrypt(salt, msg_id, seq_no, &body);
        log::debug!(
            "[mtwire] packed msg_id={msg_id} seq_no={seq_no} messages={} container={container_id:?}",
            msg_ids.len()
        );
        Some(Packed { wire, msg_ids, container_id })
    }

    fn encrypt(&self, salt: i64, msg_id: i64, seq_no: i32, body: &[u8]) -> Vec<u8> {
        let mut buf = Envelope::with_capacity(HEADER_LEN + body.len());
        buf.extend(salt.to_le_bytes());
        buf.extend(self.session_id.to_le_bytes());
        buf.extend(msg_id.to_le_bytes());
        buf.extend(seq_no.to_le_bytes());
        buf.extend((body.len() as u32).to_le_bytes());
        buf.extend(body.iter().copied());

        encrypt_data_v2(&mut buf, &self.auth_key);
        buf.into_wire()
    }

    // ─── Incoming ────────────────────────────────────────────────────────────

    /// Decrypt and validate an encrypted server frame.
    pub fn unpack(&mut self, frame: &mut [u8]) -> Result<DecryptedMessage, DecryptError> {
        self.unpack_at(frame, SystemTime::now())
    }

    /// [`EncryptedSession::unpack`] with an explicit clock reading.
    pub fn unpack_at(&mut self, frame: &mut [u8], now: SystemTime) -> Result<DecryptedMessage, DecryptError> {
        let plaintext = decrypt_data_v2(frame, &self.auth_key).map_err(DecryptError::Crypto)?;

        if plaintext.len() < HEADER_LEN {
            return Err(DecryptError::FrameTooShort);
        }

        let salt       = read_i64(&plaintext[..8]);
        let session_id = read_i64(&plaintext[8..16]);
        let msg_id     = read_i64(&plaintext[16..24]);
        let seq_no     = read_i32(&plaintext[24..28]);
        let body_len   = read_i32(&plaintext[28..32]);

        let available = plaintext.len() - HEADER_LEN;
        let declared = usize::try_from(body_len).unwrap_or(usize::MAX);
        let padding = available.checked_sub(declared);
        if declared % 4 != 0 || !matches!(padding, Some(12..=1024)) {
            return Err(DecryptError::BadLength { declared, available });
        }

        if session_id != self.session_id {
            return Err(DecryptError::SessionMismatch);
        }

        self.replay
            .accept(msg_id, self.server_time(now) as i64)
            .map_err(DecryptError::MessageIdOutOfWindow)?;

        let body = plaintext[HEADER_LEN..HEADER_LEN + declared].to_vec();
        Ok(DecryptedMessage { salt, session_id, msg_id, seq_no, body })
    }

    // ─── Service-message fix-ups ─────────────────────────────────────────────

    /// `bad_server_salt`: switch to the salt the server handed us.
    pub fn handle_bad_server_salt(&mut self, new_salt: i64) {
        let now = self.server_time(SystemTime::now());
        log::debug!("[mtwire] bad_server_salt, switching to {new_salt:#x}");
        self.salts.replace(new_salt, now);
    }

    /// `new_session_created`: the server started a fresh session with `salt`.
    pub fn handle_new_session_created(&mut self, server_salt: i64) {
        let now = self.server_time(SystemTime::now());
        self.salts.replace(server_salt, now);
    }

    /// `future_salts`: merge the announced salts.
    pub fn handle_future_salts(&mut self, salts: &[FutureSalt]) {
        let now = self.server_time(SystemTime::now());
        self.salts.extend(salts, now);
    }

    /// `bad_msg_notification` with `code`, carried by the server message
    /// `server_msg_id`.
    pub fn handle_bad_msg_notification(&mut self, code: i32, server_msg_id: i64) -> BadMsgAction {
        self.handle_bad_msg_notification_at(code, server_msg_id, SystemTime::now())
    }

    /// [`EncryptedSession::handle_bad_msg_notification`] with an explicit clock reading.
    pub fn handle_bad_msg_notification_at(
        &mut self,
        code: i32,
        server_msg_id: i64,
        now: SystemTime,
    ) -> BadMsgAction {
        match code {
            // msg_id too low / too high: resynchronise with the server clock.
            16 | 17 => {
                if self.correct_time(server_msg_id, now) {
                    BadMsgAction::NewSession
                } else {
                    BadMsgAction::Resend
                }
            }
            // Message too old to verify; a fresh id is enough.
            20 => BadMsgAction::Resend,
            // seq_no too low / too high.
            32 => {
                self.sequence += 64;
                BadMsgAction::Resend
            }
            33 => {
                self.sequence = (self.sequence - 16).max(0);
                BadMsgAction::Resend
            }
            // Salt errors are also reported as bad_server_salt.
            48 => BadMsgAction::Resend,
            other => BadMsgAction::Fatal(other),
        }
    }

    /// Set the time offset from a server msg_id.
    ///
    /// msg_ids never decrease within one session id. When the corrected
    /// clock falls behind the last id handed out, the session is renewed
    /// (see [`EncryptedSession::renew`]) and `true` is returned.
    pub fn correct_time(&mut self, server_msg_id: i64, now: SystemTime) -> bool {
        let server_secs = server_msg_id >> 32;
        let offset = (server_secs - unix_secs(now)) as i32;
        log::info!("[mtwire] correcting time offset {} -> {offset}", self.time_offset);
        self.time_offset = offset;
        if MessageId::from_time(now, offset).0 > self.msg_ids.last() {
            return false;
        }
        self.renew();
        true
    }

    /// Start a new logical session over the same auth key.
    ///
    /// The session id is replaced, and the msg_id generator, the seq_no
    /// counter and the replay window start from scratch. Queued messages
    /// belonged to the old session and are discarded. Salts and the time
    /// offset are kept.
    pub fn renew(&mut self) {
        let old = self.session_id;
        self.session_id = random_session_id();
        self.sequence = 0;
        self.msg_ids = MsgIdGenerator::default();
        self.replay = ReplayWindow::new();
        self.outbox.clear();
        log::info!("[mtwire] renewed session {old:#x} -> {:#x}", self.session_id);
    }

    // ─── Accessors ───────────────────────────────────────────────────────────

    /// True when the newest known salt is about to expire.
    pub fn needs_salt_refresh(&self, now: SystemTime) -> bool {
        self.salts.needs_refresh(self.server_time(now))
    }

    /// Salt that would be used for a message sent at `now`.
    pub fn current_salt(&self, now: SystemTime) -> i64 {
        self.salts.current(self.server_time(now))
    }

    /// Every known salt.
    pub fn salts(&self) -> &SaltSet { &self.salts }

    /// Clock skew in seconds vs. server.
    pub fn time_offset(&self) -> i32 { self.time_offset }

    /// The auth key this session encrypts with.
    pub fn auth_key(&self) -> &AuthKey { &self.auth_key }

    /// Return the auth_key bytes (for persistence).
    pub fn auth_key_bytes(&self) -> [u8; 256] { self.auth_key.to_bytes() }

    /// Return the current session_id.
    pub fn session_id(&self) -> i64 { self.session_id }

    /// Most recently allocated client msg_id.
    pub fn last_msg_id(&self) -> i64 { self.msg_ids.last() }
}
