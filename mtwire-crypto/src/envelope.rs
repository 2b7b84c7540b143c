//! Buffer an outgoing MTProto 2.0 message is encrypted in.

/// `auth_key_id ‖ msg_key`, in front of every ciphertext.
pub const ENVELOPE_HEADER_LEN: usize = 8 + 16;

/// Plaintext that is encrypted in place and then sealed with the
/// `auth_key_id ‖ msg_key` header.
///
/// Room for the header is reserved up front so sealing never moves the
/// body. Before [`Envelope::seal`], [`AsRef`] yields the plaintext; after
/// it, the finished wire bytes.
#[derive(Clone, Debug)]
pub struct Envelope {
    buf:    Vec<u8>,
    sealed: bool,
}

impl Envelope {
    /// Empty envelope with room for a `body`-byte message plus padding.
    pub fn with_capacity(body: usize) -> Self {
        let mut buf = Vec::with_capacity(ENVELOPE_HEADER_LEN + body + 32);
        buf.resize(ENVELOPE_HEADER_LEN, 0);
        Self { buf, sealed: false }
    }

    /// The message body (plaintext before encryption, ciphertext after).
    pub fn body(&self) -> &[u8] {
        &self.buf[ENVELOPE_HEADER_LEN..]
    }

    /// Mutable view of [`Envelope::body`].
    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.buf[ENVELOPE_HEADER_LEN..]
    }

    /// True once the header has been written.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub(crate) fn seal(&mut self, key_id: &[u8; 8], msg_key: &[u8; 16]) {
        self.buf[..8].copy_from_slice(key_id);
        self.buf[8..ENVELOPE_HEADER_LEN].copy_from_slice(msg_key);
        self.sealed = true;
    }

    /// The wire bytes of a sealed envelope, or the body of an unsealed one.
    pub fn into_wire(mut self) -> Vec<u8> {
        if !self.sealed {
            self.buf.drain(..ENVELOPE_HEADER_LEN);
        }
        self.buf
    }
}

impl AsRef<[u8]> for Envelope {
    fn as_ref(&self) -> &[u8] {
        if self.sealed { &self.buf[..] } else { self.body() }
    }
}

impl Extend<u8> for Envelope {
    fn extend<T: IntoIterator<Item = u8>>(&mut self, iter: T) {
        debug_assert!(!self.sealed, "envelope extended after sealing");
        self.buf.extend(iter);
    }
}
