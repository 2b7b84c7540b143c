use mtwire_crypto::ObfuscatedCipher;

use super::{Tagged, Transport, TransportError, Unpacked};

/// First words a random header must not start with, since they would make
/// the stream look like another protocol.
const RESERVED_STARTS: [[u8; 4]; 7] = [
    *b"HEAD",
    *b"POST",
    *b"GET ",
    *b"OPTI",
    [0xdd, 0xdd, 0xdd, 0xdd],
    [0xee, 0xee, 0xee, 0xee],
    [0x16, 0x03, 0x01, 0x02],
];

/// [Obfuscated2] wrapper around [`Abridged`](super::Abridged) or
/// [`Intermediate`](super::Intermediate).
///
/// A random 64-byte header carries the inner protocol tag; every byte after
/// it, in both directions, is XOR-ed with an AES-256-CTR key stream derived
/// from that header.
///
/// [Obfuscated2]: https://core.telegram.org/mtproto/mtproto-transports#transport-obfuscation
pub struct Obfuscated<T: Tagged> {
    inner: T,
    cipher: ObfuscatedCipher,
    init_bytes: [u8; 64],
    /// Bytes at the front of the receive buffer that are already decrypted.
    decrypted: usize,
}

impl<T: Tagged> Obfuscated<T> {
    /// Wrap `inner` with a freshly generated random header.
    pub fn new(inner: T) -> Self {
        Self::with_header(inner, random_header())
    }

    /// Wrap `inner` using `header` as the random header. Bytes 56..60 are
    /// overwritten with the protocol tag.
    pub fn with_header(inner: T, mut header: [u8; 64]) -> Self {
        header[56..60].copy_from_slice(&T::TAG);
        let mut cipher = ObfuscatedCipher::new(&header);

        let mut encrypted = header;
        cipher.encrypt(&mut encrypted);
        let mut init_bytes = header;
        init_bytes[56..].copy_from_slice(&encrypted[56..]);

        Self { inner, cipher, init_bytes, decrypted: 0 }
    }
}

/// True when `header` may be sent as an obfuscation header.
pub fn is_valid_header(header: &[u8; 64]) -> bool {
    header[0] != 0xef
        && !RESERVED_STARTS.iter().any(|r| header[..4] == r[..])
        && header[4..8] != [0, 0, 0, 0]
}

fn random_header() -> [u8; 64] {
    let mut header = [0u8; 64];
    loop {
        getrandom::getrandom(&mut header).expect("getrandom");
        if is_valid_header(&header) {
            return header;
        }
    }
}

impl<T: Tagged> Transport for Obfuscated<T> {
    fn init(&mut self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.init_bytes);
    }

    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        let start = out.len();
        self.inner.pack(payload, out);
        self.cipher.encrypt(&mut out[start..]);
    }

    fn unpack(&mut self, buffer: &mut [u8]) -> Result<Unpacked, TransportError> {
        if self.decrypted < buffer.len() {
            self.cipher.decrypt(&mut buffer[self.decrypted..]);
            self.decrypted = buffer.len();
        }
        let unpacked = self.inner.unpack(buffer)?;
        self.decrypted -= unpacked.next_offset;
        Ok(unpacked)
    }
}
