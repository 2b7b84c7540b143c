//! AES-256-CTR key streams for the obfuscated transport.

use ::aes::Aes256;
use ::aes::cipher::generic_array::GenericArray;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};

type Cipher = Ctr128BE<Aes256>;

/// A pair of CTR key streams derived from the 64-byte obfuscation header.
///
/// The sender encrypts with `header[8..40]` / `header[40..56]`; the opposite
/// direction uses the same 48 bytes reversed.
pub struct ObfuscatedCipher {
    tx: Cipher,
    rx: Cipher,
}

impl ObfuscatedCipher {
    /// Key streams for the side that generated `header`.
    pub fn new(header: &[u8; 64]) -> Self {
        let (forward, reversed) = Self::derive(header);
        Self { tx: forward, rx: reversed }
    }

    /// Key streams for the side that *received* `header`.
    pub fn for_receiver(header: &[u8; 64]) -> Self {
        let (forward, reversed) = Self::derive(header);
        Self { tx: reversed, rx: forward }
    }

    fn derive(header: &[u8; 64]) -> (Cipher, Cipher) {
        let reversed: Vec<u8> = header[8..56].iter().rev().copied().collect();
        let forward = Cipher::new(
            GenericArray::from_slice(&header[8..40]),
            GenericArray::from_slice(&header[40..56]),
        );
        let backward = Cipher::new(
            GenericArray::from_slice(&reversed[..32]),
            GenericArray::from_slice(&reversed[32..48]),
        );
        (forward, backward)
    }

    /// XOR outgoing bytes with the send key stream.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.tx.apply_keystream(buf);
    }

    /// XOR incoming bytes with the receive key stream.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        self.rx.apply_keystream(buf);
    }
}
