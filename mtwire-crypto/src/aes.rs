//! AES-256 in IGE mode, as used by MTProto.
//!
//! IGE chains every block with both the previous ciphertext and the previous
//! plaintext block; `iv` holds the initial values for both (32 bytes).

use ::aes::Aes256;
use ::aes::cipher::generic_array::GenericArray;
use ::aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

fn xor16(a: &mut [u8; 16], b: &[u8]) {
    for (x, y) in a.iter_mut().zip(b) {
        *x ^= y;
    }
}

/// Encrypt `buffer` in place. Its length must be a multiple of 16.
pub fn ige_encrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(buffer.len() % 16, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher = [0u8; 16];
    let mut prev_plain = [0u8; 16];
    prev_cipher.copy_from_slice(&iv[..16]);
    prev_plain.copy_from_slice(&iv[16..]);

    for chunk in buffer.chunks_exact_mut(16) {
        let mut plain = [0u8; 16];
        plain.copy_from_slice(chunk);

        let mut block = plain;
        xor16(&mut block, &prev_cipher);
        let mut ga = ::aes::Block::from(block);
        cipher.encrypt_block(&mut ga);
        block.copy_from_slice(&ga);
        xor16(&mut block, &prev_plain);

        chunk.copy_from_slice(&block);
        prev_cipher = block;
        prev_plain = plain;
    }
}

/// Decrypt `buffer` in place. Its length must be a multiple of 16.
pub fn ige_decrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(buffer.len() % 16, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher = [0u8; 16];
    let mut prev_plain = [0u8; 16];
    prev_cipher.copy_from_slice(&iv[..16]);
    prev_plain.copy_from_slice(&iv[16..]);

    for chunk in buffer.chunks_exact_mut(16) {
        let mut encrypted = [0u8; 16];
        encrypted.copy_from_slice(chunk);

        let mut block = encrypted;
        xor16(&mut block, &prev_plain);
        let mut ga = ::aes::Block::from(block);
        cipher.decrypt_block(&mut ga);
        block.copy_from_slice(&ga);
        xor16(&mut block, &prev_cipher);

        chunk.copy_from_slice(&block);
        prev_cipher = encrypted;
        prev_plain = block;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = [7u8; 32];
        let iv: [u8; 32] = core::array::from_fn(|i| i as u8);
        let original: Vec<u8> = (0..64u8).collect();

        let mut buf = original.clone();
        ige_encrypt(&mut buf, &key, &iv);
        assert_ne!(buf, original);
        ige_decrypt(&mut buf, &key, &iv);
        assert_eq!(buf, original);
    }

    #[test]
    fn blocks_are_chained() {
        let key = [1u8; 32];
        let iv = [2u8; 32];
        let mut buf = [0u8; 32];
        ige_encrypt(&mut buf, &key, &iv);
        assert_ne!(buf[..16], buf[16..]);
    }
}
