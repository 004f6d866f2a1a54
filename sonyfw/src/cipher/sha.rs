//! Gen-1 crypter: a SHA-1 keystream XOR with state that rolls forward
//! across blocks, grounded on `fwtool/sony/fdat.py`'s `decryptBlockV1`.

use super::CipherBlock;
use crate::error::Result;
use sha1::{Digest, Sha1};

/// SHA-1 keystream cipher. The keystream for block `i` continues the
/// digest chain left by block `i - 1`; there is no per-block reset, so a
/// `ShaCrypter` cannot be shared across unrelated streams.
pub struct ShaCrypter {
    digest: [u8; 20],
    tail: [u8; 20],
    block_size: usize,
}

impl ShaCrypter {
    /// `key` is the 40-byte per-device secret: `key[0..20]` seeds the
    /// digest chain, `key[20..40]` is appended before every re-hash.
    #[must_use]
    pub fn new(key: [u8; 40], block_size: usize) -> Self {
        let mut digest = [0u8; 20];
        let mut tail = [0u8; 20];
        digest.copy_from_slice(&key[0..20]);
        tail.copy_from_slice(&key[20..40]);
        Self {
            digest,
            tail,
            block_size,
        }
    }

    fn keystream(&mut self, len: usize) -> Vec<u8> {
        rolling_keystream(&mut self.digest, &self.tail, len)
    }

    fn xor(&mut self, data: &[u8]) -> Vec<u8> {
        let mask = self.keystream(data.len());
        data.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect()
    }
}

/// Generates `len` bytes of the rolling SHA-1 keystream shared by
/// [`ShaCrypter`] and `sonyfw::msfirm`'s section cipher: repeatedly
/// `digest := SHA1(digest || tail)`, concatenating each 20-byte digest.
/// `digest` is updated in place so a caller can resume the stream.
pub(crate) fn rolling_keystream(digest: &mut [u8; 20], tail: &[u8; 20], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 20);
    while out.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(&digest[..]);
        hasher.update(tail);
        let result = hasher.finalize();
        digest.copy_from_slice(&result);
        out.extend_from_slice(&result);
    }
    out.truncate(len);
    out
}

impl CipherBlock for ShaCrypter {
    fn decrypt_block_size(&self) -> usize {
        self.block_size
    }

    fn decrypt_block(&mut self, _index: usize, _is_last: bool, block: &[u8]) -> Result<Vec<u8>> {
        Ok(self.xor(block))
    }

    fn encrypt_block(&mut self, _index: usize, _is_last: bool, block: &[u8]) -> Result<Vec<u8>> {
        // Self-inverse: the keystream XOR does not care about direction.
        Ok(self.xor(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_is_self_inverse_across_multiple_blocks() {
        let key = [0x5au8; 40];
        let mut enc = ShaCrypter::new(key, 1000);
        let block_a = vec![0x11u8; 1000];
        let block_b = vec![0x22u8; 1000];
        let cipher_a = enc.decrypt_block(0, false, &block_a).unwrap();
        let cipher_b = enc.decrypt_block(1, true, &block_b).unwrap();

        let mut dec = ShaCrypter::new(key, 1000);
        let plain_a = dec.decrypt_block(0, false, &cipher_a).unwrap();
        let plain_b = dec.decrypt_block(1, true, &cipher_b).unwrap();
        assert_eq!(plain_a, block_a);
        assert_eq!(plain_b, block_b);
    }

    #[test]
    fn digest_state_rolls_forward() {
        let key = [0x01u8; 40];
        let mut a = ShaCrypter::new(key, 16);
        let mut b = ShaCrypter::new(key, 16);
        let zeros = [0u8; 16];
        let first = a.decrypt_block(0, false, &zeros).unwrap();
        let second_independent = b.decrypt_block(0, false, &zeros).unwrap();
        // Same seed, same first block.
        assert_eq!(first, second_independent);
        let second_chained = a.decrypt_block(1, true, &zeros).unwrap();
        // The second block's keystream differs because the digest moved on.
        assert_ne!(second_chained, first);
    }
}
