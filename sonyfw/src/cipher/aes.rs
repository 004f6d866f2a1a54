//! Gen-2 and gen-3 crypters: AES-128-ECB and a double-layer wrap of it with
//! a first-block bypass, grounded on `fwtool/sony/fdat.py`'s
//! `decryptBlockV2`/`decryptBlockV3`.

use super::CipherBlock;
use crate::error::{Error, Result};
use aes::Aes128;
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};

type EcbDec = ecb::Decryptor<Aes128>;
type EcbEnc = ecb::Encryptor<Aes128>;

fn ecb_decrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = data.to_vec();
    EcbDec::new(key.into())
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| Error::Malformed(format!("aes-ecb decrypt: {e}")))?;
    Ok(buf)
}

fn ecb_encrypt(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let pad_len = data.len();
    let mut buf = data.to_vec();
    EcbEnc::new(key.into())
        .encrypt_padded_mut::<NoPadding>(&mut buf, pad_len)
        .expect("block length already a multiple of the AES block size")
        .to_vec()
}

/// AES-128-ECB with a single fixed key.
pub struct AesCrypter {
    key: [u8; 16],
    block_size: usize,
}

impl AesCrypter {
    #[must_use]
    pub fn new(key: [u8; 16], block_size: usize) -> Self {
        Self { key, block_size }
    }
}

impl CipherBlock for AesCrypter {
    fn decrypt_block_size(&self) -> usize {
        self.block_size
    }

    fn decrypt_block(&mut self, _index: usize, _is_last: bool, block: &[u8]) -> Result<Vec<u8>> {
        ecb_decrypt(&self.key, block)
    }

    fn encrypt_block(&mut self, _index: usize, _is_last: bool, block: &[u8]) -> Result<Vec<u8>> {
        Ok(ecb_encrypt(&self.key, block))
    }
}

/// Wraps two [`AesCrypter`] passes. Every block except the first is
/// double-encrypted; the first block splits its 1024 bytes in half, with
/// `[0..512)` carrying only the outer (single-AES) pass and `[512..1024)`
/// carrying both, so the format's earliest header fields are still
/// recoverable by a plain gen-2 `AesCrypter` probing with the outer key
/// alone.
pub struct DoubleAesCrypter {
    inner: AesCrypter,
    outer: AesCrypter,
    block_size: usize,
}

impl DoubleAesCrypter {
    #[must_use]
    pub fn new(inner_key: [u8; 16], outer_key: [u8; 16], block_size: usize) -> Self {
        Self {
            inner: AesCrypter::new(inner_key, block_size),
            outer: AesCrypter::new(outer_key, block_size),
            block_size,
        }
    }

    fn half(&self) -> usize {
        self.block_size / 2
    }
}

impl CipherBlock for DoubleAesCrypter {
    fn decrypt_block_size(&self) -> usize {
        self.block_size
    }

    fn decrypt_block(&mut self, index: usize, is_last: bool, block: &[u8]) -> Result<Vec<u8>> {
        if index == 0 {
            let half = self.half();
            let first_half = self.outer.decrypt_block(0, false, &block[..half])?;
            let once = self.outer.decrypt_block(0, false, &block[half..])?;
            let second_half = self.inner.decrypt_block(0, false, &once)?;
            let mut out = first_half;
            out.extend(second_half);
            Ok(out)
        } else {
            let once = self.outer.decrypt_block(index, is_last, block)?;
            self.inner.decrypt_block(index, is_last, &once)
        }
    }

    fn encrypt_block(&mut self, index: usize, is_last: bool, block: &[u8]) -> Result<Vec<u8>> {
        if index == 0 {
            let half = self.half();
            let first_half = self.outer.encrypt_block(0, false, &block[..half])?;
            let once = self.inner.encrypt_block(0, false, &block[half..])?;
            let second_half = self.outer.encrypt_block(0, false, &once)?;
            let mut out = first_half;
            out.extend(second_half);
            Ok(out)
        } else {
            let once = self.inner.encrypt_block(index, is_last, block)?;
            self.outer.encrypt_block(index, is_last, &once)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_crypter_round_trips() {
        let key = [0x42u8; 16];
        let mut enc = AesCrypter::new(key, 32);
        let plain = [7u8; 32];
        let cipher = enc.encrypt_block(0, true, &plain).unwrap();
        assert_ne!(cipher, plain);

        let mut dec = AesCrypter::new(key, 32);
        let recovered = dec.decrypt_block(0, true, &cipher).unwrap();
        assert_eq!(recovered, plain);
    }

    #[test]
    fn double_aes_round_trips_first_and_later_blocks() {
        let key1 = [0x11u8; 16];
        let key2 = [0x22u8; 16];
        let mut enc = DoubleAesCrypter::new(key1, key2, 1024);
        let block0 = vec![0xabu8; 1024];
        let block1 = vec![0xcdu8; 1024];
        let c0 = enc.encrypt_block(0, false, &block0).unwrap();
        let c1 = enc.encrypt_block(1, true, &block1).unwrap();

        let mut dec = DoubleAesCrypter::new(key1, key2, 1024);
        assert_eq!(dec.decrypt_block(0, false, &c0).unwrap(), block0);
        assert_eq!(dec.decrypt_block(1, true, &c1).unwrap(), block1);
    }

    #[test]
    fn first_block_half_matches_plain_single_aes() {
        // bytes [0..512) of the first block only ever go through the
        // outer pass, so a lone AesCrypter on the outer key recovers them.
        let key1 = [0x33u8; 16];
        let key2 = [0x44u8; 16];
        let mut enc = DoubleAesCrypter::new(key1, key2, 1024);
        let block0 = vec![0x55u8; 1024];
        let cipher = enc.encrypt_block(0, false, &block0).unwrap();

        let mut single = AesCrypter::new(key2, 512);
        let recovered_half = single.decrypt_block(0, false, &cipher[..512]).unwrap();
        assert_eq!(recovered_half, block0[..512]);
    }

    #[test]
    fn first_half_decrypts_under_an_independent_gen2_outer_pass() {
        // Fixed-vector check independent of DoubleAesCrypter's own
        // encrypt_block: ciphertext for [0..512) is produced by a bare
        // gen-2 AesCrypter keyed on the outer key alone, then fed straight
        // into DoubleAesCrypter::decrypt_block as the first half of block 0.
        let key1 = [0x33u8; 16];
        let key2 = [0x44u8; 16];
        let half_plain = vec![0x77u8; 512];

        let mut plain_gen2 = AesCrypter::new(key2, 512);
        let half_cipher = plain_gen2.encrypt_block(0, false, &half_plain).unwrap();

        let mut block = half_cipher;
        block.extend(vec![0u8; 512]); // second half content is irrelevant here

        let mut dec = DoubleAesCrypter::new(key1, key2, 1024);
        let recovered = dec.decrypt_block(0, false, &block).unwrap();
        assert_eq!(recovered[..512], half_plain[..]);
    }
}
