//! A [`KeyProvider`] backed by environment variables. The core never
//! embeds secret key material (spec: "the core does not embed them by
//! value"); this is the thinnest possible external store, reading
//! hex-encoded bytes from `SONYFW_KEY_<CRYPTER>_<KIND>` so the CLI can be
//! pointed at real keys without them ever touching this repository.

use anyhow::{Context, Result, anyhow};
use sonyfw::{CrypterId, KeyProvider};

/// Reads crypter key material from environment variables.
pub struct EnvKeyProvider;

fn hex_env<const N: usize>(name: &str) -> Result<[u8; N]> {
    let raw = std::env::var(name)
        .with_context(|| format!("environment variable {name} is not set (need {} hex bytes)", N))?;
    let bytes = hex_decode(raw.trim())
        .ok_or_else(|| anyhow!("{name} is not valid hex"))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| anyhow!("{name} decoded to {} bytes, expected {}", v.len(), N))
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

impl KeyProvider for EnvKeyProvider {
    fn sha_key(&self, id: CrypterId) -> sonyfw::Result<[u8; 40]> {
        hex_env(&format!("SONYFW_KEY_{id}_SHA"))
            .map_err(|e| sonyfw::Error::Unsupported(e.to_string()))
    }

    fn aes_key(&self, id: CrypterId) -> sonyfw::Result<[u8; 16]> {
        hex_env(&format!("SONYFW_KEY_{id}_AES"))
            .map_err(|e| sonyfw::Error::Unsupported(e.to_string()))
    }

    fn double_aes_keys(&self, id: CrypterId) -> sonyfw::Result<([u8; 16], [u8; 16])> {
        let inner = hex_env(&format!("SONYFW_KEY_{id}_AES1"))
            .map_err(|e| sonyfw::Error::Unsupported(e.to_string()))?;
        let outer = hex_env(&format!("SONYFW_KEY_{id}_AES2"))
            .map_err(|e| sonyfw::Error::Unsupported(e.to_string()))?;
        Ok((inner, outer))
    }

    fn aes_cbc_keys(&self, id: CrypterId) -> sonyfw::Result<([u8; 16], [u8; 16])> {
        let ecb = hex_env(&format!("SONYFW_KEY_{id}_ECB"))
            .map_err(|e| sonyfw::Error::Unsupported(e.to_string()))?;
        let cbc = hex_env(&format!("SONYFW_KEY_{id}_CBC"))
            .map_err(|e| sonyfw::Error::Unsupported(e.to_string()))?;
        Ok((ecb, cbc))
    }

    fn ms_firm_key(&self, id: CrypterId) -> sonyfw::Result<[u8; 64]> {
        hex_env(&format!("SONYFW_KEY_{id}_MS"))
            .map_err(|e| sonyfw::Error::Unsupported(e.to_string()))
    }
}
