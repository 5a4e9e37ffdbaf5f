//! Credential vault
//!
//! Encrypts individual secret fields at rest with AES-256-CBC. Every call to
//! [`Vault::encrypt`] draws a fresh 16-byte IV; the stored form is the
//! envelope `hex(iv) ":" hex(ciphertext)`, which is what the database holds
//! and what [`Vault::decrypt`] parses back.

use crate::{Error, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Key length in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// IV length in bytes (one AES block)
pub const IV_LEN: usize = 16;

const BLOCK_LEN: usize = 16;
const SEPARATOR: char = ':';

/// Symmetric vault for secret profile fields
#[derive(Clone)]
pub struct Vault {
    key: [u8; KEY_LEN],
}

impl Vault {
    /// Build a vault from configured key material.
    ///
    /// The material is truncated or zero-padded to exactly 32 bytes.
    pub fn new(material: impl AsRef<[u8]>) -> Self {
        let material = material.as_ref();
        let mut key = [0u8; KEY_LEN];
        let n = material.len().min(KEY_LEN);
        key[..n].copy_from_slice(&material[..n]);
        Self { key }
    }

    /// Encrypt a plaintext field into an envelope
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        format!("{}{}{}", hex::encode(iv), SEPARATOR, hex::encode(ciphertext))
    }

    /// Decrypt an envelope produced by [`Vault::encrypt`]
    pub fn decrypt(&self, envelope: &str) -> Result<String> {
        let (iv_hex, ct_hex) = envelope
            .split_once(SEPARATOR)
            .ok_or_else(|| Error::Format("missing ':' separator".to_string()))?;

        let iv = hex::decode(iv_hex)
            .map_err(|e| Error::Format(format!("invalid IV hex: {}", e)))?;
        let iv: [u8; IV_LEN] = iv
            .try_into()
            .map_err(|_| Error::Format("IV must be 16 bytes".to_string()))?;

        let ciphertext = hex::decode(ct_hex)
            .map_err(|e| Error::Format(format!("invalid ciphertext hex: {}", e)))?;
        if ciphertext.len() % BLOCK_LEN != 0 {
            return Err(Error::Crypto(format!(
                "ciphertext length {} is not a multiple of the block size",
                ciphertext.len()
            )));
        }

        let plaintext = Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| Error::Crypto("bad padding or wrong key".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| Error::Crypto("decrypted field is not UTF-8".to_string()))
    }

    /// Decrypt an optional stored field
    pub fn decrypt_opt(&self, envelope: Option<&str>) -> Result<Option<String>> {
        envelope.map(|e| self.decrypt(e)).transpose()
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").field("key", &"<redacted>").finish()
    }
}

/// Generate `n` random bytes as lowercase hex
pub fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
