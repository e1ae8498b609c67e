//! # Symmetric Cipher Layer
//!
//! AES in CBC mode with PKCS#7 padding. The key size is chosen by
//! [`CipherMode`]; key, IV and salt travel together in a
//! [`SymmetricContext`] which is fixed for the lifetime of a session.
//!
//! Every encrypt/decrypt call builds a fresh cipher instance from the
//! context and finalizes it, so no chaining state leaks between messages.

use std::fmt;
use std::str::FromStr;

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};

/// AES block size, also the number of IV bytes consumed per message
pub const BLOCK_SIZE: usize = 16;

/// Salt length for randomly generated contexts
pub const SALT_SIZE: usize = 8;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes192CbcEnc = cbc::Encryptor<Aes192>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Block chaining scheme of a cipher mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainingScheme {
    Cbc,
}

/// Symmetric cipher selection
///
/// Textual form is `aes_<bits>_cbc`; it is parsed once (config, CLI) and the
/// enum is used everywhere after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CipherMode {
    #[serde(rename = "aes_128_cbc")]
    Aes128Cbc,
    #[serde(rename = "aes_192_cbc")]
    Aes192Cbc,
    #[default]
    #[serde(rename = "aes_256_cbc")]
    Aes256Cbc,
}

impl CipherMode {
    /// Key size in bits
    pub fn bits(self) -> u16 {
        match self {
            CipherMode::Aes128Cbc => 128,
            CipherMode::Aes192Cbc => 192,
            CipherMode::Aes256Cbc => 256,
        }
    }

    /// Key size in bytes
    pub fn key_len(self) -> usize {
        self.bits() as usize / 8
    }

    pub fn scheme(self) -> ChainingScheme {
        ChainingScheme::Cbc
    }

    /// Infer the mode from a received key
    pub fn from_key_len(len: usize) -> CryptoResult<Self> {
        match len {
            16 => Ok(CipherMode::Aes128Cbc),
            24 => Ok(CipherMode::Aes192Cbc),
            32 => Ok(CipherMode::Aes256Cbc),
            other => Err(CryptoError::InvalidKeyLength(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CipherMode::Aes128Cbc => "aes_128_cbc",
            CipherMode::Aes192Cbc => "aes_192_cbc",
            CipherMode::Aes256Cbc => "aes_256_cbc",
        }
    }
}

impl FromStr for CipherMode {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes_128_cbc" => Ok(CipherMode::Aes128Cbc),
            "aes_192_cbc" => Ok(CipherMode::Aes192Cbc),
            "aes_256_cbc" => Ok(CipherMode::Aes256Cbc),
            _ => Err(CryptoError::InvalidCipherMode(s.to_string())),
        }
    }
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key material of an established (or establishing) session
///
/// Zeroized on drop. Equality is only available to tests.
#[derive(Clone)]
pub struct SymmetricContext {
    key: Vec<u8>,
    iv: Vec<u8>,
    salt: Vec<u8>,
    mode: CipherMode,
}

impl SymmetricContext {
    /// Generate random key material for `mode`
    ///
    /// Key and IV are both `mode.key_len()` bytes; only the first block of
    /// the IV feeds the cipher.
    pub fn generate(mode: CipherMode) -> Self {
        let mut key = vec![0u8; mode.key_len()];
        let mut iv = vec![0u8; mode.key_len()];
        let mut salt = vec![0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        OsRng.fill_bytes(&mut salt);

        Self {
            key,
            iv,
            salt,
            mode,
        }
    }

    /// Assemble a context from parts received over the wire
    ///
    /// The mode is implied by the key length.
    pub fn from_parts(key: Vec<u8>, iv: Vec<u8>, salt: Vec<u8>) -> CryptoResult<Self> {
        let mode = CipherMode::from_key_len(key.len())?;
        if iv.len() < BLOCK_SIZE {
            return Err(CryptoError::Decryption(format!(
                "IV too short: {} < {}",
                iv.len(),
                BLOCK_SIZE
            )));
        }

        Ok(Self {
            key,
            iv,
            salt,
            mode,
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    fn block_iv(&self) -> &[u8] {
        &self.iv[..BLOCK_SIZE]
    }

    /// Encrypt one message with a fresh cipher instance
    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let iv = self.block_iv();
        let bad_key = |e: cbc::cipher::InvalidLength| {
            CryptoError::Encryption(format!("Failed to create cipher: {}", e))
        };

        let ciphertext = match self.mode {
            CipherMode::Aes128Cbc => Aes128CbcEnc::new_from_slices(&self.key, iv)
                .map_err(bad_key)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            CipherMode::Aes192Cbc => Aes192CbcEnc::new_from_slices(&self.key, iv)
                .map_err(bad_key)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            CipherMode::Aes256Cbc => Aes256CbcEnc::new_from_slices(&self.key, iv)
                .map_err(bad_key)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        };

        Ok(ciphertext)
    }

    /// Decrypt one message with a fresh cipher instance
    pub fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::Decryption(format!(
                "Ciphertext length {} is not a positive multiple of {}",
                ciphertext.len(),
                BLOCK_SIZE
            )));
        }

        let iv = self.block_iv();
        let bad_key = |e: cbc::cipher::InvalidLength| {
            CryptoError::Decryption(format!("Failed to create cipher: {}", e))
        };

        let result = match self.mode {
            CipherMode::Aes128Cbc => Aes128CbcDec::new_from_slices(&self.key, iv)
                .map_err(bad_key)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            CipherMode::Aes192Cbc => Aes192CbcDec::new_from_slices(&self.key, iv)
                .map_err(bad_key)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            CipherMode::Aes256Cbc => Aes256CbcDec::new_from_slices(&self.key, iv)
                .map_err(bad_key)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        };

        result.map_err(|_| CryptoError::Decryption("Invalid padding".to_string()))
    }
}

impl fmt::Debug for SymmetricContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricContext")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl PartialEq for SymmetricContext {
    fn eq(&self, other: &Self) -> bool {
        self.mode == other.mode
            && self.key == other.key
            && self.iv == other.iv
            && self.salt == other.salt
    }
}

impl Drop for SymmetricContext {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
        self.salt.zeroize();
    }
}
