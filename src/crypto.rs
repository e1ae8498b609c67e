//! # Crypto Engine
//!
//! One stateful engine per connection:
//! - RSA key pair (local) and the peer's RSA public key (remote)
//! - RSA-OAEP for bootstrapping the session
//! - AES-CBC session encryption through a [`SymmetricContext`]
//! - Diffie-Hellman as an alternative way to fill the symmetric context
//! - Hashing, HMAC and key fingerprints
//!
//! ## Key lifecycle
//!
//! ```text
//! generate_key_pair / import_key_pair_pem     -> local key (fixed for the session)
//! set_remote_public_key[_pem]                 -> remote key (set once)
//! generate_symmetric_key | install_symmetric  -> symmetric context (RSA path)
//! generate_dh_key_pair + compute_dh_secret    -> symmetric context (DH path)
//! ```

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use rsa::pkcs8::{
    pkcs5::pbes2, DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey,
    LineEnding, PrivateKeyInfo,
};
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};

use crate::cipher::{CipherMode, SymmetricContext};
use crate::dh::{self, DhKeyPair};
use crate::error::{CryptoError, CryptoResult};
use crate::fingerprint::fingerprint;

type HmacSha256 = Hmac<Sha256>;

/// Default RSA modulus size
pub const DEFAULT_RSA_BITS: usize = 2048;

/// PBKDF2 rounds for passphrase-protected private keys
const PBKDF2_ROUNDS: u32 = 100_000;

/// PEM label of an encrypted PKCS#8 private key
const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

/// Digest algorithms exposed by [`CryptoEngine::hash`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

/// Hybrid asymmetric/symmetric crypto state of one connection
#[derive(Default)]
pub struct CryptoEngine {
    local_keypair: Option<RsaPrivateKey>,
    remote_key: Option<RsaPublicKey>,
    symmetric: Option<SymmetricContext>,
    dh: Option<DhKeyPair>,
}

impl CryptoEngine {
    /// Empty engine: no keys of any kind
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine around an existing local key pair
    pub fn with_key_pair(keypair: RsaPrivateKey) -> Self {
        Self {
            local_keypair: Some(keypair),
            ..Self::default()
        }
    }

    /// Generate both the RSA key pair and a symmetric context
    pub fn generate_keys(&mut self, bits: usize, mode: CipherMode) -> CryptoResult<()> {
        self.generate_key_pair(bits)?;
        self.generate_symmetric_key(mode);
        Ok(())
    }

    /// Generate the local RSA key pair (public exponent 65537)
    pub fn generate_key_pair(&mut self, bits: usize) -> CryptoResult<()> {
        let keypair = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        self.local_keypair = Some(keypair);
        Ok(())
    }

    /// Replace the symmetric context with fresh random material
    pub fn generate_symmetric_key(&mut self, mode: CipherMode) {
        self.symmetric = Some(SymmetricContext::generate(mode));
    }

    /// Install key material received from the peer
    pub fn install_symmetric(&mut self, context: SymmetricContext) {
        self.symmetric = Some(context);
    }

    pub fn symmetric(&self) -> Option<&SymmetricContext> {
        self.symmetric.as_ref()
    }

    pub fn has_local_key_pair(&self) -> bool {
        self.local_keypair.is_some()
    }

    pub fn has_remote_key(&self) -> bool {
        self.remote_key.is_some()
    }

    /// Generate an ephemeral DH key pair over the fixed group
    pub fn generate_dh_key_pair(&mut self) {
        self.dh = Some(DhKeyPair::generate());
    }

    /// Local DH public value to send to the peer
    pub fn dh_public_value(&self) -> CryptoResult<&BigUint> {
        self.dh
            .as_ref()
            .map(DhKeyPair::public_value)
            .ok_or(CryptoError::DhKeyNotSet)
    }

    /// Agree on a secret with the peer and overwrite the symmetric context
    /// with material derived from it.
    pub fn compute_dh_secret(&mut self, remote_public: &BigUint) -> CryptoResult<()> {
        let dh = self.dh.as_ref().ok_or(CryptoError::DhKeyNotSet)?;
        let secret = dh.shared_secret(remote_public)?;
        self.symmetric = Some(dh::derive_symmetric_context(&secret)?);
        Ok(())
    }

    /// Store the peer's public key from its PEM form
    pub fn set_remote_public_key_pem(&mut self, pem: &[u8]) -> CryptoResult<()> {
        let text = std::str::from_utf8(pem)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        let key = RsaPublicKey::from_public_key_pem(text)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        self.set_remote_public_key(key)
    }

    /// Store the peer's public key
    pub fn set_remote_public_key(&mut self, key: RsaPublicKey) -> CryptoResult<()> {
        if self.remote_key.is_some() {
            return Err(CryptoError::RemoteKeyAlreadySet);
        }
        self.remote_key = Some(key);
        Ok(())
    }

    /// Drop everything negotiated with a peer; the local key pair stays
    pub fn discard_session_keys(&mut self) {
        self.remote_key = None;
        self.symmetric = None;
        self.dh = None;
    }

    /// RSA-OAEP encrypt with the remote public key
    pub fn asymmetric_encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let key = self.remote_key()?;
        key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))
    }

    /// RSA-OAEP decrypt with the local private key
    pub fn asymmetric_decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        let key = self.local_keypair()?;
        key.decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }

    pub fn symmetric_encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        self.symmetric_context()?.encrypt(plaintext)
    }

    pub fn symmetric_decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        self.symmetric_context()?.decrypt(ciphertext)
    }

    /// HMAC-SHA256 keyed with the session key
    ///
    /// Not applied automatically by the transport.
    pub fn generate_hmac(&self, message: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(self.hmac(message)?.finalize().into_bytes().to_vec())
    }

    /// Constant-time check of a tag produced by [`Self::generate_hmac`]
    pub fn verify_hmac(&self, message: &[u8], tag: &[u8]) -> CryptoResult<bool> {
        Ok(self.hmac(message)?.verify_slice(tag).is_ok())
    }

    fn hmac(&self, message: &[u8]) -> CryptoResult<HmacSha256> {
        let ctx = self.symmetric_context()?;
        let mut mac = HmacSha256::new_from_slice(ctx.key())
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        mac.update(message);
        Ok(mac)
    }

    /// One-shot digest
    pub fn hash(message: &[u8], algorithm: HashAlgorithm) -> Vec<u8> {
        match algorithm {
            HashAlgorithm::Sha256 => Sha256::digest(message).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(message).to_vec(),
        }
    }

    /// SubjectPublicKeyInfo PEM of the local public key
    pub fn local_public_key_pem(&self) -> CryptoResult<String> {
        RsaPublicKey::from(self.local_keypair()?)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    /// SubjectPublicKeyInfo PEM of the remote public key
    pub fn remote_public_key_pem(&self) -> CryptoResult<String> {
        self.remote_key()?
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    pub fn local_fingerprint(&self) -> CryptoResult<String> {
        Ok(fingerprint(self.local_public_key_pem()?.as_bytes()))
    }

    pub fn remote_fingerprint(&self) -> CryptoResult<String> {
        Ok(fingerprint(self.remote_public_key_pem()?.as_bytes()))
    }

    /// PKCS#8 PEM of the local key pair, encrypted under `passphrase` when
    /// one is given (PBES2: PBKDF2-SHA256 + AES-256-CBC).
    pub fn export_key_pair_pem(&self, passphrase: Option<&str>) -> CryptoResult<String> {
        let keypair = self.local_keypair()?;
        let encoding = |e: rsa::pkcs8::Error| CryptoError::Encoding(e.to_string());

        let Some(passphrase) = passphrase else {
            let pem = keypair.to_pkcs8_pem(LineEnding::LF).map_err(encoding)?;
            return Ok(pem.to_string());
        };

        let der = keypair.to_pkcs8_der().map_err(encoding)?;
        let info = PrivateKeyInfo::try_from(der.as_bytes())
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;

        let mut salt = [0u8; 16];
        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);
        let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(PBKDF2_ROUNDS, &salt, &iv)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;

        let encrypted = info
            .encrypt_with_params(params, passphrase.as_bytes())
            .map_err(encoding)?;
        let pem = encrypted
            .to_pem(ENCRYPTED_KEY_LABEL, LineEnding::LF)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        Ok(pem.to_string())
    }

    /// Load the local key pair from PKCS#8 PEM
    pub fn import_key_pair_pem(&mut self, pem: &str, passphrase: Option<&str>) -> CryptoResult<()> {
        let keypair = match passphrase {
            Some(passphrase) => RsaPrivateKey::from_pkcs8_encrypted_pem(pem, passphrase.as_bytes()),
            None => RsaPrivateKey::from_pkcs8_pem(pem),
        }
        .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;

        self.local_keypair = Some(keypair);
        Ok(())
    }

    /// The local RSA key pair, e.g. to hand the same identity to other engines
    pub fn local_key_pair(&self) -> CryptoResult<&RsaPrivateKey> {
        self.local_keypair()
    }

    fn local_keypair(&self) -> CryptoResult<&RsaPrivateKey> {
        self.local_keypair.as_ref().ok_or(CryptoError::LocalKeyNotSet)
    }

    fn remote_key(&self) -> CryptoResult<&RsaPublicKey> {
        self.remote_key.as_ref().ok_or(CryptoError::RemoteKeyNotSet)
    }

    fn symmetric_context(&self) -> CryptoResult<&SymmetricContext> {
        self.symmetric.as_ref().ok_or(CryptoError::SymmetricKeyNotSet)
    }
}

/// Shared key pairs for tests; RSA generation is too slow to repeat per test
#[cfg(test)]
pub(crate) fn test_key_pair(index: usize) -> RsaPrivateKey {
    use std::sync::OnceLock;

    static KEYS: OnceLock<Vec<RsaPrivateKey>> = OnceLock::new();
    KEYS.get_or_init(|| {
        (0..2)
            .map(|_| RsaPrivateKey::new(&mut OsRng, 1024).unwrap())
            .collect()
    })[index]
        .clone()
}
