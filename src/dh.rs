//! # Diffie-Hellman Key Agreement
//!
//! Finite-field DH over the 2048-bit MODP group of RFC 3526 with generator
//! 5. The group is a process-wide constant shared by every exchange.
//!
//! The shared secret feeds the symmetric layer through
//! [`derive_symmetric_context`]: SHA-512 over the decimal rendering of the
//! secret, sliced into key, IV and salt. The salt slice overlaps the tail of
//! the IV slice; peers depend on that exact layout so it is kept as is.

use std::sync::OnceLock;

use rand::{rngs::OsRng, RngCore};
use rsa::BigUint;
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use crate::cipher::SymmetricContext;
use crate::error::{CryptoError, CryptoResult};

const DH_PRIME_HEX: &[u8] = b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

const DH_GENERATOR: u32 = 5;

/// Private exponent size in bytes
const PRIVATE_EXPONENT_SIZE: usize = 32;

/// Fixed DH group
#[derive(Debug)]
pub struct DhParameters {
    pub prime: BigUint,
    pub generator: BigUint,
}

/// The shared group every exchange uses
pub fn dh_parameters() -> &'static DhParameters {
    static PARAMS: OnceLock<DhParameters> = OnceLock::new();
    PARAMS.get_or_init(|| DhParameters {
        prime: BigUint::parse_bytes(DH_PRIME_HEX, 16)
            .unwrap_or_else(|| unreachable!("DH prime constant is valid hex")),
        generator: BigUint::from(DH_GENERATOR),
    })
}

/// Ephemeral DH key pair
pub struct DhKeyPair {
    private: BigUint,
    public: BigUint,
}

impl DhKeyPair {
    /// Draw a random private exponent and compute `g^x mod p`
    pub fn generate() -> Self {
        let params = dh_parameters();
        let mut bytes = [0u8; PRIVATE_EXPONENT_SIZE];
        OsRng.fill_bytes(&mut bytes);
        // Keep the exponent full size
        bytes[0] |= 0x80;
        let private = BigUint::from_bytes_be(&bytes);
        bytes.zeroize();

        let public = params.generator.modpow(&private, &params.prime);
        Self { private, public }
    }

    pub fn public_value(&self) -> &BigUint {
        &self.public
    }

    /// Compute `y^x mod p` for the peer's public value `y`
    pub fn shared_secret(&self, remote_public: &BigUint) -> CryptoResult<BigUint> {
        validate_public_value(remote_public)?;
        Ok(remote_public.modpow(&self.private, &dh_parameters().prime))
    }
}

/// Reject values outside `(1, p-1)`
pub fn validate_public_value(value: &BigUint) -> CryptoResult<()> {
    let one = BigUint::from(1u32);
    let upper = &dh_parameters().prime - &one;
    if *value <= one || *value >= upper {
        return Err(CryptoError::InvalidDhPublicValue);
    }
    Ok(())
}

/// Render a DH value for the wire (decimal ASCII)
pub fn encode_public_value(value: &BigUint) -> Vec<u8> {
    value.to_str_radix(10).into_bytes()
}

/// Parse a DH value received from the wire
pub fn decode_public_value(data: &[u8]) -> CryptoResult<BigUint> {
    BigUint::parse_bytes(data, 10).ok_or(CryptoError::InvalidDhPublicValue)
}

/// Slice `SHA-512(decimal(secret))` into key `[0..32]`, IV `[32..64]` and
/// salt `[56..64]`
pub fn derive_symmetric_context(secret: &BigUint) -> CryptoResult<SymmetricContext> {
    let mut decimal = secret.to_str_radix(10);
    let digest = Sha512::digest(decimal.as_bytes());
    decimal.zeroize();

    SymmetricContext::from_parts(
        digest[0..32].to_vec(),
        digest[32..64].to_vec(),
        digest[56..64].to_vec(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherMode;

    #[test]
    fn test_group_constants() {
        let params = dh_parameters();
        assert_eq!(params.prime.bits(), 2048);
        assert_eq!(params.generator, BigUint::from(5u32));
    }

    #[test]
    fn test_shared_secret_agreement() {
        let alice = DhKeyPair::generate();
        let bob = DhKeyPair::generate();

        let a = alice.shared_secret(bob.public_value()).unwrap();
        let b = bob.shared_secret(alice.public_value()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_degenerate_values() {
        let kp = DhKeyPair::generate();
        let p = dh_parameters().prime.clone();
        let p_minus_one = &p - &BigUint::from(1u32);

        for bad in [BigUint::from(0u32), BigUint::from(1u32), p_minus_one, p] {
            assert!(matches!(
                kp.shared_secret(&bad),
                Err(CryptoError::InvalidDhPublicValue)
            ));
        }
    }

    #[test]
    fn test_wire_encoding() {
        let kp = DhKeyPair::generate();
        let encoded = encode_public_value(kp.public_value());
        assert!(encoded.iter().all(u8::is_ascii_digit));
        assert_eq!(&decode_public_value(&encoded).unwrap(), kp.public_value());
        assert!(decode_public_value(b"12ab").is_err());
    }

    #[test]
    fn test_derivation_slices() {
        // SHA-512("12345")
        let ctx = derive_symmetric_context(&BigUint::from(12345u32)).unwrap();

        assert_eq!(
            hex::encode(ctx.key()),
            "3627909a29c31381a071ec27f7c9ca97726182aed29a7ddd2e54353322cfb30a"
        );
        assert_eq!(
            hex::encode(ctx.iv()),
            "bb9e3a6df2ac2c20fe23436311d678564d0c8d305930575f60e2d3d048184d79"
        );
        assert_eq!(hex::encode(ctx.salt()), "60e2d3d048184d79");
        assert_eq!(&ctx.iv()[24..], ctx.salt());
        assert_eq!(ctx.mode(), CipherMode::Aes256Cbc);
    }
}
