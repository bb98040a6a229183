//! # Crypto Codec
//!
//! Pure transforms used by the two wire protocols:
//! - RSA PKCS#1 v1.5 block encryption/decryption for the legacy protocol
//! - HMAC-SHA256 signing and constant-time verification for the token protocol
//!
//! Nothing here holds state; key ownership lives in [`crate::utils::keys`].

use crate::error::CryptoError;
use hmac::{Hmac, Mac};
use rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, instrument};

type HmacSha256 = Hmac<Sha256>;

/// Length of an HMAC-SHA256 tag
pub const SIGNATURE_LEN: usize = 32;

/// Generate a fresh RSA key pair with a `bits`-bit modulus.
#[instrument]
pub fn generate_key_pair(bits: usize) -> Result<(RsaPublicKey, RsaPrivateKey), CryptoError> {
    let private = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let public = RsaPublicKey::from(&private);
    debug!(bits, "Generated RSA key pair");
    Ok((public, private))
}

/// Size in bytes of one legacy-protocol block for this key.
pub fn block_size(key: &RsaPrivateKey) -> usize {
    key.size()
}

/// Decrypt one legacy-protocol block.
///
/// Every failure collapses into [`CryptoError::Decryption`]: wrong key,
/// truncated block and bad padding are indistinguishable to the caller.
pub fn decrypt_block(key: &RsaPrivateKey, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if cipher.len() != key.size() {
        return Err(CryptoError::Decryption);
    }
    key.decrypt(Pkcs1v15Encrypt, cipher)
        .map_err(|_| CryptoError::Decryption)
}

/// Encrypt `plain` into one block. Sender side only.
pub fn encrypt_block(key: &RsaPublicKey, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
    key.encrypt(&mut OsRng, Pkcs1v15Encrypt, plain)
        .map_err(|_| CryptoError::Encryption)
}

/// HMAC-SHA256 of `payload` under `secret`.
pub fn sign_token(secret: &[u8], payload: &[u8]) -> Result<[u8; SIGNATURE_LEN], CryptoError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| CryptoError::InvalidMacKey)?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().into())
}

/// Check `provided` against the HMAC of `payload` without early exit.
///
/// The comparison runs over the full tag regardless of where the first
/// mismatching byte is. A length mismatch is rejected up front; tag length is
/// public.
pub fn verify_token(secret: &[u8], payload: &[u8], provided: &[u8]) -> bool {
    let expected = match sign_token(secret, payload) {
        Ok(tag) => tag,
        Err(_) => return false,
    };
    if provided.len() != expected.len() {
        return false;
    }
    expected[..].ct_eq(provided).into()
}
