//! Crypto facade: password-derived AES, SHA-512 digests, secure random
//! bytes.
//!
//! Keys are derived with PBKDF2-HMAC-SHA-512 from the shared password plus
//! a per-context random salt, and payloads are sealed with AES-256-CBC
//! (PKCS#7). Both endpoints derive the same key from the same
//! (password, salt) pair, so only salt and IV ever travel on the wire.
//! Derived keys are zeroized on drop.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::error::{constants, Result, TransportError};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Salt length of an AES context.
pub const SALT_LEN: usize = 16;

/// IV length of an AES context (one AES block).
pub const IV_LEN: usize = 16;

/// Derived key length (AES-256).
pub const KEY_LEN: usize = 32;

/// PBKDF2 round count. Shared by construction on both endpoints, never
/// negotiated.
const PBKDF2_ROUNDS: u32 = 10_000;

/// A password-derived AES context bound to one salt/IV pair.
///
/// The lifecycle is tied to the owning endpoint: contexts are minted for
/// one challenge or one data channel and replaced only through a recovery
/// rejoin.
pub struct AesContext {
    salt: [u8; SALT_LEN],
    iv: [u8; IV_LEN],
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl AesContext {
    /// Mint a context with fresh random salt and IV.
    pub fn generate(password: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);
        Self::from_parts(password, salt, iv)
    }

    /// Reconstruct the peer's context from its transmitted salt and IV.
    pub fn from_parts(password: &str, salt: [u8; SALT_LEN], iv: [u8; IV_LEN]) -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2_hmac::<Sha512>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut *key);
        Self { salt, iv, key }
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    /// Encrypt a blob with AES-256-CBC / PKCS#7.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256CbcEnc::new_from_slices(&*self.key, &self.iv)
            .map_err(|_| TransportError::Crypto(constants::ERR_KEY_DERIVATION))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    /// Decrypt a blob. Fails on truncated input or bad padding.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256CbcDec::new_from_slices(&*self.key, &self.iv)
            .map_err(|_| TransportError::Crypto(constants::ERR_KEY_DERIVATION))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| TransportError::Crypto(constants::ERR_DECRYPTION_FAILED))
    }
}

impl std::fmt::Debug for AesContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesContext")
            .field("salt", &self.salt)
            .field("iv", &self.iv)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// SHA-512 digest of a byte blob.
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha512::digest(data));
    out
}

/// Cryptographically secure random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    OsRng.fill_bytes(&mut out);
    out
}

/// Cryptographically secure random array.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let ctx = AesContext::generate("password");
        for len in [0usize, 1, 15, 16, 17, 1024] {
            let plain = random_bytes(len);
            let sealed = ctx.encrypt(&plain).unwrap();
            assert_ne!(sealed, plain);
            assert_eq!(ctx.decrypt(&sealed).unwrap(), plain);
        }
    }

    #[test]
    fn same_salt_and_iv_derive_the_same_key() {
        let ours = AesContext::generate("password");
        let theirs = AesContext::from_parts("password", *ours.salt(), *ours.iv());

        let plain = b"challenge bytes";
        let sealed = ours.encrypt(plain).unwrap();
        assert_eq!(theirs.decrypt(&sealed).unwrap(), plain);
    }

    #[test]
    fn wrong_password_cannot_decrypt() {
        let ours = AesContext::generate("password");
        let theirs = AesContext::from_parts("Password", *ours.salt(), *ours.iv());

        let sealed = ours.encrypt(&random_bytes(32)).unwrap();
        // Either the padding check fails or the plaintext differs.
        if let Ok(plain) = theirs.decrypt(&sealed) {
            assert_ne!(ours.decrypt(&sealed).unwrap(), plain);
        }
    }

    #[test]
    fn fresh_contexts_use_fresh_material() {
        let a = AesContext::generate("password");
        let b = AesContext::generate("password");
        assert_ne!(a.salt(), b.salt());
        assert_ne!(a.iv(), b.iv());
    }

    #[test]
    fn sha512_is_stable() {
        let digest = sha512(b"abc");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, sha512(b"abc"));
        assert_ne!(digest, sha512(b"abd"));
    }

    #[test]
    fn random_bytes_differ() {
        assert_ne!(random_bytes(32), random_bytes(32));
        assert_ne!(random_array::<16>(), random_array::<16>());
    }
}
