//! Password-keyed encryption of secrets at rest.
//!
//! Every call derives a fresh key with PBKDF2-HMAC-SHA256 over a random salt
//! and seals with ChaCha20-Poly1305 under a random nonce. Salt and nonce travel
//! inside the [`EncryptedBlob`], so decryption needs only the key material.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, Rng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;
pub const KEY_LEN: usize = 32;
pub const MASTER_PASSWORD_LEN: usize = 32;

const MASTER_PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_.~!@#%^*";

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed: wrong key or corrupted data")]
    Decrypt,
    #[error("malformed encrypted blob: {0}")]
    InvalidBlob(&'static str),
}

/// Self-describing ciphertext: `{ciphertext, salt, iv}`, base64 on disk.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
}

impl std::fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedBlob")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("salt_len", &self.salt.len())
            .field("iv_len", &self.iv.len())
            .finish()
    }
}

mod b64 {
    use base64ct::{Base64, Encoding};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&Base64::encode_string(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Base64::decode_vec(&s).map_err(serde::de::Error::custom)
    }
}

fn derive_key(key_material: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(key_material.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypt `plaintext` under a key derived from `key_material`.
///
/// # Errors
/// Returns an error if the cipher cannot be initialized or sealing fails.
#[allow(deprecated)]
pub fn encrypt(plaintext: &str, key_material: &SecretString) -> Result<EncryptedBlob, CipherError> {
    let mut salt = vec![0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let mut iv = vec![0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let key = derive_key(key_material.expose_secret(), &salt);
    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CipherError::KeyDerivation)?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
        .map_err(|_| CipherError::Encrypt)?;

    Ok(EncryptedBlob {
        ciphertext,
        salt,
        iv,
    })
}

/// Decrypt a blob produced by [`encrypt`].
///
/// # Errors
/// Returns [`CipherError::Decrypt`] on a wrong key or any tampering, and
/// [`CipherError::InvalidBlob`] when salt or IV have the wrong shape.
#[allow(deprecated)]
pub fn decrypt(blob: &EncryptedBlob, key_material: &SecretString) -> Result<SecretString, CipherError> {
    if blob.salt.len() != SALT_LEN {
        return Err(CipherError::InvalidBlob("salt length"));
    }
    if blob.iv.len() != IV_LEN {
        return Err(CipherError::InvalidBlob("iv length"));
    }

    let key = derive_key(key_material.expose_secret(), &blob.salt);
    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CipherError::KeyDerivation)?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&blob.iv), blob.ciphertext.as_slice())
        .map_err(|_| CipherError::Decrypt)?;

    String::from_utf8(plaintext)
        .map(SecretString::from)
        .map_err(|_| CipherError::InvalidBlob("plaintext is not utf-8"))
}

/// Random string drawn from a fixed URL- and shell-safe alphabet.
#[must_use]
pub fn generate_master_password(length: usize) -> SecretString {
    let password: String = (0..length)
        .map(|_| {
            let idx = OsRng.gen_range(0..MASTER_PASSWORD_ALPHABET.len());
            char::from(MASTER_PASSWORD_ALPHABET[idx])
        })
        .collect();

    SecretString::from(password)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let k = key("master-key");
        for plaintext in ["", "p", "correct horse battery staple", "pässwörd ✓"] {
            let blob = encrypt(plaintext, &k).unwrap();
            let decrypted = decrypt(&blob, &k).unwrap();
            assert_eq!(decrypted.expose_secret(), plaintext);
        }
    }

    #[test]
    fn test_encrypt_is_not_deterministic() {
        let k = key("master-key");
        let first = encrypt("same", &k).unwrap();
        let second = encrypt("same", &k).unwrap();

        assert_ne!(first.ciphertext, second.ciphertext);
        assert_ne!(first.salt, second.salt);
        assert_ne!(first.iv, second.iv);
    }

    #[test]
    fn test_decrypt_fails_wrong_key() {
        let blob = encrypt("secret", &key("right")).unwrap();
        assert!(matches!(
            decrypt(&blob, &key("wrong")),
            Err(CipherError::Decrypt)
        ));
    }

    #[test]
    fn test_decrypt_fails_tampered_bytes() {
        let k = key("master-key");
        let blob = encrypt("secret", &k).unwrap();

        for i in 0..blob.ciphertext.len() {
            let mut tampered = blob.clone();
            if let Some(byte) = tampered.ciphertext.get_mut(i) {
                *byte ^= 0x01;
            }
            assert!(decrypt(&tampered, &k).is_err(), "byte {i} not detected");
        }

        let mut tampered = blob.clone();
        tampered.iv[0] ^= 0xFF;
        assert!(decrypt(&tampered, &k).is_err());

        let mut tampered = blob;
        tampered.salt[0] ^= 0xFF;
        assert!(decrypt(&tampered, &k).is_err());
    }

    #[test]
    fn test_decrypt_rejects_malformed_blob() {
        let k = key("master-key");
        let mut blob = encrypt("secret", &k).unwrap();
        blob.iv.truncate(4);
        assert!(matches!(
            decrypt(&blob, &k),
            Err(CipherError::InvalidBlob(_))
        ));
    }

    #[test]
    fn test_blob_serde_uses_base64() {
        let blob = encrypt("secret", &key("k")).unwrap();
        let json = serde_json::to_value(&blob).unwrap();
        assert!(json["salt"].is_string());
        assert!(json["iv"].is_string());

        let back: EncryptedBlob = serde_json::from_value(json).unwrap();
        assert_eq!(back, blob);
    }

    #[test]
    fn test_generate_master_password() {
        let a = generate_master_password(MASTER_PASSWORD_LEN);
        let b = generate_master_password(MASTER_PASSWORD_LEN);

        assert_eq!(a.expose_secret().len(), MASTER_PASSWORD_LEN);
        assert_ne!(a.expose_secret(), b.expose_secret());
        assert!(a
            .expose_secret()
            .bytes()
            .all(|c| MASTER_PASSWORD_ALPHABET.contains(&c)));
        assert_eq!(generate_master_password(8).expose_secret().len(), 8);
    }
}
