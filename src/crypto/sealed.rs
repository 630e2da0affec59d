use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretBox};

use super::cipher::{CipherError, IV_LEN, KEY_LEN};

/// Random key that lives exactly as long as the process.
///
/// Used for values that must not outlive a restart (session tokens). There is
/// no key derivation step: the key is uniformly random and never leaves memory.
pub struct EphemeralKey {
    key: SecretBox<[u8; KEY_LEN]>,
}

impl EphemeralKey {
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self {
            key: SecretBox::new(Box::new(key)),
        }
    }

    /// Seals `plaintext` bound to `context` (AAD).
    /// Returns `nonce (12 bytes) || ciphertext`.
    ///
    /// # Errors
    /// Returns an error if encryption fails.
    #[allow(deprecated)]
    pub fn seal(&self, plaintext: &[u8], context: &str) -> Result<Vec<u8>, CipherError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.expose_secret()));

        let mut nonce_bytes = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let payload = Payload {
            msg: plaintext,
            aad: context.as_bytes(),
        };

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), payload)
            .map_err(|_| CipherError::Encrypt)?;

        let mut result = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// Opens data produced by [`EphemeralKey::seal`] with the same `context`.
    ///
    /// # Errors
    /// Returns an error if the data is truncated, tampered with, or bound to another context.
    #[allow(deprecated)]
    pub fn open(&self, data: &[u8], context: &str) -> Result<Vec<u8>, CipherError> {
        if data.len() < IV_LEN {
            return Err(CipherError::InvalidBlob("sealed data too short"));
        }

        let (nonce_bytes, ciphertext) = data.split_at(IV_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.expose_secret()));

        let payload = Payload {
            msg: ciphertext,
            aad: context.as_bytes(),
        };

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), payload)
            .map_err(|_| CipherError::Decrypt)
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EphemeralKey(***)")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = EphemeralKey::generate();
        let sealed = key.seal(b"sid=abc", "instance-1").unwrap();
        assert_eq!(key.open(&sealed, "instance-1").unwrap(), b"sid=abc");
    }

    #[test]
    fn test_open_fails_other_context() {
        let key = EphemeralKey::generate();
        let sealed = key.seal(b"sid=abc", "instance-1").unwrap();
        assert!(key.open(&sealed, "instance-2").is_err());
    }

    #[test]
    fn test_open_fails_other_process_key() {
        let sealed = EphemeralKey::generate().seal(b"sid", "i").unwrap();
        assert!(EphemeralKey::generate().open(&sealed, "i").is_err());
    }

    #[test]
    fn test_open_fails_truncated() {
        let key = EphemeralKey::generate();
        assert!(matches!(
            key.open(&[0u8; 4], "i"),
            Err(CipherError::InvalidBlob(_))
        ));
    }
}
