//! Secrets at rest.
//!
//! - [`cipher`]: password-keyed encryption for durable credentials.
//! - [`sealed`]: per-process key for volatile values such as session tokens.

pub mod cipher;
pub mod sealed;

pub use cipher::{
    decrypt, encrypt, generate_master_password, CipherError, EncryptedBlob, MASTER_PASSWORD_LEN,
};
pub use sealed::EphemeralKey;
