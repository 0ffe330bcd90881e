//! Master key abstraction for wrapping data-encryption keys.

use crate::error::Error;
use secrecy::{ExposeSecret, SecretVec};
use std::fmt;

/// Size of a local master key in bytes.
pub const MASTER_KEY_SIZE: usize = 96;

/// KMS provider name for locally managed master keys.
pub const LOCAL_PROVIDER: &str = "local";

/// The top-level secret used to wrap and unwrap data-encryption keys.
///
/// The bytes live in a [`SecretVec`] and are zeroized on drop. `Debug` never
/// prints key material.
pub struct MasterKey {
    bytes: SecretVec<u8>,
}

impl MasterKey {
    /// Wraps raw key material.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyLength` unless exactly [`MASTER_KEY_SIZE`] bytes are given.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, Error> {
        if bytes.len() != MASTER_KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: MASTER_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            bytes: SecretVec::new(bytes),
        })
    }

    /// Exposes the raw key bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.bytes.expose_secret()
    }
}

impl Clone for MasterKey {
    fn clone(&self) -> Self {
        Self {
            bytes: SecretVec::new(self.bytes.expose_secret().clone()),
        }
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("len", &MASTER_KEY_SIZE)
            .finish_non_exhaustive()
    }
}

/// Supplies the master key used by the key vault and the encryption-aware client.
///
/// Implementations must be thread-safe (`Send + Sync`).
///
/// # Example
///
/// ```rust,ignore
/// use csfle::master_key::MasterKeyProvider;
/// use csfle_key_file::LocalKeyFile;
///
/// let provider = LocalKeyFile::new("master-key.txt");
/// let key = provider.master_key()?;
/// ```
pub trait MasterKeyProvider: Send + Sync {
    /// Loads the master key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the key source is unavailable and
    /// `Error::InvalidKeyLength` if it holds malformed material.
    fn master_key(&self) -> Result<MasterKey, Error>;

    /// Returns the KMS provider name recorded in key vault entries.
    fn provider_name(&self) -> &'static str {
        LOCAL_PROVIDER
    }
}
