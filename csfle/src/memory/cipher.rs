//! Field ciphers and data key wrapping for the in-process backend.
//!
//! Data keys are 96 bytes, the same size libmongocrypt uses. The first 64
//! bytes key AES-256-SIV for the deterministic algorithm; the last 32 key
//! ChaCha20-Poly1305 for the randomized one. Data keys are wrapped under a
//! key derived from the master key with HKDF-SHA256.
//!
//! Field ciphertext format:
//!
//! ```text
//! [algorithm:1][key_id:16][bson_type:1][payload]
//! ```
//!
//! The 18-byte header is authenticated as associated data. The randomized
//! payload is `[nonce:12][ciphertext+tag]`; the deterministic payload is the
//! AES-SIV output.

use crate::data_key::{DataKeyId, DATA_KEY_ID_SIZE};
use crate::error::Error;
use crate::master_key::MasterKey;
use crate::schema::Algorithm;
use aes_siv::Aes256SivAead;
use chacha20poly1305::aead::rand_core::RngCore;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Size of a data-encryption key in bytes.
pub const DATA_KEY_SIZE: usize = 96;

const SIV_KEY_SIZE: usize = 64;
const NONCE_SIZE: usize = 12;
const HEADER_SIZE: usize = 1 + DATA_KEY_ID_SIZE + 1;

/// HKDF info for the key-wrapping key.
const WRAP_INFO: &[u8] = b"csfle-local-kek";
/// AAD used for key wrapping, distinct from field encryption AAD.
const WRAP_AAD: &[u8] = b"dek-wrap";

const DETERMINISTIC_TAG: u8 = 1;
const RANDOMIZED_TAG: u8 = 2;

/// An unwrapped data-encryption key.
pub struct DataKey {
    bytes: SecretVec<u8>,
}

impl DataKey {
    /// Generates a random data key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; DATA_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self {
            bytes: SecretVec::new(bytes),
        }
    }

    fn from_bytes(bytes: Vec<u8>) -> Result<Self, Error> {
        if bytes.len() != DATA_KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: DATA_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            bytes: SecretVec::new(bytes),
        })
    }

    fn siv_key(&self) -> &[u8] {
        &self.bytes.expose_secret()[..SIV_KEY_SIZE]
    }

    fn aead_key(&self) -> &[u8] {
        &self.bytes.expose_secret()[SIV_KEY_SIZE..]
    }
}

fn wrapping_key(master_key: &MasterKey) -> Result<Zeroizing<[u8; 32]>, Error> {
    let hkdf = Hkdf::<Sha256>::new(None, master_key.expose());
    let mut kek = Zeroizing::new([0u8; 32]);
    hkdf.expand(WRAP_INFO, &mut kek[..])
        .map_err(|e| Error::Encryption(format!("key derivation failed: {e}")))?;
    Ok(kek)
}

/// Wraps a data key under the master key.
///
/// Returns `[nonce:12][ciphertext+tag]`.
///
/// # Errors
///
/// Returns `Error::Encryption` if the AEAD operation fails.
pub fn wrap_data_key(master_key: &MasterKey, data_key: &DataKey) -> Result<Vec<u8>, Error> {
    let kek = wrapping_key(master_key)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&kek[..])
        .map_err(|e| Error::Encryption(format!("invalid wrapping key: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let payload = Payload {
        msg: data_key.bytes.expose_secret(),
        aad: WRAP_AAD,
    };
    let wrapped = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), payload)
        .map_err(|e| Error::Encryption(format!("data key wrap failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + wrapped.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&wrapped);
    Ok(out)
}

/// Unwraps a data key produced by [`wrap_data_key`].
///
/// # Errors
///
/// Returns `Error::Decryption` if the blob is truncated or was wrapped under a
/// different master key.
pub fn unwrap_data_key(master_key: &MasterKey, wrapped: &[u8]) -> Result<DataKey, Error> {
    if wrapped.len() <= NONCE_SIZE {
        return Err(Error::Decryption("wrapped data key is truncated".to_string()));
    }
    let kek = wrapping_key(master_key)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&kek[..])
        .map_err(|e| Error::Decryption(format!("invalid wrapping key: {e}")))?;

    let (nonce, body) = wrapped.split_at(NONCE_SIZE);
    let payload = Payload {
        msg: body,
        aad: WRAP_AAD,
    };
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), payload)
        .map_err(|_| {
            Error::Decryption(
                "data key unwrap failed: wrong master key or corrupted key material".to_string(),
            )
        })?;
    DataKey::from_bytes(plaintext)
}

/// A parsed field ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldCiphertext {
    algorithm: Algorithm,
    key_id: DataKeyId,
    bson_type: u8,
    payload: Vec<u8>,
}

impl FieldCiphertext {
    /// Returns the algorithm the value was encrypted with.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Returns the data key that encrypted the value.
    #[must_use]
    pub const fn key_id(&self) -> &DataKeyId {
        &self.key_id
    }

    /// Returns the BSON element type of the plaintext.
    #[must_use]
    pub const fn bson_type(&self) -> u8 {
        self.bson_type
    }

    fn header(&self) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = match self.algorithm {
            Algorithm::Deterministic => DETERMINISTIC_TAG,
            Algorithm::Randomized => RANDOMIZED_TAG,
        };
        header[1..=DATA_KEY_ID_SIZE].copy_from_slice(self.key_id.as_bytes());
        header[HEADER_SIZE - 1] = self.bson_type;
        header
    }

    /// Serializes the ciphertext.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.header());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parses a serialized ciphertext.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decryption` for truncated input or an unknown algorithm tag.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() <= HEADER_SIZE {
            return Err(Error::Decryption(format!(
                "ciphertext too short: {} bytes",
                bytes.len()
            )));
        }
        let algorithm = match bytes[0] {
            DETERMINISTIC_TAG => Algorithm::Deterministic,
            RANDOMIZED_TAG => Algorithm::Randomized,
            other => {
                return Err(Error::Decryption(format!("unknown algorithm tag: {other:#04x}")))
            }
        };
        let key_id = DataKeyId::from_slice(&bytes[1..=DATA_KEY_ID_SIZE])
            .map_err(|e| Error::Decryption(e.to_string()))?;
        Ok(Self {
            algorithm,
            key_id,
            bson_type: bytes[HEADER_SIZE - 1],
            payload: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Encrypts a serialized field value.
///
/// # Errors
///
/// Returns `Error::Encryption` if the cipher rejects the key or input.
pub fn encrypt_value(
    data_key: &DataKey,
    key_id: DataKeyId,
    algorithm: Algorithm,
    bson_type: u8,
    plaintext: &[u8],
) -> Result<FieldCiphertext, Error> {
    let mut ciphertext = FieldCiphertext {
        algorithm,
        key_id,
        bson_type,
        payload: Vec::new(),
    };
    let aad = ciphertext.header();
    let payload = Payload {
        msg: plaintext,
        aad: &aad,
    };

    ciphertext.payload = match algorithm {
        Algorithm::Deterministic => {
            let cipher = Aes256SivAead::new_from_slice(data_key.siv_key())
                .map_err(|e| Error::Encryption(format!("Failed to create AES-SIV cipher: {e}")))?;
            // AES-SIV is deterministic - uses empty nonce
            cipher
                .encrypt(&Default::default(), payload)
                .map_err(|e| Error::Encryption(format!("AES-SIV encryption failed: {e}")))?
        }
        Algorithm::Randomized => {
            let cipher = ChaCha20Poly1305::new_from_slice(data_key.aead_key())
                .map_err(|e| Error::Encryption(format!("Invalid data key: {e}")))?;
            let mut nonce_bytes = [0u8; NONCE_SIZE];
            OsRng.fill_bytes(&mut nonce_bytes);
            let sealed = cipher
                .encrypt(Nonce::from_slice(&nonce_bytes), payload)
                .map_err(|e| {
                    Error::Encryption(format!("ChaCha20-Poly1305 encryption failed: {e}"))
                })?;
            let mut payload = Vec::with_capacity(NONCE_SIZE + sealed.len());
            payload.extend_from_slice(&nonce_bytes);
            payload.extend_from_slice(&sealed);
            payload
        }
    };
    Ok(ciphertext)
}

/// Decrypts a field ciphertext with its data key.
///
/// # Errors
///
/// Returns `Error::Decryption` if authentication fails.
pub fn decrypt_value(data_key: &DataKey, ciphertext: &FieldCiphertext) -> Result<Vec<u8>, Error> {
    let aad = ciphertext.header();
    match ciphertext.algorithm {
        Algorithm::Deterministic => {
            let cipher = Aes256SivAead::new_from_slice(data_key.siv_key())
                .map_err(|e| Error::Decryption(format!("Failed to create AES-SIV cipher: {e}")))?;
            let payload = Payload {
                msg: &ciphertext.payload,
                aad: &aad,
            };
            cipher
                .decrypt(&Default::default(), payload)
                .map_err(|e| Error::Decryption(format!("AES-SIV decryption failed: {e}")))
        }
        Algorithm::Randomized => {
            if ciphertext.payload.len() <= NONCE_SIZE {
                return Err(Error::Decryption("randomized payload is truncated".to_string()));
            }
            let cipher = ChaCha20Poly1305::new_from_slice(data_key.aead_key())
                .map_err(|e| Error::Decryption(format!("Invalid data key: {e}")))?;
            let (nonce, body) = ciphertext.payload.split_at(NONCE_SIZE);
            let payload = Payload {
                msg: body,
                aad: &aad,
            };
            cipher
                .decrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| {
                    Error::Decryption(
                        "authentication failed: ciphertext may be corrupted or tampered"
                            .to_string(),
                    )
                })
        }
    }
}
