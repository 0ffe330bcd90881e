//! Local master key file provider for `csfle`.
//!
//! The master key is stored as exactly 96 raw bytes in a single file. This
//! is the "local" KMS provider: suitable for development and demos, not for
//! production key custody.

#![warn(clippy::pedantic, clippy::nursery)]

use csfle::error::Error;
use csfle::master_key::{MasterKey, MasterKeyProvider, MASTER_KEY_SIZE};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Reads the master key from `path`.
///
/// # Errors
///
/// Returns `Error::Io` if the file is absent or unreadable, and
/// `Error::InvalidKeyLength` if it does not hold exactly 96 bytes.
pub fn read_master_key(path: impl AsRef<Path>) -> Result<MasterKey, Error> {
    let path = path.as_ref();
    let bytes = Zeroizing::new(fs::read(path)?);
    debug!(path = %path.display(), "read master key file");
    MasterKey::from_bytes(bytes.to_vec())
}

/// Generates a fresh master key and writes it to `path`.
///
/// Refuses to replace an existing file: doing so would orphan every data key
/// wrapped under the previous master key.
///
/// # Errors
///
/// Returns `Error::Io` if the file exists or cannot be written.
pub fn generate_master_key(path: impl AsRef<Path>) -> Result<MasterKey, Error> {
    generate_master_key_with(path, false)
}

/// Generates a fresh master key and writes it to `path`, replacing an
/// existing file when `overwrite` is set.
///
/// On Unix the file ends up with mode `0600`, including when an existing file
/// with wider permissions is replaced.
///
/// # Errors
///
/// Returns `Error::Io` on write failure, or if the file exists and
/// `overwrite` is unset.
pub fn generate_master_key_with(
    path: impl AsRef<Path>,
    overwrite: bool,
) -> Result<MasterKey, Error> {
    let path = path.as_ref();
    let mut bytes = Zeroizing::new(vec![0u8; MASTER_KEY_SIZE]);
    OsRng.fill_bytes(&mut bytes);

    let mut options = OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    if overwrite && path.exists() {
        warn!(path = %path.display(), "overwriting existing master key file");
    }
    let mut file = options.open(path)?;
    // `mode` only applies when the file is created.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(&bytes)?;
    file.sync_all()?;
    info!(path = %path.display(), "wrote new master key");

    MasterKey::from_bytes(bytes.to_vec())
}

/// Master key provider backed by a local key file.
///
/// The file is read on every call so that a key generated after the provider
/// was constructed is picked up.
#[derive(Debug, Clone)]
pub struct LocalKeyFile {
    path: PathBuf,
}

impl LocalKeyFile {
    /// Creates a provider for the key file at `path`. The file is not touched.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the key file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MasterKeyProvider for LocalKeyFile {
    fn master_key(&self) -> Result<MasterKey, Error> {
        read_master_key(&self.path)
    }
}
