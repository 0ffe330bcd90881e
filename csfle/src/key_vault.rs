//! Key vault provisioning.
//!
//! The key vault is a collection of data-encryption keys, each wrapped under
//! the master key and tagged with human-readable aliases (`keyAltNames`). A
//! unique partial index on `keyAltNames` guarantees at most one key per alias
//! while still admitting entries that carry no alias at all.
//!
//! [`KeyVaultManager::find_or_create_data_key`] is a check-then-act sequence.
//! Two processes racing on first run may both miss the lookup; the index makes
//! the second insert fail with [`Error::Conflict`], which the manager resolves
//! according to its [`ConflictPolicy`].

use crate::client::with_timeout;
use crate::config::Namespace;
use crate::data_key::DataKeyId;
use crate::error::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Field holding the aliases of a key vault entry.
pub const KEY_ALT_NAMES_FIELD: &str = "keyAltNames";

/// A wrapped data-encryption key as stored in the key vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyVaultEntry {
    /// Entry identifier, referenced by encryption schemas
    pub id: DataKeyId,
    /// Aliases of the key
    pub key_alt_names: Vec<String>,
    /// Data key material wrapped under the master key
    pub key_material: Vec<u8>,
    /// KMS provider that wrapped the key
    pub provider: String,
}

/// Storage operations a backend must offer for key provisioning.
///
/// Implemented by the in-process backend and by the MongoDB driver backend.
#[async_trait]
pub trait KeyVaultStore: Send + Sync {
    /// Idempotently creates a unique index on `keyAltNames`, restricted to
    /// documents where the field exists.
    async fn ensure_unique_alias_index(&self, namespace: &Namespace) -> Result<(), Error>;

    /// Finds the entry whose aliases contain `alias`.
    async fn find_by_alias(
        &self,
        namespace: &Namespace,
        alias: &str,
    ) -> Result<Option<KeyVaultEntry>, Error>;

    /// Generates a data key wrapped under the master key, tags it with `alias`
    /// and persists it.
    ///
    /// # Errors
    ///
    /// Must return `Error::Conflict` when another entry already owns `alias`.
    async fn create_data_key(&self, namespace: &Namespace, alias: &str) -> Result<DataKeyId, Error>;
}

/// Recovery policy when creating a data key loses a race on its alias.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Treat the conflict as "someone else created it" and re-fetch the entry.
    #[default]
    Refetch,
    /// Surface the conflict to the caller.
    Fail,
}

/// Finds or creates the data key for an alias.
///
/// # Example
///
/// ```rust,ignore
/// use csfle::key_vault::KeyVaultManager;
/// use csfle::memory::MemoryBackend;
///
/// let backend = MemoryBackend::new();
/// let manager = KeyVaultManager::new(backend.key_vault(master_key), namespace);
/// let id = manager.find_or_create_data_key("demo-data-key").await?;
/// println!("{id}");
/// ```
pub struct KeyVaultManager<S: KeyVaultStore> {
    store: S,
    namespace: Namespace,
    conflict_policy: ConflictPolicy,
    timeout: Duration,
}

impl<S: KeyVaultStore> KeyVaultManager<S> {
    /// Creates a manager for the key vault at `namespace`.
    pub fn new(store: S, namespace: Namespace) -> Self {
        Self {
            store,
            namespace,
            conflict_policy: ConflictPolicy::default(),
            timeout: Duration::from_millis(crate::config::DEFAULT_OPERATION_TIMEOUT_MS),
        }
    }

    /// Sets the conflict recovery policy.
    #[must_use]
    pub const fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the upper bound for each store operation.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the key vault namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Returns the underlying store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Ensures the unique alias index exists.
    ///
    /// # Errors
    ///
    /// Any failure is reported as the fatal `Error::IndexCreation`: without the
    /// index, duplicate aliases could break every schema that names them.
    pub async fn ensure_unique_alias_index(&self) -> Result<(), Error> {
        self.bounded(self.store.ensure_unique_alias_index(&self.namespace)).await.map_err(|e| {
            warn!(namespace = %self.namespace, error = %e, "unique alias index creation failed");
            match e {
                Error::IndexCreation(_) => e,
                other => Error::IndexCreation(other.to_string()),
            }
        })
    }

    /// Looks up the data key registered under `alias`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for an empty alias, and store errors as-is.
    pub async fn find_data_key(&self, alias: &str) -> Result<Option<DataKeyId>, Error> {
        validate_alias(alias)?;
        let entry = self.bounded(self.store.find_by_alias(&self.namespace, alias)).await?;
        Ok(entry.map(|entry| entry.id))
    }

    /// Returns the data key registered under `alias`, creating it on first use.
    ///
    /// Calling this repeatedly with the same alias always yields the same id.
    ///
    /// # Errors
    ///
    /// Returns `Error::IndexCreation` if the unique index cannot be ensured,
    /// `Error::Conflict` if a concurrent creation won the race and the policy is
    /// [`ConflictPolicy::Fail`], and store errors otherwise.
    pub async fn find_or_create_data_key(&self, alias: &str) -> Result<DataKeyId, Error> {
        validate_alias(alias)?;
        self.ensure_unique_alias_index().await?;

        if let Some(id) = self.find_data_key(alias).await? {
            debug!(alias, key_id = %id, "found existing data key");
            return Ok(id);
        }

        match self.bounded(self.store.create_data_key(&self.namespace, alias)).await {
            Ok(id) => {
                info!(alias, key_id = %id, namespace = %self.namespace, "created data key");
                Ok(id)
            }
            Err(Error::Conflict(reason)) if self.conflict_policy == ConflictPolicy::Refetch => {
                warn!(alias, %reason, "data key created concurrently, re-fetching");
                self.find_data_key(alias).await?.ok_or_else(|| {
                    Error::Conflict(format!(
                        "alias `{alias}` conflicted on insert but no entry was found afterwards"
                    ))
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn bounded<T>(&self, op: impl Future<Output = Result<T, Error>>) -> Result<T, Error> {
        with_timeout(self.timeout, op).await
    }
}

fn validate_alias(alias: &str) -> Result<(), Error> {
    if alias.trim().is_empty() {
        return Err(Error::InvalidArgument("key alias must not be empty".to_string()));
    }
    Ok(())
}
