//! Client factory and client handle abstractions.
//!
//! Two kinds of handles exist: plain handles that send documents as-is, and
//! encryption-aware handles that encrypt fields named by an
//! [`EncryptionSchema`] before they leave the process and decrypt them after
//! retrieval. Both are produced by a [`ClientFactory`] and connect eagerly.

use crate::config::{MongocryptdConfig, Namespace};
use crate::error::Error;
use crate::master_key::MasterKey;
use crate::schema::EncryptionSchema;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;

/// A document as exchanged with client handles.
pub type Document = Map<String, Value>;

/// Result of an upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Number of documents matched by the filter
    pub matched: u64,
    /// Number of documents changed
    pub modified: u64,
    /// Whether a new document was inserted
    pub upserted: bool,
}

/// Settings for an encryption-aware client.
#[derive(Debug, Clone)]
pub struct AutoEncryptionOptions {
    /// Where the client finds wrapped data keys
    pub key_vault_namespace: Namespace,
    /// Local KMS provider material
    pub master_key: MasterKey,
    /// Fields to encrypt; required
    pub schema: Option<EncryptionSchema>,
    /// Skip automatic encryption on writes, still decrypt on reads
    pub bypass_auto_encryption: bool,
    /// `mongocryptd` spawn settings
    pub mongocryptd: MongocryptdConfig,
}

impl AutoEncryptionOptions {
    /// Creates options with the given schema and default flags.
    #[must_use]
    pub fn new(
        key_vault_namespace: Namespace,
        master_key: MasterKey,
        schema: EncryptionSchema,
    ) -> Self {
        Self {
            key_vault_namespace,
            master_key,
            schema: Some(schema),
            bypass_auto_encryption: false,
            mongocryptd: MongocryptdConfig::default(),
        }
    }

    /// Returns the schema.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if no schema was supplied.
    pub fn require_schema(&self) -> Result<&EncryptionSchema, Error> {
        self.schema.as_ref().ok_or_else(|| {
            Error::InvalidArgument(
                "an encryption schema is required; build one with schema::build_schema".to_string(),
            )
        })
    }
}

/// A connection to the backing store.
///
/// Operations issued sequentially on one handle complete in issuance order.
/// After [`ClientHandle::close`], every operation fails with
/// `Error::ConnectionClosed`.
#[async_trait]
pub trait ClientHandle: Send + Sync {
    /// Whether this handle encrypts and decrypts fields.
    fn is_encryption_aware(&self) -> bool;

    /// Inserts one document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` if a unique index rejects the document.
    async fn insert_one(&self, namespace: &Namespace, document: Document) -> Result<(), Error>;

    /// Sets the fields of `update` on the document matching `filter`, inserting
    /// one built from `filter` and `update` if none matches.
    async fn upsert_one(
        &self,
        namespace: &Namespace,
        filter: Document,
        update: Document,
    ) -> Result<UpsertOutcome, Error>;

    /// Returns the first document whose fields equal those of `filter`.
    ///
    /// # Errors
    ///
    /// On encryption-aware handles, returns `Error::UnsupportedQuery` when the
    /// filter names a field encrypted with the randomized algorithm.
    async fn find_one(&self, namespace: &Namespace, filter: Document)
        -> Result<Option<Document>, Error>;

    /// Counts documents matching `filter`.
    async fn count_documents(&self, namespace: &Namespace, filter: Document) -> Result<u64, Error>;

    /// Releases the connection.
    async fn close(&self) -> Result<(), Error>;
}

/// Produces client handles.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Handle type produced by this factory.
    type Client: ClientHandle;

    /// Opens an encryption-unaware connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the connection string is malformed or the
    /// endpoint is unreachable.
    async fn new_plain_client(&self, connection_string: &str) -> Result<Self::Client, Error>;

    /// Opens an encryption-aware connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if `options.schema` is absent (checked
    /// before connecting) and `Error::Connection` if the endpoint is unreachable.
    async fn new_encryption_aware_client(
        &self,
        connection_string: &str,
        options: AutoEncryptionOptions,
    ) -> Result<Self::Client, Error>;
}

/// Runs a store operation, failing with `Error::Timeout` once `timeout` elapses.
///
/// # Errors
///
/// Returns the operation's own error, or `Error::Timeout`.
pub async fn with_timeout<T>(
    timeout: Duration,
    op: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::time::timeout(timeout, op).await.map_err(|_| Error::Timeout(timeout))?
}

/// Reads the value at a dotted path.
#[must_use]
pub fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Sets the value at a dotted path, creating intermediate documents as needed.
///
/// # Errors
///
/// Returns `Error::InvalidArgument` if an intermediate value exists and is not
/// a document.
pub fn set_path(document: &mut Document, path: &str, value: Value) -> Result<(), Error> {
    let (parents, leaf) = match path.rsplit_once('.') {
        Some((parents, leaf)) => (Some(parents), leaf),
        None => (None, path),
    };
    let mut current = document;
    for segment in parents.into_iter().flat_map(|p| p.split('.')) {
        current = current
            .entry(segment)
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "cannot set `{path}`: `{segment}` is not a document"
                ))
            })?;
    }
    current.insert(leaf.to_string(), value);
    Ok(())
}

/// Whether every field of `filter` equals the corresponding field of `document`.
///
/// An empty filter matches every document.
#[must_use]
pub fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(path, expected)| get_path(document, path) == Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patient() -> Document {
        json!({
            "name": "Jon Doe",
            "insurance": { "provider": "MaestCare", "policyNumber": 123142 }
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_get_path() {
        let doc = patient();
        assert_eq!(get_path(&doc, "name"), Some(&json!("Jon Doe")));
        assert_eq!(get_path(&doc, "insurance.policyNumber"), Some(&json!(123142)));
        assert_eq!(get_path(&doc, "insurance.missing"), None);
        assert_eq!(get_path(&doc, "name.first"), None);
    }

    #[test]
    fn test_set_path() {
        let mut doc = patient();
        set_path(&mut doc, "insurance.provider", json!("Other")).unwrap();
        set_path(&mut doc, "address.city", json!("Ankara")).unwrap();
        set_path(&mut doc, "age", json!(41)).unwrap();

        assert_eq!(doc["insurance"]["provider"], "Other");
        assert_eq!(doc["insurance"]["policyNumber"], 123_142);
        assert_eq!(doc["address"], json!({ "city": "Ankara" }));
        assert_eq!(doc["age"], 41);
        assert!(!doc.contains_key("insurance.provider"));
    }

    #[test]
    fn test_set_path_through_scalar_rejected() {
        let mut doc = patient();
        let result = set_path(&mut doc, "name.first", json!("Jon"));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(doc["name"], "Jon Doe");
    }

    #[test]
    fn test_matches_filter() {
        let doc = patient();
        let hit = json!({ "name": "Jon Doe", "insurance.policyNumber": 123142 });
        let miss = json!({ "name": "Jane Doe" });
        assert!(matches_filter(&doc, hit.as_object().unwrap()));
        assert!(!matches_filter(&doc, miss.as_object().unwrap()));
        assert!(matches_filter(&doc, &Document::new()));
    }
}
