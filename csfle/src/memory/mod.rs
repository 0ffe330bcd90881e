//! In-process backend.
//!
//! [`MemoryBackend`] keeps collections in memory and stands in for both the
//! document database and the encryption library: it enforces unique (partial)
//! indexes, stores key vault entries in the same shape MongoDB does, and gives
//! encryption-aware handles the same observable behavior as automatic
//! encryption. It backs the offline demo and the test suite.
//!
//! Encrypted values are stored as extended JSON binary, subtype 6:
//! `{"$binary": {"base64": "...", "subType": "06"}}`.

pub mod cipher;

use crate::client::{
    get_path, matches_filter, set_path, AutoEncryptionOptions, ClientFactory, ClientHandle,
    Document, UpsertOutcome,
};
use crate::config::{validate_connection_string, Namespace};
use crate::data_key::DataKeyId;
use crate::error::Error;
use crate::key_vault::{KeyVaultEntry, KeyVaultStore, KEY_ALT_NAMES_FIELD};
use crate::master_key::{MasterKey, LOCAL_PROVIDER};
use crate::schema::{join_path, EncryptionSchema, FieldDirective, FieldLookup};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cipher::{DataKey, FieldCiphertext};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// BSON binary subtype for encrypted values.
pub const ENCRYPTED_SUBTYPE: &str = "06";
const GENERIC_SUBTYPE: &str = "00";

#[derive(Debug, Clone, PartialEq, Eq)]
struct UniqueIndex {
    field: String,
    partial: bool,
}

#[derive(Default)]
struct State {
    collections: HashMap<Namespace, Vec<Document>>,
    indexes: HashMap<Namespace, Vec<UniqueIndex>>,
}

impl State {
    fn index_keys(document: &Document, index: &UniqueIndex) -> Option<Vec<Value>> {
        match get_path(document, &index.field) {
            Some(Value::Array(items)) => Some(items.clone()),
            Some(value) => Some(vec![value.clone()]),
            None if index.partial => None,
            None => Some(vec![Value::Null]),
        }
    }

    /// Checks `document` against every unique index, ignoring the document at `skip`.
    fn check_unique(
        &self,
        namespace: &Namespace,
        document: &Document,
        skip: Option<usize>,
    ) -> Result<(), Error> {
        let Some(indexes) = self.indexes.get(namespace) else {
            return Ok(());
        };
        let existing = self.collections.get(namespace).map_or(&[][..], Vec::as_slice);
        for index in indexes {
            let Some(keys) = Self::index_keys(document, index) else {
                continue;
            };
            for (position, other) in existing.iter().enumerate() {
                if Some(position) == skip {
                    continue;
                }
                let Some(other_keys) = Self::index_keys(other, index) else {
                    continue;
                };
                if let Some(dup) = keys.iter().find(|k| other_keys.contains(k)) {
                    let field = &index.field;
                    return Err(Error::Conflict(format!(
                        "E11000 duplicate key error collection: {namespace} \
                         index: {field}_1 dup key: {{ {field}: {dup} }}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn insert(&mut self, namespace: &Namespace, mut document: Document) -> Result<(), Error> {
        if !document.contains_key("_id") {
            document.insert("_id".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
        }
        self.check_unique(namespace, &document, None)?;
        self.collections.entry(namespace.clone()).or_default().push(document);
        Ok(())
    }

    fn position(&self, namespace: &Namespace, filter: &Document) -> Option<usize> {
        self.collections
            .get(namespace)?
            .iter()
            .position(|doc| matches_filter(doc, filter))
    }
}

/// Shared in-memory store. Cloning yields another handle on the same data.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    reachable: Arc<AtomicBool>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates an empty, reachable backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulates the endpoint going up or down for new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Returns a key vault store that wraps new data keys under `master_key`.
    #[must_use]
    pub fn key_vault(&self, master_key: MasterKey) -> MemoryKeyVault {
        MemoryKeyVault {
            backend: self.clone(),
            master_key,
        }
    }

    /// Returns the documents of a collection exactly as stored.
    #[must_use]
    pub fn raw_documents(&self, namespace: &Namespace) -> Vec<Document> {
        self.state().collections.get(namespace).cloned().unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(&self, connection_string: &str) -> Result<(), Error> {
        validate_connection_string(connection_string)?;
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!(
                "server selection failed: no reachable servers for {connection_string}"
            )));
        }
        debug!(connection_string, "connected to in-memory store");
        Ok(())
    }

    fn create_unique_index(&self, namespace: &Namespace, index: UniqueIndex) -> Result<(), Error> {
        let mut state = self.state();
        let indexes = state.indexes.entry(namespace.clone()).or_default();
        if indexes.contains(&index) {
            return Ok(());
        }
        if indexes.iter().any(|existing| existing.field == index.field) {
            return Err(Error::Store(format!(
                "an index on `{}` with different options already exists in {namespace}",
                index.field
            )));
        }
        indexes.push(index.clone());
        let documents = state
            .collections
            .get(namespace)
            .cloned()
            .unwrap_or_default();
        for (position, document) in documents.iter().enumerate() {
            if let Err(e) = state.check_unique(namespace, document, Some(position)) {
                if let Some(indexes) = state.indexes.get_mut(namespace) {
                    indexes.retain(|existing| existing != &index);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn load_key_document(&self, namespace: &Namespace, id: &DataKeyId) -> Option<Document> {
        let filter = json!({ "_id": id.to_extended_json() });
        let filter = filter.as_object()?;
        let state = self.state();
        state
            .collections
            .get(namespace)?
            .iter()
            .find(|doc| matches_filter(doc, filter))
            .cloned()
    }
}

fn binary(bytes: &[u8], subtype: &str) -> Value {
    json!({ "$binary": { "base64": STANDARD.encode(bytes), "subType": subtype } })
}

fn binary_bytes(value: &Value, subtype: &str) -> Option<Vec<u8>> {
    let inner = value.as_object()?.get("$binary")?;
    if inner.get("subType")?.as_str()? != subtype {
        return None;
    }
    STANDARD.decode(inner.get("base64")?.as_str()?).ok()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn entry_from_document(document: &Document) -> Option<KeyVaultEntry> {
    let id = DataKeyId::from_extended_json(document.get("_id")?)?;
    let key_alt_names = document
        .get(KEY_ALT_NAMES_FIELD)
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let key_material = binary_bytes(document.get("keyMaterial")?, GENERIC_SUBTYPE)?;
    let provider = document
        .get("masterKey")
        .and_then(|mk| mk.get("provider"))
        .and_then(Value::as_str)
        .unwrap_or(LOCAL_PROVIDER)
        .to_string();
    Some(KeyVaultEntry {
        id,
        key_alt_names,
        key_material,
        provider,
    })
}

/// Key vault store over a [`MemoryBackend`].
pub struct MemoryKeyVault {
    backend: MemoryBackend,
    master_key: MasterKey,
}

#[async_trait]
impl KeyVaultStore for MemoryKeyVault {
    async fn ensure_unique_alias_index(&self, namespace: &Namespace) -> Result<(), Error> {
        let index = UniqueIndex {
            field: KEY_ALT_NAMES_FIELD.to_string(),
            partial: true,
        };
        self.backend.create_unique_index(namespace, index)
    }

    async fn find_by_alias(
        &self,
        namespace: &Namespace,
        alias: &str,
    ) -> Result<Option<KeyVaultEntry>, Error> {
        let state = self.backend.state();
        let entry = state.collections.get(namespace).and_then(|documents| {
            documents
                .iter()
                .filter(|doc| {
                    doc.get(KEY_ALT_NAMES_FIELD)
                        .and_then(Value::as_array)
                        .is_some_and(|names| names.iter().any(|n| n.as_str() == Some(alias)))
                })
                .find_map(entry_from_document)
        });
        Ok(entry)
    }

    async fn create_data_key(
        &self,
        namespace: &Namespace,
        alias: &str,
    ) -> Result<DataKeyId, Error> {
        let data_key = DataKey::generate();
        let wrapped = cipher::wrap_data_key(&self.master_key, &data_key)?;
        let id = DataKeyId::random();
        let now = json!({ "$date": { "$numberLong": now_millis().to_string() } });
        let document: Document = serde_json::from_value(json!({
            "_id": id.to_extended_json(),
            "keyAltNames": [alias],
            "keyMaterial": binary(&wrapped, GENERIC_SUBTYPE),
            "creationDate": now.clone(),
            "updateDate": now,
            "status": 0,
            "masterKey": { "provider": LOCAL_PROVIDER },
        }))?;
        self.backend.state().insert(namespace, document)?;
        Ok(id)
    }
}

struct EncryptionState {
    options: AutoEncryptionOptions,
    schema: EncryptionSchema,
    keys: Mutex<HashMap<DataKeyId, Arc<DataKey>>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Write,
    Query,
}

impl EncryptionState {
    fn data_key(&self, backend: &MemoryBackend, id: &DataKeyId) -> Result<Arc<DataKey>, Error> {
        let cached = self
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        if let Some(key) = cached {
            return Ok(key);
        }
        let document = backend
            .load_key_document(&self.options.key_vault_namespace, id)
            .ok_or_else(|| {
                Error::Encryption(format!(
                    "data key {id} not found in key vault {}",
                    self.options.key_vault_namespace
                ))
            })?;
        let entry = entry_from_document(&document)
            .ok_or_else(|| Error::Encryption(format!("key vault entry {id} is malformed")))?;
        let key = Arc::new(cipher::unwrap_data_key(&self.options.master_key, &entry.key_material)?);
        trace!(key_id = %id, "cached data key");
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*id, Arc::clone(&key));
        Ok(key)
    }

    fn applies_to(&self, namespace: &Namespace) -> bool {
        !self.options.bypass_auto_encryption && self.schema.namespace() == namespace
    }

    /// Replaces every schema-listed value with its ciphertext.
    fn encrypt_document(
        &self,
        backend: &MemoryBackend,
        document: Document,
        mode: Mode,
    ) -> Result<Document, Error> {
        self.encrypt_level(backend, "", document, mode)
    }

    fn encrypt_level(
        &self,
        backend: &MemoryBackend,
        prefix: &str,
        document: Document,
        mode: Mode,
    ) -> Result<Document, Error> {
        let mut out = Document::new();
        for (key, value) in document {
            let path = join_path(prefix, &key);
            let value = match self.schema.lookup(&path) {
                FieldLookup::Encrypted(directive) => {
                    self.encrypt_field(backend, &path, directive, &value, mode)?
                }
                FieldLookup::InsideEncrypted { field, .. } => {
                    let action = match mode {
                        Mode::Query => "query",
                        Mode::Write => "write",
                    };
                    return Err(Error::Encryption(format!(
                        "cannot {action} `{path}`: it lies inside encrypted field `{field}`"
                    )));
                }
                FieldLookup::Plain => match value {
                    Value::Object(nested) if !nested.contains_key("$binary") => {
                        Value::Object(self.encrypt_level(backend, &path, nested, mode)?)
                    }
                    other => other,
                },
            };
            out.insert(key, value);
        }
        Ok(out)
    }

    fn encrypt_field(
        &self,
        backend: &MemoryBackend,
        path: &str,
        directive: FieldDirective,
        value: &Value,
        mode: Mode,
    ) -> Result<Value, Error> {
        if mode == Mode::Query && !directive.algorithm.is_queryable() {
            return Err(Error::UnsupportedQuery {
                field: path.to_string(),
            });
        }
        if !directive.bson_type.matches(value) {
            return Err(Error::Encryption(format!(
                "field `{path}` must be of type {}",
                directive.bson_type
            )));
        }
        let key_id = *self.schema.key_id();
        let data_key = self.data_key(backend, &key_id)?;
        let plaintext = serde_json::to_vec(value)?;
        let ciphertext = cipher::encrypt_value(
            &data_key,
            key_id,
            directive.algorithm,
            directive.bson_type.element_type(),
            &plaintext,
        )?;
        Ok(binary(&ciphertext.to_bytes(), ENCRYPTED_SUBTYPE))
    }

    /// Replaces every encrypted value, wherever it appears, with its plaintext.
    fn decrypt_value(&self, backend: &MemoryBackend, value: Value) -> Result<Value, Error> {
        if let Some(bytes) = binary_bytes(&value, ENCRYPTED_SUBTYPE) {
            let ciphertext = FieldCiphertext::from_bytes(&bytes)?;
            trace!(
                key_id = %ciphertext.key_id(),
                algorithm = ?ciphertext.algorithm(),
                bson_type = ciphertext.bson_type(),
                "decrypting field"
            );
            let data_key = self.data_key(backend, ciphertext.key_id())?;
            let plaintext = cipher::decrypt_value(&data_key, &ciphertext)?;
            return Ok(serde_json::from_slice(&plaintext)?);
        }
        match value {
            Value::Object(map) => Ok(Value::Object(
                map.into_iter()
                    .map(|(k, v)| Ok((k, self.decrypt_value(backend, v)?)))
                    .collect::<Result<_, Error>>()?,
            )),
            Value::Array(items) => Ok(Value::Array(
                items
                    .into_iter()
                    .map(|v| self.decrypt_value(backend, v))
                    .collect::<Result<_, Error>>()?,
            )),
            other => Ok(other),
        }
    }
}

/// Client handle over a [`MemoryBackend`].
pub struct MemoryClient {
    backend: MemoryBackend,
    closed: AtomicBool,
    encryption: Option<EncryptionState>,
}

impl MemoryClient {
    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn outgoing(
        &self,
        namespace: &Namespace,
        document: Document,
        mode: Mode,
    ) -> Result<Document, Error> {
        match &self.encryption {
            Some(enc) if enc.applies_to(namespace) => {
                enc.encrypt_document(&self.backend, document, mode)
            }
            _ => Ok(document),
        }
    }

    fn incoming(&self, document: Document) -> Result<Document, Error> {
        match &self.encryption {
            Some(enc) => match enc.decrypt_value(&self.backend, Value::Object(document))? {
                Value::Object(document) => Ok(document),
                _ => Err(Error::Decryption("decrypted document is not an object".to_string())),
            },
            None => Ok(document),
        }
    }
}

#[async_trait]
impl ClientHandle for MemoryClient {
    fn is_encryption_aware(&self) -> bool {
        self.encryption.is_some()
    }

    async fn insert_one(&self, namespace: &Namespace, document: Document) -> Result<(), Error> {
        self.ensure_open()?;
        let document = self.outgoing(namespace, document, Mode::Write)?;
        self.backend.state().insert(namespace, document)
    }

    async fn upsert_one(
        &self,
        namespace: &Namespace,
        filter: Document,
        update: Document,
    ) -> Result<UpsertOutcome, Error> {
        self.ensure_open()?;
        let filter = self.outgoing(namespace, filter, Mode::Query)?;
        let update = self.outgoing(namespace, update, Mode::Write)?;

        let mut state = self.backend.state();
        if let Some(position) = state.position(namespace, &filter) {
            let mut updated = state.collections[namespace][position].clone();
            let before = updated.clone();
            for (path, value) in update {
                if path != "_id" {
                    set_path(&mut updated, &path, value)?;
                }
            }
            let modified = updated != before;
            state.check_unique(namespace, &updated, Some(position))?;
            if let Some(documents) = state.collections.get_mut(namespace) {
                documents[position] = updated;
            }
            trace!(%namespace, modified, "upsert matched existing document");
            return Ok(UpsertOutcome {
                matched: 1,
                modified: u64::from(modified),
                upserted: false,
            });
        }

        let mut document = Document::new();
        for (path, value) in filter.into_iter().chain(update) {
            set_path(&mut document, &path, value)?;
        }
        state.insert(namespace, document)?;
        trace!(%namespace, "upsert inserted new document");
        Ok(UpsertOutcome {
            matched: 0,
            modified: 0,
            upserted: true,
        })
    }

    async fn find_one(
        &self,
        namespace: &Namespace,
        filter: Document,
    ) -> Result<Option<Document>, Error> {
        self.ensure_open()?;
        let filter = self.outgoing(namespace, filter, Mode::Query)?;
        let found = {
            let state = self.backend.state();
            state
                .position(namespace, &filter)
                .map(|position| state.collections[namespace][position].clone())
        };
        found.map(|document| self.incoming(document)).transpose()
    }

    async fn count_documents(
        &self,
        namespace: &Namespace,
        filter: Document,
    ) -> Result<u64, Error> {
        self.ensure_open()?;
        let filter = self.outgoing(namespace, filter, Mode::Query)?;
        let state = self.backend.state();
        let count = state
            .collections
            .get(namespace)
            .map_or(0, |docs| {
                docs.iter()
                    .filter(|doc| matches_filter(doc, &filter))
                    .count()
            });
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        debug!(encryption_aware = self.is_encryption_aware(), "client closed");
        Ok(())
    }
}

#[async_trait]
impl ClientFactory for MemoryBackend {
    type Client = MemoryClient;

    async fn new_plain_client(&self, connection_string: &str) -> Result<MemoryClient, Error> {
        self.connect(connection_string)?;
        Ok(MemoryClient {
            backend: self.clone(),
            closed: AtomicBool::new(false),
            encryption: None,
        })
    }

    async fn new_encryption_aware_client(
        &self,
        connection_string: &str,
        options: AutoEncryptionOptions,
    ) -> Result<MemoryClient, Error> {
        let schema = options.require_schema()?.clone();
        self.connect(connection_string)?;
        debug!(
            key_vault = %options.key_vault_namespace,
            namespace = %schema.namespace(),
            algorithm_count = schema.encrypted_fields().len(),
            "encryption-aware client ready"
        );
        Ok(MemoryClient {
            backend: self.clone(),
            closed: AtomicBool::new(false),
            encryption: Some(EncryptionState {
                options,
                schema,
                keys: Mutex::default(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_vault::KeyVaultManager;
    use crate::master_key::MASTER_KEY_SIZE;
    use crate::schema::{build_schema_for_key, default_field_specs};

    fn master_key() -> MasterKey {
        MasterKey::from_bytes(vec![0x5A; MASTER_KEY_SIZE]).unwrap()
    }

    fn ns(s: &str) -> Namespace {
        s.parse().unwrap()
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn aware_client(backend: &MemoryBackend) -> MemoryClient {
        let vault = ns("encryption.__keyVault");
        let manager = KeyVaultManager::new(backend.key_vault(master_key()), vault.clone());
        let id = manager.find_or_create_data_key("demo-data-key").await.unwrap();
        let patients = ns("medicalRecords.patients");
        let schema = build_schema_for_key(id, patients, &default_field_specs()).unwrap();
        backend
            .new_encryption_aware_client(
                "mongodb://localhost:27017",
                AutoEncryptionOptions::new(vault, master_key(), schema),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_stored_fields_are_ciphertext() {
        let backend = MemoryBackend::new();
        let client = aware_client(&backend).await;
        let patients = ns("medicalRecords.patients");

        let patient = doc(json!({
            "name": "Jon Doe",
            "ssn": 241_014_209,
            "insurance": { "provider": "MaestCare", "policyNumber": 123_142 }
        }));
        client.insert_one(&patients, patient).await.unwrap();

        let raw = backend.raw_documents(&patients);
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0]["name"], "Jon Doe");
        assert!(binary_bytes(&raw[0]["ssn"], ENCRYPTED_SUBTYPE).is_some());
        assert!(binary_bytes(&raw[0]["insurance"]["policyNumber"], ENCRYPTED_SUBTYPE).is_some());
        assert_eq!(raw[0]["insurance"]["provider"], "MaestCare");
    }

    #[tokio::test]
    async fn test_type_mismatch_rejected() {
        let backend = MemoryBackend::new();
        let client = aware_client(&backend).await;
        let result = client
            .insert_one(&ns("medicalRecords.patients"), doc(json!({ "ssn": "241-01-4209" })))
            .await;
        assert!(matches!(result, Err(Error::Encryption(_))));
    }

    #[tokio::test]
    async fn test_other_namespaces_untouched() {
        let backend = MemoryBackend::new();
        let client = aware_client(&backend).await;
        let other = ns("medicalRecords.visits");
        client.insert_one(&other, doc(json!({ "ssn": 1 }))).await.unwrap();
        assert_eq!(backend.raw_documents(&other)[0]["ssn"], 1);
    }

    #[tokio::test]
    async fn test_dotted_filter_on_deterministic_field() {
        let backend = MemoryBackend::new();
        let client = aware_client(&backend).await;
        let patients = ns("medicalRecords.patients");
        client
            .insert_one(&patients, doc(json!({ "name": "A", "insurance": { "policyNumber": 7 } })))
            .await
            .unwrap();

        let found = client
            .find_one(&patients, doc(json!({ "insurance.policyNumber": 7 })))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["insurance"]["policyNumber"], 7);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let backend = MemoryBackend::new();
        backend.set_reachable(false);
        let result = backend.new_plain_client("mongodb://localhost:27017").await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn test_index_with_conflicting_existing_data_fails() {
        let backend = MemoryBackend::new();
        let client = backend.new_plain_client("mongodb://localhost:27017").await.unwrap();
        let vault = ns("encryption.__keyVault");
        client.insert_one(&vault, doc(json!({ "keyAltNames": ["a"] }))).await.unwrap();
        client.insert_one(&vault, doc(json!({ "keyAltNames": ["a"] }))).await.unwrap();

        let manager = KeyVaultManager::new(backend.key_vault(master_key()), vault);
        let result = manager.ensure_unique_alias_index().await;
        assert!(matches!(result, Err(Error::IndexCreation(_))));
    }

    #[tokio::test]
    async fn test_wrong_master_key_cannot_decrypt() {
        let backend = MemoryBackend::new();
        let client = aware_client(&backend).await;
        let patients = ns("medicalRecords.patients");
        let patient = doc(json!({ "name": "Jon", "bloodType": "AB+" }));
        client.insert_one(&patients, patient).await.unwrap();

        let schema = build_schema_for_key(
            DataKeyId::random(),
            patients.clone(),
            &default_field_specs(),
        )
        .unwrap();
        let intruder = backend
            .new_encryption_aware_client(
                "mongodb://localhost:27017",
                AutoEncryptionOptions::new(
                    ns("encryption.__keyVault"),
                    MasterKey::from_bytes(vec![0x01; MASTER_KEY_SIZE]).unwrap(),
                    schema,
                ),
            )
            .await
            .unwrap();
        let result = intruder.find_one(&patients, doc(json!({ "name": "Jon" }))).await;
        assert!(matches!(result, Err(Error::Decryption(_))));
    }

    #[tokio::test]
    async fn test_write_inside_encrypted_field_rejected() {
        let backend = MemoryBackend::new();
        let client = aware_client(&backend).await;
        let patients = ns("medicalRecords.patients");
        client
            .upsert_one(&patients, doc(json!({ "ssn": 1 })), doc(json!({ "name": "A" })))
            .await
            .unwrap();

        let update = doc(json!({
            "medicalRecords.0": { "weight": 180 },
            "insurance.provider": "X"
        }));
        let result = client
            .upsert_one(&patients, doc(json!({ "ssn": 1 })), update)
            .await;

        assert!(matches!(result, Err(Error::Encryption(_))));
        let raw = backend.raw_documents(&patients);
        assert_eq!(raw.len(), 1);
        assert!(!raw[0].contains_key("medicalRecords.0"));
        assert!(!raw[0].contains_key("medicalRecords"));
        assert!(!raw[0].contains_key("insurance"));
    }

    #[tokio::test]
    async fn test_query_inside_encrypted_field_rejected() {
        let backend = MemoryBackend::new();
        let client = aware_client(&backend).await;
        let by_weight = doc(json!({ "medicalRecords.weight": 180 }));
        let result = client
            .find_one(&ns("medicalRecords.patients"), by_weight)
            .await;
        assert!(matches!(result, Err(Error::Encryption(_))));
    }

    #[tokio::test]
    async fn test_upsert_sets_dotted_paths_as_nested_fields() {
        let backend = MemoryBackend::new();
        let client = aware_client(&backend).await;
        let patients = ns("medicalRecords.patients");
        let by_policy = doc(json!({ "insurance.policyNumber": 9 }));

        let inserted = client
            .upsert_one(&patients, by_policy.clone(), doc(json!({ "name": "B" })))
            .await
            .unwrap();
        let updated = client
            .upsert_one(&patients, by_policy.clone(), doc(json!({ "insurance.provider": "X" })))
            .await
            .unwrap();

        assert!(inserted.upserted);
        assert_eq!(updated.matched, 1);
        let found = client.find_one(&patients, by_policy).await.unwrap().unwrap();
        assert_eq!(found["name"], "B");
        assert_eq!(found["insurance"]["policyNumber"], 9);
        assert_eq!(found["insurance"]["provider"], "X");

        let raw = backend.raw_documents(&patients);
        assert_eq!(raw.len(), 1);
        assert!(!raw[0].contains_key("insurance.provider"));
        assert!(binary_bytes(&raw[0]["insurance"]["policyNumber"], ENCRYPTED_SUBTYPE).is_some());
    }

    #[tokio::test]
    async fn test_plain_upsert_sets_nested_fields() {
        let backend = MemoryBackend::new();
        let client = backend.new_plain_client("mongodb://localhost:27017").await.unwrap();
        let visits = ns("medicalRecords.visits");
        let filter = doc(json!({ "patient.id": 4 }));

        for update in [json!({ "room": 12 }), json!({ "patient.ward": "C" })] {
            client
                .upsert_one(&visits, filter.clone(), doc(update))
                .await
                .unwrap();
        }

        let found = client.find_one(&visits, filter).await.unwrap().unwrap();
        assert_eq!(found["patient"], json!({ "id": 4, "ward": "C" }));
        assert_eq!(found["room"], 12);
    }
}
