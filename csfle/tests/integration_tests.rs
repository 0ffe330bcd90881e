//! End-to-end behavior against the in-process backend.

use csfle::client::{AutoEncryptionOptions, ClientFactory, ClientHandle, Document};
use csfle::config::{CsfleConfig, Namespace};
use csfle::data_key::DataKeyId;
use csfle::error::Error;
use csfle::key_vault::{KeyVaultManager, KeyVaultStore};
use csfle::master_key::{MasterKey, MasterKeyProvider};
use csfle::memory::{MemoryBackend, MemoryKeyVault};
use csfle::schema::{build_schema, build_schema_for_key, default_field_specs, EncryptionSchema};
use csfle_key_file::{generate_master_key, LocalKeyFile};
use proptest::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

const URI: &str = "mongodb://localhost:27017";

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn master_key(dir: &TempDir) -> MasterKey {
    generate_master_key(dir.path().join("master-key.txt")).unwrap()
}

fn manager(backend: &MemoryBackend, key: MasterKey) -> KeyVaultManager<MemoryKeyVault> {
    KeyVaultManager::new(backend.key_vault(key), CsfleConfig::default().key_vault_namespace)
}

async fn provisioned_schema(backend: &MemoryBackend, key: &MasterKey) -> EncryptionSchema {
    let config = CsfleConfig::default();
    let id = manager(backend, key.clone())
        .find_or_create_data_key(&config.key_alt_name)
        .await
        .unwrap();
    build_schema_for_key(id, config.encrypted_namespace, &config.fields).unwrap()
}

fn patients() -> Namespace {
    CsfleConfig::default().encrypted_namespace
}

#[tokio::test]
async fn test_find_or_create_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let manager = manager(&backend, master_key(&dir));

    let first = manager.find_or_create_data_key("demo-data-key").await.unwrap();
    let second = manager.find_or_create_data_key("demo-data-key").await.unwrap();

    assert_eq!(first, second);
    let entries = backend.raw_documents(manager.namespace());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["keyAltNames"], json!(["demo-data-key"]));
}

#[tokio::test]
async fn test_alias_uniqueness_and_aliasless_entries() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let manager = manager(&backend, master_key(&dir));
    let vault = manager.namespace().clone();
    manager.ensure_unique_alias_index().await.unwrap();

    let duplicate = manager.store().create_data_key(&vault, "shared").await;
    assert!(duplicate.is_ok());
    let duplicate = manager.store().create_data_key(&vault, "shared").await;
    assert!(matches!(duplicate, Err(Error::Conflict(_))));

    let client = backend.new_plain_client(URI).await.unwrap();
    for n in 0..3 {
        client.insert_one(&vault, doc(json!({ "note": n }))).await.unwrap();
    }
    assert_eq!(client.count_documents(&vault, Document::new()).await.unwrap(), 4);
}

#[tokio::test]
async fn test_distinct_aliases_get_distinct_keys() {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let manager = manager(&backend, master_key(&dir));

    let a = manager.find_or_create_data_key("a").await.unwrap();
    let b = manager.find_or_create_data_key("b").await.unwrap();
    assert_ne!(a, b);
}

#[tokio::test]
async fn test_deterministic_round_trip() {
    let dir = TempDir::new().unwrap();
    let key = master_key(&dir);
    let backend = MemoryBackend::new();
    let schema = provisioned_schema(&backend, &key).await;
    let vault = CsfleConfig::default().key_vault_namespace;

    let aware = backend
        .new_encryption_aware_client(URI, AutoEncryptionOptions::new(vault, key, schema))
        .await
        .unwrap();
    let plain = backend.new_plain_client(URI).await.unwrap();
    let record = doc(json!({ "name": "Jon Doe", "ssn": 241_014_209, "bloodType": "AB+" }));

    aware.insert_one(&patients(), record).await.unwrap();

    let by_ssn = doc(json!({ "ssn": 241_014_209 }));
    let seen = aware.find_one(&patients(), by_ssn.clone()).await.unwrap().unwrap();
    assert_eq!(seen["ssn"], 241_014_209);
    assert_eq!(seen["bloodType"], "AB+");

    assert!(plain.find_one(&patients(), by_ssn).await.unwrap().is_none());
    let raw = plain
        .find_one(&patients(), doc(json!({ "name": "Jon Doe" })))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(raw["ssn"], 241_014_209);
    assert!(raw["ssn"]["$binary"].is_object());
}

#[tokio::test]
async fn test_randomized_ciphertexts_differ() {
    let dir = TempDir::new().unwrap();
    let key = master_key(&dir);
    let backend = MemoryBackend::new();
    let schema = provisioned_schema(&backend, &key).await;
    let aware = backend
        .new_encryption_aware_client(
            URI,
            AutoEncryptionOptions::new(CsfleConfig::default().key_vault_namespace, key, schema),
        )
        .await
        .unwrap();

    for name in ["first", "second"] {
        let record = doc(json!({ "name": name, "ssn": 1, "bloodType": "AB+" }));
        aware.insert_one(&patients(), record).await.unwrap();
    }

    let stored = backend.raw_documents(&patients());
    assert_eq!(stored.len(), 2);
    assert_ne!(stored[0]["bloodType"], stored[1]["bloodType"]);
    assert_eq!(stored[0]["ssn"], stored[1]["ssn"]);
}

#[tokio::test]
async fn test_randomized_field_not_queryable() {
    let dir = TempDir::new().unwrap();
    let key = master_key(&dir);
    let backend = MemoryBackend::new();
    let schema = provisioned_schema(&backend, &key).await;
    let aware = backend
        .new_encryption_aware_client(
            URI,
            AutoEncryptionOptions::new(CsfleConfig::default().key_vault_namespace, key, schema),
        )
        .await
        .unwrap();

    let result = aware.find_one(&patients(), doc(json!({ "bloodType": "AB+" }))).await;
    assert!(matches!(result, Err(Error::UnsupportedQuery { field }) if field == "bloodType"));
}

#[tokio::test]
async fn test_repeated_upsert_keeps_one_record() {
    let dir = TempDir::new().unwrap();
    let key = master_key(&dir);
    let backend = MemoryBackend::new();
    let schema = provisioned_schema(&backend, &key).await;
    let aware = backend
        .new_encryption_aware_client(
            URI,
            AutoEncryptionOptions::new(CsfleConfig::default().key_vault_namespace, key, schema),
        )
        .await
        .unwrap();
    let patient = csfle::demo::sample_patient();
    let filter = doc(json!({ "ssn": 241_014_209 }));

    let first = aware.upsert_one(&patients(), filter.clone(), patient.clone()).await.unwrap();
    let second = aware.upsert_one(&patients(), filter.clone(), patient).await.unwrap();

    assert!(first.upserted);
    assert_eq!(second.matched, 1);
    assert_eq!(aware.count_documents(&patients(), filter).await.unwrap(), 1);
}

#[tokio::test]
async fn test_missing_master_key_fails_before_store() {
    let dir = TempDir::new().unwrap();
    let provider = LocalKeyFile::new(dir.path().join("missing.txt"));
    let backend = MemoryBackend::new();

    let result = provider.master_key();

    assert!(matches!(result, Err(Error::Io(_))));
    assert!(result.unwrap_err().is_fatal());
    assert!(backend.raw_documents(&CsfleConfig::default().key_vault_namespace).is_empty());
}

#[tokio::test]
async fn test_closed_handle_rejects_operations() {
    let backend = MemoryBackend::new();
    let client = backend.new_plain_client(URI).await.unwrap();
    client.close().await.unwrap();

    let result = client.find_one(&patients(), Document::new()).await;
    assert!(matches!(result, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_missing_schema_is_invalid_argument() {
    let dir = TempDir::new().unwrap();
    let key = master_key(&dir);
    let backend = MemoryBackend::new();
    let schema = provisioned_schema(&backend, &key).await;
    let vault = CsfleConfig::default().key_vault_namespace;
    let mut options = AutoEncryptionOptions::new(vault, key, schema);
    options.schema = None;
    backend.set_reachable(false);

    let result = backend.new_encryption_aware_client(URI, options).await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn test_keys_survive_new_handles() {
    let dir = TempDir::new().unwrap();
    let key = master_key(&dir);
    let backend = MemoryBackend::new();
    let schema = provisioned_schema(&backend, &key).await;
    let vault = CsfleConfig::default().key_vault_namespace;

    let options = AutoEncryptionOptions::new(vault.clone(), key.clone(), schema.clone());
    let writer = backend.new_encryption_aware_client(URI, options).await.unwrap();
    writer.insert_one(&patients(), doc(json!({ "ssn": 7, "bloodType": "O-" }))).await.unwrap();
    writer.close().await.unwrap();

    let reader = backend
        .new_encryption_aware_client(URI, AutoEncryptionOptions::new(vault, key, schema))
        .await
        .unwrap();
    let seen = reader.find_one(&patients(), doc(json!({ "ssn": 7 }))).await.unwrap().unwrap();
    assert_eq!(seen["bloodType"], "O-");
}

proptest! {
    #[test]
    fn test_schema_is_deterministic(bytes in prop::array::uniform16(any::<u8>())) {
        let id = DataKeyId::from_bytes(bytes).to_base64();
        let fields = default_field_specs();

        let a = build_schema(&id, "medicalRecords.patients", &fields).unwrap();
        let b = build_schema(&id, "medicalRecords.patients", &fields).unwrap();

        prop_assert_eq!(a.to_json(), b.to_json());
        prop_assert_eq!(a.key_id().to_base64(), id);
    }
}
