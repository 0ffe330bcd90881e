//! Upsert-then-read walkthrough.
//!
//! Writes a sample patient through an encryption-aware client, reads it back
//! through that client and through a plain one, and reports what each saw.

use crate::client::{
    with_timeout, AutoEncryptionOptions, ClientFactory, ClientHandle, Document, UpsertOutcome,
};
use crate::config::{CsfleConfig, Namespace};
use crate::data_key::DataKeyId;
use crate::error::Error;
use crate::key_vault::{KeyVaultManager, KeyVaultStore};
use crate::master_key::MasterKey;
use crate::schema::EncryptionSchema;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, info_span, Instrument};

/// The patient record written by the demo.
#[must_use]
pub fn sample_patient() -> Document {
    let patient = json!({
        "name": "Jon Doe",
        "ssn": 241_014_209,
        "bloodType": "AB+",
        "medicalRecords": [{ "weight": 180, "bloodPressure": "120/80" }],
        "insurance": { "provider": "MaestCare", "policyNumber": 123_142 }
    });
    match patient {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Inputs of [`run_demo`].
#[derive(Debug, Clone)]
pub struct DemoSettings {
    /// Connection string both clients connect with
    pub connection_string: String,
    /// Namespace the sample patient is written to
    pub namespace: Namespace,
    /// Options for the encryption-aware client
    pub options: AutoEncryptionOptions,
    /// Bound on each upsert and read
    pub timeout: Duration,
}

impl DemoSettings {
    /// Derives settings from configuration, a master key and a built schema.
    #[must_use]
    pub fn from_config(
        config: &CsfleConfig,
        master_key: MasterKey,
        schema: EncryptionSchema,
    ) -> Self {
        let mut options =
            AutoEncryptionOptions::new(config.key_vault_namespace.clone(), master_key, schema);
        options.bypass_auto_encryption = config.bypass_auto_encryption;
        options.mongocryptd = config.mongocryptd.clone();
        Self {
            connection_string: config.connection_string.clone(),
            namespace: config.encrypted_namespace.clone(),
            options,
            timeout: config.operation_timeout(),
        }
    }
}

/// What each client observed.
#[derive(Debug, Clone, PartialEq)]
pub struct DemoReport {
    /// Outcome of the upsert keyed on `ssn`
    pub upsert: UpsertOutcome,
    /// Record read by `ssn` through the encryption-aware client
    pub encrypted_view: Option<Document>,
    /// Record read by `name` through the plain client
    pub plain_view: Option<Document>,
}

/// Returns the configured data key id, or finds-or-creates the one under the
/// configured alias.
///
/// # Errors
///
/// Propagates key vault errors.
pub async fn resolve_data_key<S: KeyVaultStore>(
    manager: &KeyVaultManager<S>,
    config: &CsfleConfig,
) -> Result<DataKeyId, Error> {
    match config.data_key_id {
        Some(id) => {
            info!(key_id = %id, "using configured data key");
            Ok(id)
        }
        None => manager.find_or_create_data_key(&config.key_alt_name).await,
    }
}

/// Runs the upsert-then-read cycle. Both handles are closed before returning,
/// on success and on failure.
///
/// # Errors
///
/// Returns the first connection, encryption or store error encountered.
pub async fn run_demo<F: ClientFactory>(
    factory: &F,
    settings: DemoSettings,
) -> Result<DemoReport, Error> {
    let span = info_span!("demo", namespace = %settings.namespace);
    async move {
        let plain = factory.new_plain_client(&settings.connection_string).await?;
        let aware = match factory
            .new_encryption_aware_client(&settings.connection_string, settings.options.clone())
            .await
        {
            Ok(aware) => aware,
            Err(e) => {
                plain.close().await?;
                return Err(e);
            }
        };

        let result = exercise(&plain, &aware, &settings).await;
        let closed_aware = aware.close().await;
        let closed_plain = plain.close().await;

        let report = result?;
        closed_aware?;
        closed_plain?;
        Ok(report)
    }
    .instrument(span)
    .await
}

async fn exercise<C: ClientHandle>(
    plain: &C,
    aware: &C,
    settings: &DemoSettings,
) -> Result<DemoReport, Error> {
    let patient = sample_patient();
    let ns = &settings.namespace;
    let by_ssn = field_filter(&patient, "ssn");
    let by_name = field_filter(&patient, "name");

    let upsert = aware.upsert_one(ns, by_ssn.clone(), patient.clone());
    let upsert = with_timeout(settings.timeout, upsert).await?;
    info!(matched = upsert.matched, upserted = upsert.upserted, "patient upserted");

    let encrypted_view = with_timeout(settings.timeout, aware.find_one(ns, by_ssn)).await?;
    info!(found = encrypted_view.is_some(), "read by ssn through encryption-aware client");

    let plain_view = with_timeout(settings.timeout, plain.find_one(ns, by_name)).await?;
    info!(found = plain_view.is_some(), "read by name through plain client");

    Ok(DemoReport {
        upsert,
        encrypted_view,
        plain_view,
    })
}

fn field_filter(document: &Document, field: &str) -> Document {
    document
        .get(field)
        .map(|value| (field.to_string(), value.clone()))
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master_key::MASTER_KEY_SIZE;
    use crate::memory::{MemoryBackend, ENCRYPTED_SUBTYPE};
    use crate::schema::build_schema_for_key;

    async fn setup() -> (MemoryBackend, CsfleConfig, DemoSettings) {
        let backend = MemoryBackend::new();
        let config = CsfleConfig::default();
        let master_key = MasterKey::from_bytes(vec![7; MASTER_KEY_SIZE]).unwrap();
        let store = backend.key_vault(master_key.clone());
        let manager = KeyVaultManager::new(store, config.key_vault_namespace.clone());
        let key_id = resolve_data_key(&manager, &config).await.unwrap();
        let namespace = config.encrypted_namespace.clone();
        let schema = build_schema_for_key(key_id, namespace, &config.fields).unwrap();
        let settings = DemoSettings::from_config(&config, master_key, schema);
        (backend, config, settings)
    }

    #[test]
    fn test_sample_patient_shape() {
        let patient = sample_patient();
        assert_eq!(patient["name"], "Jon Doe");
        assert_eq!(patient["ssn"], 241_014_209);
        assert_eq!(patient["insurance"]["policyNumber"], 123_142);
        assert_eq!(patient["medicalRecords"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_demo_views() {
        let (backend, config, settings) = setup().await;

        let report = run_demo(&backend, settings).await.unwrap();

        assert!(report.upsert.upserted);
        let seen = report.encrypted_view.unwrap();
        assert_eq!(seen["ssn"], 241_014_209);
        assert_eq!(seen["bloodType"], "AB+");
        let raw = report.plain_view.unwrap();
        assert_eq!(raw["name"], "Jon Doe");
        assert_eq!(raw["ssn"]["$binary"]["subType"], ENCRYPTED_SUBTYPE);
        assert_eq!(raw["insurance"]["provider"], "MaestCare");
        assert_eq!(raw["insurance"]["policyNumber"]["$binary"]["subType"], ENCRYPTED_SUBTYPE);
        assert_eq!(backend.raw_documents(&config.encrypted_namespace).len(), 1);
    }

    #[tokio::test]
    async fn test_demo_rerun_keeps_single_record() {
        let (backend, config, settings) = setup().await;

        run_demo(&backend, settings.clone()).await.unwrap();
        let second = run_demo(&backend, settings).await.unwrap();

        assert_eq!(second.upsert.matched, 1);
        assert!(!second.upsert.upserted);
        assert_eq!(backend.raw_documents(&config.encrypted_namespace).len(), 1);
    }

    #[tokio::test]
    async fn test_configured_key_id_skips_lookup() {
        let backend = MemoryBackend::new();
        let id = DataKeyId::random();
        let config = CsfleConfig {
            data_key_id: Some(id),
            ..CsfleConfig::default()
        };
        let master_key = MasterKey::from_bytes(vec![7; MASTER_KEY_SIZE]).unwrap();
        let store = backend.key_vault(master_key);
        let manager = KeyVaultManager::new(store, config.key_vault_namespace.clone());

        assert_eq!(resolve_data_key(&manager, &config).await.unwrap(), id);
        assert!(backend.raw_documents(&config.key_vault_namespace).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_store_fails() {
        let (backend, _, settings) = setup().await;
        backend.set_reachable(false);
        let result = run_demo(&backend, settings).await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }
}
