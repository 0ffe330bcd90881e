//! MongoDB driver backend for `csfle`.
//!
//! Implements [`ClientFactory`] and [`KeyVaultStore`] with the official
//! `mongodb` driver. Plain clients and key vault lookups work out of the box.
//! Automatic encryption and data key creation are delegated to libmongocrypt
//! and need the `in-use-encryption` feature; without it those operations fail
//! with `Error::Config`.
//!
//! # Example
//!
//! ```rust,no_run
//! use csfle::prelude::*;
//! use csfle_mongodb::MongoBackend;
//!
//! # async fn example(master_key: MasterKey) -> Result<(), Error> {
//! let config = CsfleConfig::default();
//! let backend = MongoBackend::from_config(&config);
//! let store = backend.key_vault(&config.connection_string, master_key).await?;
//! let manager = KeyVaultManager::new(store, config.key_vault_namespace.clone());
//! let key_id = manager.find_or_create_data_key(&config.key_alt_name).await?;
//! println!("{key_id}");
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod convert;
mod key_vault;

pub use key_vault::MongoKeyVault;

use async_trait::async_trait;
use convert::{from_bson, map_driver_error, to_bson};
use csfle::client::{
    AutoEncryptionOptions, ClientFactory, ClientHandle, Document, UpsertOutcome,
};
use csfle::config::{validate_connection_string, CsfleConfig, Namespace};
use csfle::error::Error;
use csfle::master_key::MasterKey;
use csfle::schema::EncryptionSchema;
use mongodb::bson::{doc, Document as BsonDocument};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

const APP_NAME: &str = "csfle";

/// Driver-backed client factory.
#[derive(Debug, Clone)]
pub struct MongoBackend {
    timeout: Duration,
}

impl MongoBackend {
    /// Creates a backend whose connect and server selection timeouts are `timeout`.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Creates a backend using the configured operation timeout.
    #[must_use]
    pub const fn from_config(config: &CsfleConfig) -> Self {
        Self::new(config.operation_timeout())
    }

    /// Connects and returns a key vault store wrapping new keys under `master_key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the server cannot be reached.
    pub async fn key_vault(
        &self,
        connection_string: &str,
        master_key: MasterKey,
    ) -> Result<MongoKeyVault, Error> {
        let options = self.client_options(connection_string).await?;
        let client = self.connect(options).await?;
        Ok(MongoKeyVault::new(client, master_key))
    }

    async fn client_options(&self, connection_string: &str) -> Result<ClientOptions, Error> {
        validate_connection_string(connection_string)?;
        let mut options = ClientOptions::parse(connection_string)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        options.app_name = Some(APP_NAME.to_string());
        options.connect_timeout = Some(self.timeout);
        options.server_selection_timeout = Some(self.timeout);
        Ok(options)
    }

    async fn connect(&self, options: ClientOptions) -> Result<Client, Error> {
        let client = Client::with_options(options).map_err(map_driver_error)?;
        ping(&client).await?;
        Ok(client)
    }
}

async fn ping(client: &Client) -> Result<(), Error> {
    client
        .database("admin")
        .run_command(doc! { "ping": 1 })
        .await
        .map_err(|e| Error::Connection(e.to_string()))?;
    debug!("server ping succeeded");
    Ok(())
}

#[async_trait]
impl ClientFactory for MongoBackend {
    type Client = MongoClient;

    async fn new_plain_client(&self, connection_string: &str) -> Result<MongoClient, Error> {
        let options = self.client_options(connection_string).await?;
        let client = self.connect(options).await?;
        info!(encryption_aware = false, "client connected");
        Ok(MongoClient::new(client, false, None))
    }

    #[cfg(feature = "in-use-encryption")]
    async fn new_encryption_aware_client(
        &self,
        connection_string: &str,
        options: AutoEncryptionOptions,
    ) -> Result<MongoClient, Error> {
        let schema = options.require_schema()?;
        let schema_document =
            to_bson(schema.to_json().as_object().cloned().unwrap_or_default())?;
        let namespace = schema.namespace().to_string();
        let client_options = self.client_options(connection_string).await?;

        let mongocryptd = &options.mongocryptd;
        let client = Client::encrypted_builder(
            client_options,
            driver_namespace(&options.key_vault_namespace),
            [local_kms_provider(&options.master_key)],
        )
        .map_err(map_driver_error)?
        .schema_map([(namespace.clone(), schema_document)])
        .bypass_auto_encryption(options.bypass_auto_encryption)
        .extra_options(doc! {
            "mongocryptdBypassSpawn": mongocryptd.bypass_spawn,
            "mongocryptdSpawnPath": mongocryptd.spawn_path.to_string_lossy().into_owned(),
        })
        .build()
        .await
        .map_err(map_driver_error)?;
        ping(&client).await?;

        info!(encryption_aware = true, %namespace, "client connected");
        let query_schema = (!options.bypass_auto_encryption).then(|| schema.clone());
        Ok(MongoClient::new(client, true, query_schema))
    }

    #[cfg(not(feature = "in-use-encryption"))]
    async fn new_encryption_aware_client(
        &self,
        _connection_string: &str,
        options: AutoEncryptionOptions,
    ) -> Result<MongoClient, Error> {
        options.require_schema()?;
        Err(encryption_disabled())
    }
}

#[cfg(feature = "in-use-encryption")]
pub(crate) fn driver_namespace(namespace: &Namespace) -> mongodb::Namespace {
    mongodb::Namespace {
        db: namespace.database().to_string(),
        coll: namespace.collection().to_string(),
    }
}

#[cfg(feature = "in-use-encryption")]
pub(crate) fn local_kms_provider(
    master_key: &MasterKey,
) -> (
    mongodb::mongocrypt::ctx::KmsProvider,
    BsonDocument,
    Option<mongodb::options::TlsOptions>,
) {
    use mongodb::bson::spec::BinarySubtype;
    use mongodb::bson::Binary;

    let key = Binary {
        subtype: BinarySubtype::Generic,
        bytes: master_key.expose().to_vec(),
    };
    (mongodb::mongocrypt::ctx::KmsProvider::local(), doc! { "key": key }, None)
}

#[cfg(not(feature = "in-use-encryption"))]
pub(crate) fn encryption_disabled() -> Error {
    Error::Config(
        "csfle-mongodb was built without the `in-use-encryption` feature; \
         automatic encryption and data key creation are unavailable"
            .to_string(),
    )
}

/// Rejects filters that automatic encryption cannot serve.
///
/// Filters on other namespaces pass untouched. On the schema's namespace, an
/// equality match on a randomized field fails with `Error::UnsupportedQuery`
/// and a path below an encrypted field fails with `Error::Encryption`, before
/// anything is sent to the server.
///
/// # Errors
///
/// Returns the first unsupported predicate found in `filter`.
pub fn check_query(
    schema: Option<&EncryptionSchema>,
    namespace: &Namespace,
    filter: &Document,
) -> Result<(), Error> {
    match schema {
        Some(schema) if schema.namespace() == namespace => schema.check_query(filter),
        _ => Ok(()),
    }
}

/// Driver-backed client handle.
pub struct MongoClient {
    client: Mutex<Option<Client>>,
    encryption_aware: bool,
    query_schema: Option<EncryptionSchema>,
}

impl MongoClient {
    fn new(
        client: Client,
        encryption_aware: bool,
        query_schema: Option<EncryptionSchema>,
    ) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            encryption_aware,
            query_schema,
        }
    }

    fn check_query(&self, namespace: &Namespace, filter: &Document) -> Result<(), Error> {
        check_query(self.query_schema.as_ref(), namespace, filter)
    }

    fn collection(&self, namespace: &Namespace) -> Result<Collection<BsonDocument>, Error> {
        let guard = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        let client = guard.as_ref().ok_or(Error::ConnectionClosed)?;
        Ok(client.database(namespace.database()).collection(namespace.collection()))
    }
}

#[async_trait]
impl ClientHandle for MongoClient {
    fn is_encryption_aware(&self) -> bool {
        self.encryption_aware
    }

    async fn insert_one(&self, namespace: &Namespace, document: Document) -> Result<(), Error> {
        let collection = self.collection(namespace)?;
        collection.insert_one(to_bson(document)?).await.map_err(map_driver_error)?;
        Ok(())
    }

    async fn upsert_one(
        &self,
        namespace: &Namespace,
        filter: Document,
        update: Document,
    ) -> Result<UpsertOutcome, Error> {
        self.check_query(namespace, &filter)?;
        let collection = self.collection(namespace)?;
        let result = collection
            .update_one(to_bson(filter)?, doc! { "$set": to_bson(update)? })
            .upsert(true)
            .await
            .map_err(map_driver_error)?;
        Ok(UpsertOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted: result.upserted_id.is_some(),
        })
    }

    async fn find_one(
        &self,
        namespace: &Namespace,
        filter: Document,
    ) -> Result<Option<Document>, Error> {
        self.check_query(namespace, &filter)?;
        let collection = self.collection(namespace)?;
        let found = collection.find_one(to_bson(filter)?).await.map_err(map_driver_error)?;
        found.map(from_bson).transpose()
    }

    async fn count_documents(
        &self,
        namespace: &Namespace,
        filter: Document,
    ) -> Result<u64, Error> {
        self.check_query(namespace, &filter)?;
        let collection = self.collection(namespace)?;
        collection.count_documents(to_bson(filter)?).await.map_err(map_driver_error)
    }

    async fn close(&self) -> Result<(), Error> {
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(client) = client {
            client.shutdown().await;
            debug!(encryption_aware = self.encryption_aware, "client closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csfle::data_key::DataKeyId;
    use csfle::master_key::MASTER_KEY_SIZE;
    use csfle::schema::{build_schema_for_key, default_field_specs};
    use serde_json::json;

    fn backend() -> MongoBackend {
        MongoBackend::new(Duration::from_millis(200))
    }

    fn patients_schema() -> EncryptionSchema {
        build_schema_for_key(
            DataKeyId::random(),
            "medicalRecords.patients".parse().unwrap(),
            &default_field_specs(),
        )
        .unwrap()
    }

    fn filter(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_check_query_rejects_randomized_filter() {
        let schema = patients_schema();
        let patients = schema.namespace().clone();

        let result = check_query(Some(&schema), &patients, &filter(json!({ "bloodType": "AB+" })));

        assert!(matches!(result, Err(Error::UnsupportedQuery { field }) if field == "bloodType"));
    }

    #[test]
    fn test_check_query_rejects_path_inside_encrypted_field() {
        let schema = patients_schema();
        let patients = schema.namespace().clone();
        let by_weight = filter(json!({ "medicalRecords.weight": 180 }));

        let result = check_query(Some(&schema), &patients, &by_weight);

        assert!(matches!(result, Err(Error::Encryption(_))));
    }

    #[test]
    fn test_check_query_allows_supported_filters() {
        let schema = patients_schema();
        let patients = schema.namespace().clone();
        let visits: Namespace = "medicalRecords.visits".parse().unwrap();
        let by_blood_type = filter(json!({ "bloodType": "AB+" }));

        assert!(check_query(Some(&schema), &patients, &filter(json!({ "ssn": 1 }))).is_ok());
        assert!(check_query(Some(&schema), &visits, &by_blood_type).is_ok());
        assert!(check_query(None, &patients, &by_blood_type).is_ok());
    }

    #[tokio::test]
    async fn test_malformed_connection_string() {
        let result = backend().new_plain_client("http://localhost:27017").await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let result = backend()
            .new_plain_client("mongodb://127.0.0.1:1/?directConnection=true")
            .await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn test_missing_schema_rejected_before_connecting() {
        let master_key = MasterKey::from_bytes(vec![1; MASTER_KEY_SIZE]).unwrap();
        let vault = "encryption.__keyVault".parse().unwrap();
        let mut options = AutoEncryptionOptions::new(vault, master_key, patients_schema());
        options.schema = None;

        let result = backend()
            .new_encryption_aware_client("mongodb://127.0.0.1:1", options)
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
