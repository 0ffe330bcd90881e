//! Key vault store over a MongoDB collection.

use crate::convert::map_driver_error;
use async_trait::async_trait;
use csfle::config::Namespace;
use csfle::data_key::DataKeyId;
use csfle::error::Error;
use csfle::key_vault::{KeyVaultEntry, KeyVaultStore, KEY_ALT_NAMES_FIELD};
use csfle::master_key::{MasterKey, LOCAL_PROVIDER};
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use tracing::debug;

/// Key vault store backed by a driver client.
pub struct MongoKeyVault {
    client: Client,
    #[cfg_attr(not(feature = "in-use-encryption"), allow(dead_code))]
    master_key: MasterKey,
}

impl MongoKeyVault {
    pub(crate) const fn new(client: Client, master_key: MasterKey) -> Self {
        Self { client, master_key }
    }

    fn collection(&self, namespace: &Namespace) -> Collection<Document> {
        self.client.database(namespace.database()).collection(namespace.collection())
    }
}

#[async_trait]
impl KeyVaultStore for MongoKeyVault {
    async fn ensure_unique_alias_index(&self, namespace: &Namespace) -> Result<(), Error> {
        let options = IndexOptions::builder()
            .unique(true)
            .partial_filter_expression(doc! { "keyAltNames": { "$exists": true } })
            .build();
        let index = IndexModel::builder()
            .keys(doc! { "keyAltNames": 1 })
            .options(options)
            .build();
        let created = self
            .collection(namespace)
            .create_index(index)
            .await
            .map_err(|e| Error::IndexCreation(e.to_string()))?;
        debug!(%namespace, index = %created.index_name, "unique alias index ensured");
        Ok(())
    }

    async fn find_by_alias(
        &self,
        namespace: &Namespace,
        alias: &str,
    ) -> Result<Option<KeyVaultEntry>, Error> {
        let found = self
            .collection(namespace)
            .find_one(doc! { "keyAltNames": alias })
            .await
            .map_err(map_driver_error)?;
        found.map(|document| entry_from_document(&document)).transpose()
    }

    #[cfg(feature = "in-use-encryption")]
    async fn create_data_key(
        &self,
        namespace: &Namespace,
        alias: &str,
    ) -> Result<DataKeyId, Error> {
        use mongodb::client_encryption::{ClientEncryption, LocalMasterKey};

        let encryption = ClientEncryption::new(
            self.client.clone(),
            crate::driver_namespace(namespace),
            [crate::local_kms_provider(&self.master_key)],
        )
        .map_err(map_driver_error)?;
        let id = encryption
            .create_data_key(LocalMasterKey::builder().build())
            .key_alt_names(vec![alias.to_string()])
            .await
            .map_err(map_driver_error)?;
        DataKeyId::from_slice(&id.bytes)
    }

    #[cfg(not(feature = "in-use-encryption"))]
    async fn create_data_key(
        &self,
        _namespace: &Namespace,
        _alias: &str,
    ) -> Result<DataKeyId, Error> {
        Err(crate::encryption_disabled())
    }
}

fn entry_from_document(document: &Document) -> Result<KeyVaultEntry, Error> {
    let malformed = |what: &str| Error::Store(format!("malformed key vault entry: {what}"));

    let id = match document.get("_id") {
        Some(Bson::Binary(binary)) => DataKeyId::from_slice(&binary.bytes)?,
        _ => return Err(malformed("`_id` is not binary")),
    };
    let key_alt_names = document
        .get_array(KEY_ALT_NAMES_FIELD)
        .map(|names| {
            names
                .iter()
                .filter_map(Bson::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let key_material = match document.get("keyMaterial") {
        Some(Bson::Binary(binary)) => binary.bytes.clone(),
        _ => return Err(malformed("`keyMaterial` is not binary")),
    };
    let provider = document
        .get_document("masterKey")
        .ok()
        .and_then(|master_key| master_key.get_str("provider").ok())
        .unwrap_or(LOCAL_PROVIDER)
        .to_string();

    Ok(KeyVaultEntry {
        id,
        key_alt_names,
        key_material,
        provider,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::spec::BinarySubtype;
    use mongodb::bson::Binary;

    #[test]
    fn test_entry_from_document() {
        let document = doc! {
            "_id": Binary { subtype: BinarySubtype::Uuid, bytes: vec![9; 16] },
            "keyAltNames": ["demo-data-key"],
            "keyMaterial": Binary { subtype: BinarySubtype::Generic, bytes: vec![1, 2, 3] },
            "masterKey": { "provider": "local" },
        };

        let entry = entry_from_document(&document).unwrap();

        assert_eq!(entry.id, DataKeyId::from_bytes([9; 16]));
        assert_eq!(entry.key_alt_names, vec!["demo-data-key".to_string()]);
        assert_eq!(entry.key_material, vec![1, 2, 3]);
        assert_eq!(entry.provider, "local");
    }

    #[test]
    fn test_entry_without_material_is_malformed() {
        let id = Binary {
            subtype: BinarySubtype::Uuid,
            bytes: vec![9; 16],
        };
        let document = doc! { "_id": id };
        assert!(matches!(entry_from_document(&document), Err(Error::Store(_))));
    }
}
