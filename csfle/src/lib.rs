//! # `csfle`
//!
//! Client-side field-level encryption toolkit for MongoDB-compatible stores.
//!
//! ## Features
//!
//! - Local 96-byte master key handling
//! - Find-or-create data keys under an alias, guarded by a unique index
//! - Declarative field-encryption schemas (deterministic and randomized)
//! - Plain and encryption-aware client abstractions
//! - In-process backend for offline runs and tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use csfle::prelude::*;
//!
//! let backend = MemoryBackend::new();
//! let config = CsfleConfig::default();
//! let store = backend.key_vault(master_key.clone());
//! let manager = KeyVaultManager::new(store, config.key_vault_namespace.clone());
//! let key_id = manager.find_or_create_data_key(&config.key_alt_name).await?;
//!
//! let namespace = config.encrypted_namespace.clone();
//! let schema = build_schema_for_key(key_id, namespace, &config.fields)?;
//! let settings = DemoSettings::from_config(&config, master_key, schema);
//! let report = run_demo(&backend, settings).await?;
//! println!("{}", serde_json::to_string_pretty(&report.encrypted_view)?);
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod data_key;
pub mod demo;
pub mod error;
pub mod key_vault;
pub mod master_key;
pub mod memory;
pub mod schema;

pub use error::Error;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::client::{AutoEncryptionOptions, ClientFactory, ClientHandle, Document};
    pub use crate::config::{CsfleConfig, Namespace};
    pub use crate::data_key::DataKeyId;
    pub use crate::demo::{resolve_data_key, run_demo, sample_patient, DemoReport, DemoSettings};
    pub use crate::error::Error;
    pub use crate::key_vault::{ConflictPolicy, KeyVaultManager, KeyVaultStore};
    pub use crate::master_key::{MasterKey, MasterKeyProvider};
    pub use crate::memory::MemoryBackend;
    pub use crate::schema::{
        build_schema, build_schema_for_key, Algorithm, BsonType, EncryptionSchema, FieldSpec,
    };
}
