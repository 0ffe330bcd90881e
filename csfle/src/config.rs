//! Configuration for key provisioning and client construction.
//!
//! Every recognized option is a field of [`CsfleConfig`]; unknown keys in a
//! configuration file are rejected. Defaults match a local development setup.
//!
//! ```toml
//! connection_string = "mongodb://localhost:27017"
//! key_vault_namespace = "encryption.__keyVault"
//! key_alt_name = "demo-data-key"
//! encrypted_namespace = "medicalRecords.patients"
//!
//! [kms.local]
//! key_file = "master-key.txt"
//!
//! [[fields]]
//! path = "ssn"
//! bson_type = "int"
//! algorithm = "deterministic"
//! ```

use crate::data_key::DataKeyId;
use crate::error::Error;
use crate::key_vault::ConflictPolicy;
use crate::schema::{validate_field_specs, FieldSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Default connection string of the backing store.
pub const DEFAULT_CONNECTION_STRING: &str = "mongodb://localhost:27017";
/// Default key vault namespace.
pub const DEFAULT_KEY_VAULT_NAMESPACE: &str = "encryption.__keyVault";
/// Default alias of the demo data key.
pub const DEFAULT_KEY_ALT_NAME: &str = "demo-data-key";
/// Default namespace whose fields are encrypted.
pub const DEFAULT_ENCRYPTED_NAMESPACE: &str = "medicalRecords.patients";
/// Default location of the local master key file.
pub const DEFAULT_MASTER_KEY_FILE: &str = "master-key.txt";
/// Default per-operation timeout in milliseconds.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 10_000;

/// A `<database>.<collection>` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    /// Creates a namespace from its parts.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if either part is empty or the
    /// database name contains a dot.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Result<Self, Error> {
        let database = database.into();
        let collection = collection.into();
        if database.is_empty() || collection.is_empty() || database.contains('.') {
            return Err(Error::InvalidArgument(format!(
                "invalid namespace `{database}.{collection}`: expected <database>.<collection>"
            )));
        }
        Ok(Self {
            database,
            collection,
        })
    }

    /// Returns the database name.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (database, collection) = s.split_once('.').ok_or_else(|| {
            Error::InvalidArgument(format!(
                "invalid namespace `{s}`: expected <database>.<collection>"
            ))
        })?;
        Self::new(database, collection)
    }
}

impl TryFrom<String> for Namespace {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.to_string()
    }
}

/// Key management service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KmsProviderConfig {
    /// Master key stored in a local file.
    Local {
        /// Path of the 96-byte master key file
        key_file: PathBuf,
    },
}

impl Default for KmsProviderConfig {
    fn default() -> Self {
        Self::Local {
            key_file: PathBuf::from(DEFAULT_MASTER_KEY_FILE),
        }
    }
}

impl KmsProviderConfig {
    /// Returns the master key file of a local provider.
    #[must_use]
    pub fn key_file(&self) -> &Path {
        match self {
            Self::Local { key_file } => key_file,
        }
    }
}

/// Settings for the `mongocryptd` query-analysis daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MongocryptdConfig {
    /// Do not spawn `mongocryptd`; assume one is already running
    pub bypass_spawn: bool,
    /// Executable used when spawning `mongocryptd`
    pub spawn_path: PathBuf,
}

impl Default for MongocryptdConfig {
    fn default() -> Self {
        Self {
            bypass_spawn: false,
            spawn_path: PathBuf::from("mongocryptd"),
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CsfleConfig {
    /// URI of the backing store
    pub connection_string: String,
    /// Where wrapped data keys live
    pub key_vault_namespace: Namespace,
    /// Alias of the data key used by the schema
    pub key_alt_name: String,
    /// Namespace whose documents carry encrypted fields
    pub encrypted_namespace: Namespace,
    /// Previously provisioned data key id (base64); looked up by alias when absent
    pub data_key_id: Option<DataKeyId>,
    /// Master key source
    pub kms: KmsProviderConfig,
    /// Per-field encryption policy
    pub fields: Vec<FieldSpec>,
    /// Disable automatic encryption on writes while keeping decryption on reads
    pub bypass_auto_encryption: bool,
    /// `mongocryptd` settings
    pub mongocryptd: MongocryptdConfig,
    /// Upper bound for a single store operation, in milliseconds
    pub operation_timeout_ms: u64,
    /// What to do when a concurrent process created the same alias first
    pub conflict_policy: ConflictPolicy,
}

impl Default for CsfleConfig {
    fn default() -> Self {
        Self {
            connection_string: DEFAULT_CONNECTION_STRING.to_string(),
            key_vault_namespace: Namespace {
                database: "encryption".to_string(),
                collection: "__keyVault".to_string(),
            },
            key_alt_name: DEFAULT_KEY_ALT_NAME.to_string(),
            encrypted_namespace: Namespace {
                database: "medicalRecords".to_string(),
                collection: "patients".to_string(),
            },
            data_key_id: None,
            kms: KmsProviderConfig::default(),
            fields: crate::schema::default_field_specs(),
            bypass_auto_encryption: false,
            mongocryptd: MongocryptdConfig::default(),
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

impl CsfleConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on syntax errors, unknown keys, or failed validation.
    pub fn from_toml_str(raw: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be read and `Error::Config` if it is invalid.
    pub fn load(path: &Path) -> Result<Self, Error> {
        debug!(path = %path.display(), "loading config");
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Checks every option; called by the loaders and by the CLI after applying overrides.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid option.
    pub fn validate(&self) -> Result<(), Error> {
        validate_connection_string(&self.connection_string)
            .map_err(|e| Error::Config(e.to_string()))?;
        if self.key_alt_name.trim().is_empty() {
            return Err(Error::Config("key_alt_name must not be empty".to_string()));
        }
        if self.operation_timeout_ms == 0 {
            return Err(Error::Config("operation_timeout_ms must be greater than zero".to_string()));
        }
        if self.kms.key_file().as_os_str().is_empty() {
            return Err(Error::Config("kms.local.key_file must not be empty".to_string()));
        }
        if self.encrypted_namespace == self.key_vault_namespace {
            return Err(Error::Config(
                "encrypted_namespace must differ from key_vault_namespace".to_string(),
            ));
        }
        validate_field_specs(&self.fields).map_err(|e| Error::Config(e.to_string()))
    }

    /// Returns the operation timeout as a [`Duration`].
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Checks that a connection string names a MongoDB endpoint.
///
/// # Errors
///
/// Returns `Error::Connection` for empty strings, unknown schemes, or a missing host.
pub fn validate_connection_string(connection_string: &str) -> Result<(), Error> {
    let rest = connection_string
        .strip_prefix("mongodb://")
        .or_else(|| connection_string.strip_prefix("mongodb+srv://"))
        .ok_or_else(|| {
            Error::Connection(format!(
                "malformed connection string `{connection_string}`: \
                 expected mongodb:// or mongodb+srv://"
            ))
        })?;
    let hosts = rest.rsplit_once('@').map_or(rest, |(_, hosts)| hosts);
    let hosts = hosts.split(|c| c == '/' || c == '?').next().unwrap_or_default();
    if hosts.is_empty() || hosts.split(',').any(str::is_empty) {
        return Err(Error::Connection(format!(
            "malformed connection string `{connection_string}`: missing host"
        )));
    }
    Ok(())
}
