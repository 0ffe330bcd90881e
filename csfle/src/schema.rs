//! Encryption schema construction.
//!
//! A schema maps one collection namespace to a JSON schema document telling
//! the encryption-aware client which fields to encrypt, with which algorithm,
//! and under which data key. Fields that need equality queries use the
//! deterministic algorithm; everything else uses the randomized one.
//!
//! The per-field policy is data ([`FieldSpec`]), so new fields are added
//! through configuration rather than code.

use crate::config::Namespace;
use crate::data_key::DataKeyId;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Encryption algorithm applied to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Same plaintext always produces the same ciphertext; equality-queryable.
    Deterministic,
    /// Fresh ciphertext on every write; not queryable.
    #[serde(alias = "random")]
    Randomized,
}

impl Algorithm {
    /// Returns the algorithm name understood by the encryption library.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic",
            Self::Randomized => "AEAD_AES_256_CBC_HMAC_SHA_512-Random",
        }
    }

    /// Whether equality filters on fields using this algorithm can match.
    #[must_use]
    pub const fn is_queryable(self) -> bool {
        matches!(self, Self::Deterministic)
    }
}

/// BSON type of an encrypted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BsonType {
    /// 32-bit integer
    #[serde(alias = "integer")]
    Int,
    /// 64-bit integer
    Long,
    /// Double precision float
    Double,
    /// UTF-8 string
    String,
    /// Array of values
    Array,
    /// Embedded document
    Object,
    /// Boolean
    Bool,
}

impl BsonType {
    /// Returns the BSON type alias used in JSON schema.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
            Self::Bool => "bool",
        }
    }

    /// BSON element type byte.
    #[must_use]
    pub const fn element_type(self) -> u8 {
        match self {
            Self::Double => 0x01,
            Self::String => 0x02,
            Self::Object => 0x03,
            Self::Array => 0x04,
            Self::Bool => 0x08,
            Self::Int => 0x10,
            Self::Long => 0x12,
        }
    }

    /// Whether a JSON value is acceptable for this type.
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::Int => value.as_i64().is_some_and(|n| i32::try_from(n).is_ok()),
            Self::Long => value.is_i64() || value.is_u64(),
            Self::Double => value.is_number(),
            Self::String => value.is_string(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Bool => value.is_boolean(),
        }
    }
}

impl fmt::Display for BsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encryption policy for one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSpec {
    /// Dotted path of the field, e.g. `insurance.policyNumber`
    pub path: String,
    /// Type of the plaintext value
    pub bson_type: BsonType,
    /// Encryption algorithm
    pub algorithm: Algorithm,
}

impl FieldSpec {
    /// Creates a field specification.
    #[must_use]
    pub fn new(path: impl Into<String>, bson_type: BsonType, algorithm: Algorithm) -> Self {
        Self {
            path: path.into(),
            bson_type,
            algorithm,
        }
    }
}

/// The field policy of the medical records demo.
#[must_use]
pub fn default_field_specs() -> Vec<FieldSpec> {
    vec![
        FieldSpec::new("ssn", BsonType::Int, Algorithm::Deterministic),
        FieldSpec::new("bloodType", BsonType::String, Algorithm::Randomized),
        FieldSpec::new("medicalRecords", BsonType::Array, Algorithm::Randomized),
        FieldSpec::new("insurance.policyNumber", BsonType::Int, Algorithm::Deterministic),
    ]
}

/// Checks a field table for empty segments, duplicates and nested encrypted paths.
///
/// # Errors
///
/// Returns `Error::InvalidArgument` describing the first problem found.
pub fn validate_field_specs(fields: &[FieldSpec]) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for field in fields {
        if field.path.is_empty() || field.path.split('.').any(str::is_empty) {
            return Err(Error::InvalidArgument(format!("invalid field path `{}`", field.path)));
        }
        if field.path.split('.').any(|s| s.starts_with('$')) {
            return Err(Error::InvalidArgument(format!(
                "field path `{}` must not start with `$`",
                field.path
            )));
        }
        if !seen.insert(field.path.as_str()) {
            return Err(Error::InvalidArgument(format!("duplicate field path `{}`", field.path)));
        }
    }
    for outer in fields {
        let prefix = format!("{}.", outer.path);
        if let Some(inner) = fields.iter().find(|f| f.path.starts_with(&prefix)) {
            return Err(Error::InvalidArgument(format!(
                "field `{}` is nested inside encrypted field `{}`",
                inner.path, outer.path
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SchemaNode {
    Encrypted(FieldDirective),
    Object(BTreeMap<String, SchemaNode>),
}

impl SchemaNode {
    fn to_json(&self) -> Value {
        match self {
            Self::Encrypted(directive) => json!({
                "encrypt": {
                    "bsonType": directive.bson_type.as_str(),
                    "algorithm": directive.algorithm.as_str(),
                }
            }),
            Self::Object(children) => json!({
                "bsonType": "object",
                "properties": properties_to_json(children),
            }),
        }
    }
}

fn properties_to_json(nodes: &BTreeMap<String, SchemaNode>) -> Value {
    Value::Object(
        nodes
            .iter()
            .map(|(name, node)| (name.clone(), node.to_json()))
            .collect(),
    )
}

/// A field directive resolved from a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDirective {
    /// Type of the plaintext value
    pub bson_type: BsonType,
    /// Encryption algorithm
    pub algorithm: Algorithm,
}

/// How a dotted path relates to the encrypted fields of a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldLookup {
    /// The path names an encrypted field.
    Encrypted(FieldDirective),
    /// The path lies below an encrypted field, whose value is opaque ciphertext.
    InsideEncrypted {
        /// Path of the enclosing encrypted field
        field: String,
        /// Directive of the enclosing encrypted field
        directive: FieldDirective,
    },
    /// The path is stored in plaintext.
    Plain,
}

/// Declarative encryption schema for one collection.
///
/// Built by [`build_schema`]; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionSchema {
    namespace: Namespace,
    key_id: DataKeyId,
    properties: BTreeMap<String, SchemaNode>,
}

impl EncryptionSchema {
    /// Returns the namespace the schema applies to.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Returns the data key that wraps every encrypted field.
    #[must_use]
    pub const fn key_id(&self) -> &DataKeyId {
        &self.key_id
    }

    /// Resolves a dotted path against the schema.
    #[must_use]
    pub fn lookup(&self, path: &str) -> FieldLookup {
        let mut nodes = &self.properties;
        let mut walked = 0;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            walked += segment.len() + usize::from(walked > 0);
            match nodes.get(segment) {
                None => return FieldLookup::Plain,
                Some(SchemaNode::Encrypted(directive)) => {
                    if segments.peek().is_none() {
                        return FieldLookup::Encrypted(*directive);
                    }
                    return FieldLookup::InsideEncrypted {
                        field: path[..walked].to_string(),
                        directive: *directive,
                    };
                }
                Some(SchemaNode::Object(children)) => nodes = children,
            }
        }
        FieldLookup::Plain
    }

    /// Looks up the directive for a dotted field path.
    ///
    /// Returns `None` both for plaintext paths and for paths inside an
    /// encrypted field; use [`EncryptionSchema::lookup`] to tell them apart.
    #[must_use]
    pub fn encrypted_field(&self, path: &str) -> Option<FieldDirective> {
        match self.lookup(path) {
            FieldLookup::Encrypted(directive) => Some(directive),
            FieldLookup::InsideEncrypted { .. } | FieldLookup::Plain => None,
        }
    }

    /// Checks that an equality filter can be evaluated against encrypted data.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedQuery` for a filter on a randomized field and
    /// `Error::Encryption` for a filter on a path inside an encrypted field.
    pub fn check_query(&self, filter: &Map<String, Value>) -> Result<(), Error> {
        self.check_query_level("", filter)
    }

    fn check_query_level(&self, prefix: &str, filter: &Map<String, Value>) -> Result<(), Error> {
        for (key, value) in filter {
            let path = join_path(prefix, key);
            match self.lookup(&path) {
                FieldLookup::Encrypted(directive) if !directive.algorithm.is_queryable() => {
                    return Err(Error::UnsupportedQuery { field: path });
                }
                FieldLookup::Encrypted(_) => {}
                FieldLookup::InsideEncrypted { field, .. } => {
                    return Err(Error::Encryption(format!(
                        "cannot query `{path}`: it lies inside encrypted field `{field}`"
                    )));
                }
                FieldLookup::Plain => {
                    if let Value::Object(nested) = value {
                        self.check_query_level(&path, nested)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Lists every encrypted field as `(path, directive)`, sorted by path.
    #[must_use]
    pub fn encrypted_fields(&self) -> Vec<(String, FieldDirective)> {
        fn walk(
            prefix: &str,
            nodes: &BTreeMap<String, SchemaNode>,
            out: &mut Vec<(String, FieldDirective)>,
        ) {
            for (name, node) in nodes {
                let path = join_path(prefix, name);
                match node {
                    SchemaNode::Encrypted(directive) => out.push((path, *directive)),
                    SchemaNode::Object(children) => walk(&path, children, out),
                }
            }
        }
        let mut out = Vec::new();
        walk("", &self.properties, &mut out);
        out
    }

    /// Renders the JSON schema document for this collection.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "bsonType": "object",
            "encryptMetadata": { "keyId": [self.key_id.to_extended_json()] },
            "properties": properties_to_json(&self.properties),
        })
    }

    /// Renders the schema map (`{ "<db>.<coll>": <schema> }`) handed to the client.
    #[must_use]
    pub fn to_schema_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(self.namespace.to_string(), self.to_json());
        map
    }
}

/// Builds the encryption schema for `namespace` from a field table.
///
/// The function is pure: the same inputs always produce an identical schema.
///
/// # Errors
///
/// Returns `Error::InvalidArgument` if `data_key_id` is empty or malformed, if
/// `namespace` is not `<database>.<collection>`, or if the field table is invalid.
///
/// # Example
///
/// ```
/// use csfle::schema::{build_schema, default_field_specs};
///
/// let schema = build_schema(
///     "AQEBAQEBAQEBAQEBAQEBAQ==",
///     "medicalRecords.patients",
///     &default_field_specs(),
/// )
/// .unwrap();
/// assert!(schema.encrypted_field("insurance.policyNumber").is_some());
/// assert!(schema.encrypted_field("name").is_none());
/// ```
pub fn build_schema(
    data_key_id: &str,
    namespace: &str,
    fields: &[FieldSpec],
) -> Result<EncryptionSchema, Error> {
    let key_id = DataKeyId::from_base64(data_key_id)?;
    let namespace: Namespace = namespace.parse()?;
    build_schema_for_key(key_id, namespace, fields)
}

/// Typed variant of [`build_schema`] for callers that already hold parsed values.
///
/// # Errors
///
/// Returns `Error::InvalidArgument` if the field table is invalid.
pub fn build_schema_for_key(
    key_id: DataKeyId,
    namespace: Namespace,
    fields: &[FieldSpec],
) -> Result<EncryptionSchema, Error> {
    validate_field_specs(fields)?;

    let mut properties = BTreeMap::new();
    for field in fields {
        let mut segments: Vec<&str> = field.path.split('.').collect();
        let leaf = segments.pop().unwrap_or_default();
        let mut nodes = &mut properties;
        for segment in segments {
            let node = nodes
                .entry(segment.to_string())
                .or_insert_with(|| SchemaNode::Object(BTreeMap::new()));
            nodes = match node {
                SchemaNode::Object(children) => children,
                SchemaNode::Encrypted(_) => {
                    return Err(Error::InvalidArgument(format!(
                        "field `{}` is nested inside an encrypted field",
                        field.path
                    )))
                }
            };
        }
        let directive = FieldDirective {
            bson_type: field.bson_type,
            algorithm: field.algorithm,
        };
        nodes.insert(leaf.to_string(), SchemaNode::Encrypted(directive));
    }

    Ok(EncryptionSchema {
        namespace,
        key_id,
        properties,
    })
}

pub(crate) fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
