//! Conversions between `csfle` documents and driver BSON, and driver error mapping.

use csfle::client::Document;
use csfle::error::Error;
use mongodb::bson::{self, Bson};
use mongodb::error::{ErrorKind, WriteFailure};
use serde_json::Value;

/// MongoDB duplicate key error code.
pub(crate) const DUPLICATE_KEY: i32 = 11000;

/// Converts an extended JSON document to BSON.
pub(crate) fn to_bson(document: Document) -> Result<bson::Document, Error> {
    match Bson::try_from(Value::Object(document)) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(other) => Err(Error::InvalidArgument(format!(
            "expected a document, got {:?}",
            other.element_type()
        ))),
        Err(e) => Err(Error::InvalidArgument(format!("invalid extended JSON: {e}"))),
    }
}

/// Converts a BSON document to relaxed extended JSON.
pub(crate) fn from_bson(document: bson::Document) -> Result<Document, Error> {
    match Bson::Document(document).into_relaxed_extjson() {
        Value::Object(map) => Ok(map),
        _ => Err(Error::Store("server returned a non-document value".to_string())),
    }
}

/// Maps a driver error onto the crate error taxonomy.
pub(crate) fn map_driver_error(err: mongodb::error::Error) -> Error {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY => {
            Error::Conflict(write.message.clone())
        }
        ErrorKind::Command(command) if command.code == DUPLICATE_KEY => {
            Error::Conflict(command.message.clone())
        }
        ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) | ErrorKind::DnsResolve { .. } => {
            Error::Connection(err.to_string())
        }
        ErrorKind::InvalidArgument { .. } => Error::InvalidArgument(err.to_string()),
        #[cfg(feature = "in-use-encryption")]
        ErrorKind::Encryption(_) => Error::Encryption(err.to_string()),
        _ => Error::Store(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extended_json_round_trip() {
        let doc = json!({
            "name": "Jon Doe",
            "ssn": 241_014_209,
            "keyId": { "$binary": { "base64": "AAECAwQFBgcICQoLDA0ODw==", "subType": "04" } },
            "insurance": { "policyNumber": 123_142 }
        });
        let document = doc.as_object().cloned().unwrap();

        let bson = to_bson(document.clone()).unwrap();
        assert_eq!(bson.get_i32("ssn").unwrap(), 241_014_209);
        assert!(matches!(bson.get("keyId"), Some(Bson::Binary(_))));

        assert_eq!(from_bson(bson).unwrap(), document);
    }

    #[test]
    fn test_invalid_extended_json_rejected() {
        let doc = json!({ "bad": { "$binary": { "base64": "not base64!", "subType": "04" } } });
        let result = to_bson(doc.as_object().cloned().unwrap());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
