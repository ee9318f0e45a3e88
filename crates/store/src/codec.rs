//! `_ver`-framed JSON column encoding.
//!
//! Every JSON-encoded column carries an integer `_ver` field (currently
//! 1) so the on-disk format can evolve; readers strip it before
//! deserializing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use updraft_domain::{Error, Result};

pub const COLUMN_VERSION: u64 = 1;

/// Serialize a value into a column string, stamping `_ver`.
pub fn encode<T: Serialize>(value: &T) -> Result<String> {
    let mut json = serde_json::to_value(value)?;
    match json {
        Value::Object(ref mut map) => {
            map.insert("_ver".into(), COLUMN_VERSION.into());
        }
        _ => {
            return Err(Error::Validation(
                "only JSON objects are stored in versioned columns".into(),
            ))
        }
    }
    Ok(json.to_string())
}

/// Deserialize a column string, stripping `_ver` first.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let mut json: Value = serde_json::from_str(raw)?;
    if let Value::Object(ref mut map) = json {
        map.remove("_ver");
    }
    Ok(serde_json::from_value(json)?)
}
