//! Typed accessors over a parsed property-list dictionary.
//!
//! Parsing itself is an external collaborator's job (spec §6); this module
//! only spares `ticket.rs`/`manifest.rs` from repeating
//! `.as_dictionary().and_then(|d| d.get(...))` chains, the same way typed
//! wrappers around `dbus::arg::RefArg` spare callers from repeating that
//! chain for D-Bus values.

use crate::Error;
use plist::Value;
use std::collections::HashMap;
use std::io::Cursor;

/// Parses a property list (binary or XML, sniffed by magic bytes) into a
/// `plist::Value`.
pub fn parse(bytes: &[u8]) -> Result<Value, Error> {
    let cursor = Cursor::new(bytes);
    Value::from_reader(cursor).map_err(|e| Error::ManifestMalformed(format!("not a property list: {}", e)))
}

pub fn dict(value: &Value, what: &str) -> Result<&plist::Dictionary, Error> {
    value
        .as_dictionary()
        .ok_or_else(|| Error::ManifestMalformed(format!("{} is not a dictionary", what)))
}

pub fn get<'a>(d: &'a plist::Dictionary, key: &str) -> Option<&'a Value> {
    d.get(key)
}

pub fn get_dict<'a>(d: &'a plist::Dictionary, key: &str) -> Result<&'a plist::Dictionary, Error> {
    get(d, key)
        .and_then(Value::as_dictionary)
        .ok_or_else(|| Error::ManifestMalformed(format!("missing dictionary field {}", key)))
}

pub fn get_string(d: &plist::Dictionary, key: &str) -> Result<String, Error> {
    get(d, key)
        .and_then(Value::as_string)
        .map(str::to_owned)
        .ok_or_else(|| Error::ManifestMalformed(format!("missing string field {}", key)))
}

pub fn get_data<'a>(d: &'a plist::Dictionary, key: &str) -> Result<&'a [u8], Error> {
    get(d, key)
        .and_then(Value::as_data)
        .ok_or_else(|| Error::ManifestMalformed(format!("missing data field {}", key)))
}

pub fn get_array<'a>(d: &'a plist::Dictionary, key: &str) -> Result<&'a Vec<Value>, Error> {
    get(d, key)
        .and_then(Value::as_array)
        .ok_or_else(|| Error::ManifestMalformed(format!("missing array field {}", key)))
}

pub fn get_u64(d: &plist::Dictionary, key: &str) -> Result<u64, Error> {
    get(d, key)
        .and_then(Value::as_unsigned_integer)
        .ok_or_else(|| Error::ManifestMalformed(format!("missing integer field {}", key)))
}

/// Converts a dictionary to an owned `HashMap<String, Value>` for callers
/// that want to move entries around freely.
pub fn to_owned_map(d: &plist::Dictionary) -> HashMap<String, Value> {
    d.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}
