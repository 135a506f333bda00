//! Backup codec: secret records to and from a transport-safe string.
//!
//! Wire format is `Base64(UTF-8(JSON array of records))`, small enough to be
//! rendered as a QR code or handed to a peer channel. A pretty-printed JSON
//! config file is supported alongside it for file based backups.

use crate::ids::{compare_ids, next_id};
use crate::store::{SecretRecord, SecretStore};
use crate::Result;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Byte-mode capacity of a version 40 QR code at error correction level L.
pub const QR_BYTE_CAPACITY: usize = 2953;

const UTF8_BOM: char = '\u{feff}';

/// Why a backup payload or URI was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("payload is empty")]
    Empty,

    #[error("payload is not valid Base64")]
    NotBase64,

    #[error("payload is not valid JSON")]
    NotJson,

    #[error("payload must be a JSON array of records")]
    NotAnArray,

    #[error("payload contains no records")]
    NoEntries,

    #[error("entry {index}: {reason}")]
    InvalidEntry { index: usize, reason: String },

    #[error("payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("invalid URI: {0}")]
    InvalidUri(String),
}

pub type FormatResult<T> = std::result::Result<T, FormatError>;

/// Encode records into the Base64 transport string.
pub fn encode(records: &[SecretRecord]) -> String {
    // Serializing plain strings and integers cannot fail.
    let json = serde_json::to_string(records).unwrap_or_else(|_| "[]".to_string());
    STANDARD.encode(json.as_bytes())
}

/// Encode records and check the result still fits in a single QR code.
pub fn encode_for_qr(records: &[SecretRecord]) -> FormatResult<String> {
    let payload = encode(records);
    if payload.len() > QR_BYTE_CAPACITY {
        return Err(FormatError::PayloadTooLarge {
            size: payload.len(),
            limit: QR_BYTE_CAPACITY,
        });
    }
    Ok(payload)
}

/// Decode and validate a transport string.
///
/// Standard Base64 is tried first; URL-safe characters and missing padding
/// are accepted as a fallback. Payloads whose JSON was percent-encoded
/// before Base64 are also understood.
pub fn decode(text: &str) -> FormatResult<Vec<SecretRecord>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(FormatError::Empty);
    }

    let bytes = decode_base64(&compact)?;
    let json = String::from_utf8(bytes).map_err(|_| FormatError::NotJson)?;
    let value = parse_json_lenient(&json)?;
    validate_records(value, false)
}

fn decode_base64(text: &str) -> FormatResult<Vec<u8>> {
    if let Ok(bytes) = STANDARD.decode(text) {
        return Ok(bytes);
    }

    let corrected: String = text
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    STANDARD_NO_PAD
        .decode(corrected.as_bytes())
        .map_err(|_| FormatError::NotBase64)
}

fn parse_json_lenient(json: &str) -> FormatResult<Value> {
    match serde_json::from_str::<Value>(json) {
        Ok(value) => Ok(value),
        Err(_) if json.contains('%') => {
            let unescaped =
                crate::totp::percent_decode(json).map_err(|_| FormatError::NotJson)?;
            debug!("Decoded legacy percent-encoded backup payload");
            serde_json::from_str(&unescaped).map_err(|_| FormatError::NotJson)
        }
        Err(_) => Err(FormatError::NotJson),
    }
}

/// Strict schema check of a parsed payload.
///
/// When `require_id` is false an entry without an id receives a fresh one.
fn validate_records(value: Value, require_id: bool) -> FormatResult<Vec<SecretRecord>> {
    let items = match value {
        Value::Array(items) => items,
        _ => return Err(FormatError::NotAnArray),
    };
    if items.is_empty() {
        return Err(FormatError::NoEntries);
    }

    // A repeated id keeps the first position and the last entry's values.
    let mut records: Vec<SecretRecord> = Vec::with_capacity(items.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    for (index, item) in items.into_iter().enumerate() {
        let record = validate_entry(index, item, require_id)?;
        match positions.get(&record.id) {
            Some(&at) => {
                debug!("Entry {} repeats id {}, later entry wins", index, record.id);
                records[at] = record;
            }
            None => {
                positions.insert(record.id.clone(), records.len());
                records.push(record);
            }
        }
    }
    Ok(records)
}

fn validate_entry(index: usize, item: Value, require_id: bool) -> FormatResult<SecretRecord> {
    let invalid = |reason: &str| FormatError::InvalidEntry {
        index,
        reason: reason.to_string(),
    };

    let object = match item {
        Value::Object(map) => map,
        _ => return Err(invalid("not an object")),
    };

    let required_text = |field: &str| -> FormatResult<String> {
        match object.get(field) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::String(_)) | None | Some(Value::Null) => {
                Err(invalid(&format!("missing {}", field)))
            }
            Some(_) => Err(invalid(&format!("{} must be a string", field))),
        }
    };

    let secret = required_text("secret")?;
    let title = required_text("title")?;

    let id = match object.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) if !require_id => n.to_string(),
        None | Some(Value::Null) | Some(Value::String(_)) if require_id => {
            return Err(invalid("missing id"))
        }
        None | Some(Value::Null) | Some(Value::String(_)) => next_id(),
        Some(_) => return Err(invalid("id must be a string")),
    };

    let description = match object.get("description") {
        Some(Value::String(s)) => s.clone(),
        None | Some(Value::Null) => String::new(),
        Some(_) => return Err(invalid("description must be a string")),
    };

    let order = match object.get("order") {
        None | Some(Value::Null) => 0,
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(_) => return Err(invalid("order must be a number")),
    };

    Ok(SecretRecord {
        id,
        secret,
        title,
        description,
        order,
    })
}

/// Snapshot every record in the store, sorted by display order.
///
/// Records that fail to load are logged and left out.
pub async fn export_records(store: &dyn SecretStore) -> Result<Vec<SecretRecord>> {
    let ids = store.list_ids().await?;
    let mut records = Vec::with_capacity(ids.len());

    for id in ids {
        match store.get(&id).await {
            Ok(Some(record)) => records.push(record),
            Ok(None) => debug!("Secret {} vanished during export", id),
            Err(e) => warn!("Skipping secret {} during export: {}", id, e),
        }
    }

    records.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| compare_ids(&a.id, &b.id)));
    info!("Exported {} secrets", records.len());
    Ok(records)
}

/// Upsert every record keyed by its own id and return how many were written.
///
/// Records sharing an id overwrite each other in turn; payloads coming from
/// [`decode`] or [`parse_config_json`] never repeat an id.
pub async fn import_data(store: &dyn SecretStore, records: &[SecretRecord]) -> usize {
    let mut imported = 0;

    for record in records {
        match store.put(&record.id, record).await {
            Ok(()) => imported += 1,
            Err(e) => warn!("Failed to import secret {} ({}): {}", record.id, record.title, e),
        }
    }

    info!("Imported {} of {} secrets", imported, records.len());
    imported
}

/// Pretty JSON rendering used for config file backups.
pub fn export_config_json(records: &[SecretRecord]) -> String {
    serde_json::to_string_pretty(records).unwrap_or_else(|_| "[]".to_string())
}

/// File name for a config backup taken at `now`.
pub fn config_file_name(now: DateTime<Utc>) -> String {
    format!("2fa-config-{}.json", now.format("%Y-%m-%dT%H-%M-%S"))
}

/// Parse a config file. Every entry must carry an id.
pub fn parse_config_json(text: &str) -> FormatResult<Vec<SecretRecord>> {
    let text = text.trim_start_matches(UTF8_BOM).trim();
    if text.is_empty() {
        return Err(FormatError::Empty);
    }
    let value: Value = serde_json::from_str(text).map_err(|_| FormatError::NotJson)?;
    validate_records(value, true)
}

/// Write a config backup into `dir` and return the created path.
pub fn write_config_file(
    dir: &Path,
    records: &[SecretRecord],
    now: DateTime<Utc>,
) -> Result<std::path::PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(config_file_name(now));
    let mut content = String::new();
    content.push(UTF8_BOM);
    content.push_str(&export_config_json(records));
    std::fs::write(&path, content)?;
    info!("Wrote config backup to {}", path.display());
    Ok(path)
}
