//! Free-form metadata entries stored as raw bytes.
//!
//! Values carry no type tag. Reads infer the type from the bytes, so the text
//! `"42"` comes back as the number 42 and a composite value comes back as its
//! JSON text.

use std::sync::{Arc, OnceLock};

use perch_storage::{Database, Row, SqlValue};
use regex::Regex;
use tracing::debug;

use crate::SettingsError;

#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Json(serde_json::Value),
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Text(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Number(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Number(value as f64)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<serde_json::Value> for MetaValue {
    fn from(value: serde_json::Value) -> Self {
        MetaValue::Json(value)
    }
}

pub fn encode(value: &MetaValue) -> Vec<u8> {
    match value {
        MetaValue::Text(text) => text.as_bytes().to_vec(),
        MetaValue::Number(number) => number.to_be_bytes().to_vec(),
        MetaValue::Bool(flag) => vec![u8::from(*flag)],
        MetaValue::Json(json) => json.to_string().into_bytes(),
    }
}

/// Best-effort decode. Returns `None` for bytes that are neither a known
/// binary form nor UTF-8.
pub fn decode(bytes: &[u8]) -> Option<MetaValue> {
    if let [flag @ (0 | 1)] = bytes {
        return Some(MetaValue::Bool(*flag == 1));
    }

    let text = std::str::from_utf8(bytes).ok();

    if bytes.len() == 8 && !text.is_some_and(is_printable) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        return Some(MetaValue::Number(f64::from_be_bytes(raw)));
    }

    let text = text?;
    let trimmed = text.trim();
    if numeric_pattern().is_match(trimmed) {
        if let Ok(number) = trimmed.parse::<f64>() {
            return Some(MetaValue::Number(number));
        }
    }
    match trimmed {
        "true" => Some(MetaValue::Bool(true)),
        "false" => Some(MetaValue::Bool(false)),
        _ => Some(MetaValue::Text(text.to_string())),
    }
}

fn is_printable(text: &str) -> bool {
    !text.chars().any(char::is_control)
}

fn numeric_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^-?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").expect("numeric pattern is valid")
    })
}

/// Key/value metadata backed by the `meta` table.
pub struct MetaStore<D: Database> {
    db: Arc<D>,
}

impl<D: Database> MetaStore<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self { db }
    }

    pub async fn get(&self, key: &str) -> Result<Option<MetaValue>, SettingsError> {
        let k = key.to_string();
        let rows: Vec<Row> = self
            .db
            .query("SELECT value FROM meta WHERE key = ?1", &[&k])
            .await?;

        let value = match rows.first().and_then(|row| row.get(0)) {
            Some(SqlValue::Blob(bytes)) => decode(bytes),
            Some(SqlValue::Text(text)) => decode(text.as_bytes()),
            _ => None,
        };
        if value.is_none() && !rows.is_empty() {
            debug!(key, "meta value could not be decoded");
        }
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: impl Into<MetaValue>) -> Result<(), SettingsError> {
        let k = key.to_string();
        let bytes = encode(&value.into());
        self.db
            .execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2) \
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                &[&k, &bytes],
            )
            .await?;
        Ok(())
    }

    /// Returns whether an entry was removed.
    pub async fn delete(&self, key: &str) -> Result<bool, SettingsError> {
        let k = key.to_string();
        let removed = self
            .db
            .execute("DELETE FROM meta WHERE key = ?1", &[&k])
            .await?;
        Ok(removed > 0)
    }

    /// Keys starting with `prefix`, in key order.
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>, SettingsError> {
        let rows: Vec<Row> = if prefix.is_empty() {
            self.db
                .query("SELECT key FROM meta ORDER BY key", &[])
                .await?
        } else {
            let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
            self.db
                .query(
                    "SELECT key FROM meta WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
                    &[&pattern],
                )
                .await?
        };

        Ok(rows
            .iter()
            .filter_map(|row| row.get(0).and_then(SqlValue::as_text))
            .map(str::to_string)
            .collect())
    }
}
