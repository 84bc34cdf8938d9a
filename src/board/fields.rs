//! Conversion of raw JSON field values into typed [`FieldValue`]s, checked
//! against a project type's active [`FieldConfig`] entries.
//!
//! Known fields are converted according to their declared type. Keys with no
//! active configuration are tolerated; their type is inferred from the JSON
//! scalar. A JSON `null` or a blank string means "no value".

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate};
use serde_json::Value;

use super::models::{FieldConfig, FieldType, FieldValue};
use crate::errors::BoardError;

/// The active fields of one project type, keyed by storage name.
pub struct FieldSchema<'a> {
    fields: BTreeMap<&'a str, &'a FieldConfig>,
}

/// A single per-key difference produced by [`FieldSchema::diff`].
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub old: Option<FieldValue>,
    pub new: Option<FieldValue>,
}

impl<'a> FieldSchema<'a> {
    /// Build a schema from field configs; inactive entries are ignored.
    pub fn new(configs: &'a [FieldConfig]) -> Self {
        let fields = configs
            .iter()
            .filter(|c| c.active)
            .map(|c| (c.field_name.as_str(), c))
            .collect();
        Self { fields }
    }

    pub fn get(&self, field_name: &str) -> Option<&'a FieldConfig> {
        self.fields.get(field_name).copied()
    }

    /// Convert one raw value. `Ok(None)` means the key carries no value.
    pub fn convert(&self, key: &str, raw: &Value) -> Result<Option<FieldValue>, BoardError> {
        match self.get(key) {
            Some(config) => convert_value(config, raw),
            None => infer_value(key, raw),
        }
    }

    /// Validate the initial field bag of a new ticket.
    ///
    /// Every required active field must carry a value.
    pub fn validate_new(
        &self,
        raw: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, FieldValue>, BoardError> {
        let mut values = BTreeMap::new();
        for (key, value) in raw {
            if let Some(v) = self.convert(key, value)? {
                values.insert(key.clone(), v);
            }
        }
        for config in self.fields.values() {
            if config.required && !values.contains_key(&config.field_name) {
                return Err(BoardError::validation(format!(
                    "Field '{}' is required",
                    config.label
                )));
            }
        }
        Ok(values)
    }

    /// Compute the per-key changes `raw` would make to `current`.
    ///
    /// Keys whose converted value equals the stored one produce no change.
    /// Clearing a required field is rejected. Nothing is applied here, so a
    /// failure leaves the ticket untouched.
    pub fn diff(
        &self,
        current: &BTreeMap<String, FieldValue>,
        raw: &BTreeMap<String, Value>,
    ) -> Result<Vec<FieldChange>, BoardError> {
        let mut changes = Vec::new();
        for (key, value) in raw {
            let new = self.convert(key, value)?;
            if new.is_none()
                && let Some(config) = self.get(key)
                && config.required
            {
                return Err(BoardError::validation(format!(
                    "Field '{}' is required and cannot be cleared",
                    config.label
                )));
            }
            let old = current.get(key).cloned();
            if old != new {
                changes.push(FieldChange {
                    field: key.clone(),
                    old,
                    new,
                });
            }
        }
        Ok(changes)
    }

    /// Whether `query` (already lowercased) occurs in any searchable field value.
    pub fn matches_searchable(&self, values: &BTreeMap<String, FieldValue>, query: &str) -> bool {
        self.fields
            .values()
            .filter(|c| c.searchable)
            .filter_map(|c| values.get(&c.field_name))
            .any(|v| v.display().to_lowercase().contains(query))
    }
}

/// Convert a raw value according to the field's declared type.
pub fn convert_value(config: &FieldConfig, raw: &Value) -> Result<Option<FieldValue>, BoardError> {
    let mismatch = || {
        BoardError::validation(format!(
            "Field '{}' expects a {} value, got {}",
            config.label, config.field_type, raw
        ))
    };
    if is_blank(raw) {
        return Ok(None);
    }
    let value = match config.field_type {
        FieldType::Text | FieldType::LongText => match raw {
            Value::String(s) => FieldValue::Text(s.clone()),
            _ => return Err(mismatch()),
        },
        FieldType::Number => match raw {
            Value::Number(n) => FieldValue::Number(finite(n.as_f64()).ok_or_else(mismatch)?),
            Value::String(s) => FieldValue::Number(finite(s.trim().parse().ok()).ok_or_else(mismatch)?),
            _ => return Err(mismatch()),
        },
        FieldType::Date => match raw {
            Value::String(s) => FieldValue::Date(parse_date(s).ok_or_else(mismatch)?),
            _ => return Err(mismatch()),
        },
        FieldType::Checkbox => match raw {
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::String(s) if s == "true" => FieldValue::Bool(true),
            Value::String(s) if s == "false" => FieldValue::Bool(false),
            _ => return Err(mismatch()),
        },
        FieldType::Dropdown => match raw {
            Value::String(s) if config.options.iter().any(|o| &o.value == s) => {
                FieldValue::Choice(s.clone())
            }
            Value::String(s) => {
                return Err(BoardError::validation(format!(
                    "'{}' is not an option of field '{}'",
                    s, config.label
                )));
            }
            _ => return Err(mismatch()),
        },
    };
    Ok(Some(value))
}

/// Infer the type of a value for a key with no active configuration.
pub fn infer_value(key: &str, raw: &Value) -> Result<Option<FieldValue>, BoardError> {
    if is_blank(raw) {
        return Ok(None);
    }
    match raw {
        Value::String(s) => Ok(Some(FieldValue::Text(s.clone()))),
        Value::Bool(b) => Ok(Some(FieldValue::Bool(*b))),
        Value::Number(n) => finite(n.as_f64())
            .map(|f| Some(FieldValue::Number(f)))
            .ok_or_else(|| BoardError::validation(format!("Field '{}' has an unsupported number", key))),
        _ => Err(BoardError::validation(format!(
            "Field '{}' must be a text, number or boolean value",
            key
        ))),
    }
}

/// NaN and infinities have no JSON form, so they are never stored.
fn finite(n: Option<f64>) -> Option<f64> {
    n.filter(|f| f.is_finite())
}

fn is_blank(raw: &Value) -> bool {
    match raw {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp (date part kept).
fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
}

/// Check a field definition before it is stored.
pub fn validate_definition(config: &FieldConfig) -> Result<(), BoardError> {
    if config.label.trim().is_empty() {
        return Err(BoardError::validation("Field label is required"));
    }
    if config.field_name.is_empty()
        || !config
            .field_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(BoardError::validation(format!(
            "Field name '{}' must be non-empty and use only letters, digits and '_'",
            config.field_name
        )));
    }
    match config.field_type {
        FieldType::Dropdown => {
            if config.options.is_empty() {
                return Err(BoardError::validation(format!(
                    "Dropdown field '{}' needs at least one option",
                    config.label
                )));
            }
            let mut seen = HashSet::new();
            for option in &config.options {
                if option.value.trim().is_empty() {
                    return Err(BoardError::validation("Dropdown option values cannot be blank"));
                }
                if !seen.insert(option.value.as_str()) {
                    return Err(BoardError::validation(format!(
                        "Dropdown option '{}' is listed more than once",
                        option.value
                    )));
                }
            }
        }
        _ if !config.options.is_empty() => {
            return Err(BoardError::validation(format!(
                "Only dropdown fields take options; '{}' is {}",
                config.label, config.field_type
            )));
        }
        _ => {}
    }
    Ok(())
}
