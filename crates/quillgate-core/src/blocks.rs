//! Structured block extraction.
//!
//! A block is a fenced region inside a section, for example
//!
//! ````text
//! ```data
//! {"sign": "Leo", "growth_index": 7}
//! ```
//! ````
//!
//! The strict path parses the fence body as a JSON object. When that fails
//! the extractor falls back to field-by-field recovery of `key: value` lines.
//! A block with no recoverable field is not attached; the failure is
//! returned as a [`SchemaError`] so the owning criterion can report it.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::profile::{BlockSchemaSpec, QualityProfile};
use crate::types::{Section, StructuredBlock};

lazy_static! {
    /// `key: value`, `"key": value` or `key = value`, one per line.
    static ref FIELD_LINE: Regex = Regex::new(
        r#"(?m)^[\s{,]*"?([\p{L}_][\p{L}\p{N}_]*)"?\s*[:=]\s*(.+?)\s*,?\s*$"#
    ).unwrap();
}

/// A structured block with zero recoverable fields.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Block '{schema_id}' in section '{section}': {reason}")]
pub struct SchemaError {
    pub section: String,
    pub schema_id: String,
    pub reason: String,
}

/// Finds and parses structured blocks inside sections.
pub struct StructuredBlockExtractor<'p> {
    profile: &'p QualityProfile,
}

impl<'p> StructuredBlockExtractor<'p> {
    pub fn new(profile: &'p QualityProfile) -> Self {
        Self { profile }
    }

    /// Extract blocks for every section that expects one.
    ///
    /// Attaches recovered blocks in place and returns the failures.
    pub fn extract_all(&self, sections: &mut [Section]) -> Vec<SchemaError> {
        sections
            .iter_mut()
            .filter_map(|section| self.extract(section).err())
            .collect()
    }

    /// Extract the block of a single section.
    ///
    /// Sections without a configured block are left untouched.
    pub fn extract(&self, section: &mut Section) -> Result<(), SchemaError> {
        section.structured_block = None;

        let Some(schema) = self.schema_for(section) else {
            return Ok(());
        };
        let name = section.label();

        let Some(content) = find_fence(section.body(), &self.profile.block_fence) else {
            return Err(SchemaError {
                section: name,
                schema_id: schema.id.clone(),
                reason: "no structured block found".to_string(),
            });
        };

        let mut fields: BTreeMap<String, JsonValue> = match serde_json::from_str::<JsonValue>(content) {
            Ok(JsonValue::Object(map)) => map.into_iter().collect(),
            _ => {
                tracing::debug!(section = %name, schema = %schema.id, "Strict block parse failed, recovering fields");
                recover_fields(content)
            }
        };
        fields.retain(|key, _| schema.fields.contains(key));

        let missing: Vec<String> = schema
            .fields
            .iter()
            .filter(|f| !fields.contains_key(*f))
            .cloned()
            .collect();

        if missing.len() == schema.fields.len() {
            return Err(SchemaError {
                section: name,
                schema_id: schema.id.clone(),
                reason: "no recoverable fields".to_string(),
            });
        }

        section.structured_block = Some(StructuredBlock {
            schema_id: schema.id.clone(),
            fields,
            partial: !missing.is_empty(),
            missing,
        });
        Ok(())
    }

    fn schema_for(&self, section: &Section) -> Option<&'p BlockSchemaSpec> {
        let spec = self.profile.section_spec(section.name.as_deref()?)?;
        self.profile.block_schema(spec.block.as_deref()?)
    }
}

/// Body of the first fence tagged with `fence` (or `json`).
///
/// An unterminated fence runs to the end of the text.
fn find_fence<'t>(text: &'t str, fence: &str) -> Option<&'t str> {
    let mut offset = 0;
    let mut open: Option<usize> = None;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if let Some(info) = trimmed.strip_prefix("```") {
            match open {
                None => {
                    let info = info.trim();
                    if info.eq_ignore_ascii_case(fence) || info.eq_ignore_ascii_case("json") {
                        open = Some(offset + line.len());
                    }
                }
                Some(start) => return Some(&text[start..offset]),
            }
        }
        offset += line.len();
    }

    open.map(|start| &text[start..])
}

/// Lenient line-based recovery.
fn recover_fields(content: &str) -> BTreeMap<String, JsonValue> {
    let mut fields = BTreeMap::new();

    for caps in FIELD_LINE.captures_iter(content) {
        let key = caps[1].to_string();
        let raw = caps[2].trim_end_matches(['}', ',']).trim();
        if raw.is_empty() {
            continue;
        }
        let value = serde_json::from_str::<JsonValue>(raw)
            .unwrap_or_else(|_| JsonValue::String(raw.trim_matches(['"', '\'']).to_string()));
        fields.entry(key).or_insert(value);
    }

    fields
}
