//! Record reconstruction: decode raw lines and demultiplex them into logical tables.
//!
//! Nested collections arrive already split into their own typed records that point at their
//! parent, so the job here is classification plus an explicit `id → table` edge index used to
//! resolve parent references. Nothing is flattened recursively.

use crate::config::OrphanPolicy;
use crate::error::ReconstructError;
use ahash::AHashMap;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Which fields of a record carry its identity, parent reference and type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordLayout {
    pub id_field: String,
    pub parent_field: String,
    /// Explicit type discriminator. When unset, the type comes from a global id
    /// (`gid://<namespace>/<Type>/<n>`) in `id_field`.
    pub type_field: Option<String>,
    /// Name of the foreign-key column added to child tables.
    pub foreign_key_column: String,
}

impl Default for RecordLayout {
    fn default() -> Self {
        Self {
            id_field: "id".into(),
            parent_field: "__parentId".into(),
            type_field: None,
            foreign_key_column: "parent_id".into(),
        }
    }
}

impl RecordLayout {
    pub fn with_id_field(mut self, f: impl Into<String>) -> Self {
        self.id_field = f.into();
        self
    }
    pub fn with_parent_field(mut self, f: impl Into<String>) -> Self {
        self.parent_field = f.into();
        self
    }
    pub fn with_type_field(mut self, f: impl Into<String>) -> Self {
        self.type_field = Some(f.into());
        self
    }
    pub fn with_foreign_key_column(mut self, c: impl Into<String>) -> Self {
        self.foreign_key_column = c.into();
        self
    }

    /// Decode one line. `line_no` is only used for error messages.
    pub fn decode(&self, line: &str, line_no: u64) -> Result<RawRecord, ReconstructError> {
        let val: Value = serde_json::from_str(line)
            .map_err(|e| ReconstructError::Decode { line: line_no, message: e.to_string() })?;
        let Value::Object(mut fields) = val else {
            return Err(ReconstructError::Decode { line: line_no, message: "expected a JSON object".into() });
        };

        let parent = fields.remove(&self.parent_field).filter(|v| !v.is_null());
        let type_tag = match &self.type_field {
            Some(tf) => match fields.remove(tf) {
                Some(Value::String(s)) if !s.trim().is_empty() => s,
                _ => return Err(ReconstructError::Unclassified { line: line_no }),
            },
            None => fields
                .get(&self.id_field)
                .and_then(Value::as_str)
                .and_then(gid_type)
                .ok_or(ReconstructError::Unclassified { line: line_no })?,
        };
        let id_value = fields.get(&self.id_field).filter(|v| !v.is_null()).cloned();
        let parent_id = match &parent {
            Some(v) => Some(key_text(v).ok_or_else(|| ReconstructError::Decode {
                line: line_no,
                message: format!("{} is not an identifier: {v}", self.parent_field),
            })?),
            None => None,
        };

        Ok(RawRecord {
            id: id_value.as_ref().and_then(key_text),
            id_value,
            parent_id,
            parent_value: parent,
            parent_table: None,
            type_tag,
            fields,
        })
    }
}

fn gid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^gid://[^/]+/([A-Za-z][A-Za-z0-9_]*)/").expect("static regex"))
}

/// `gid://shop/ProductVariant/42` → `ProductVariant`.
pub fn gid_type(id: &str) -> Option<String> {
    gid_re().captures(id).map(|c| c[1].to_string())
}

/// Text form of an identifier used for edge lookups; numbers and strings only.
fn key_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// One decoded record from the result stream.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRecord {
    pub type_tag: String,
    pub id: Option<String>,
    pub id_value: Option<Value>,
    pub parent_id: Option<String>,
    pub parent_value: Option<Value>,
    /// Table of the referenced parent; filled in by the reconstructor.
    pub parent_table: Option<String>,
    /// Everything except the parent reference and the type discriminator.
    pub fields: Map<String, Value>,
}

/// Demultiplexer with the parent edge index for one endpoint's stream.
pub struct Reconstructor {
    layout: RecordLayout,
    policy: OrphanPolicy,
    /// Tables each id has been seen in. Ids are only unique per type, so one id can
    /// name rows in several tables.
    seen: AHashMap<String, Vec<String>>,
    parent_of: AHashMap<String, String>,
    orphans: AHashMap<String, u64>,
    routed: u64,
    lines: u64,
}

impl Reconstructor {
    pub fn new(layout: RecordLayout, policy: OrphanPolicy) -> Self {
        Self {
            layout,
            policy,
            seen: AHashMap::with_capacity(64_000),
            parent_of: AHashMap::new(),
            orphans: AHashMap::new(),
            routed: 0,
            lines: 0,
        }
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    /// Decode and classify one line. `Ok(None)` means the record was a skipped orphan.
    pub fn route(&mut self, line: &str) -> Result<Option<RawRecord>, ReconstructError> {
        self.lines += 1;
        let rec = self.layout.decode(line, self.lines)?;
        self.route_record(rec)
    }

    pub fn route_record(&mut self, mut rec: RawRecord) -> Result<Option<RawRecord>, ReconstructError> {
        if let Some(pid) = rec.parent_id.as_deref() {
            let Some(parent_table) = self.resolve_parent(&rec.type_tag, pid) else {
                let err = ReconstructError::Orphan {
                    table: rec.type_tag.clone(),
                    id: rec.id.clone(),
                    parent_id: pid.to_string(),
                };
                return match self.policy {
                    OrphanPolicy::FailFast => Err(err),
                    OrphanPolicy::SkipAndCount => {
                        tracing::debug!("{err}; skipping");
                        *self.orphans.entry(rec.type_tag).or_insert(0) += 1;
                        Ok(None)
                    }
                };
            };
            match self.parent_of.get(&rec.type_tag) {
                Some(first) if *first != parent_table => {
                    return Err(ReconstructError::ParentConflict {
                        table: rec.type_tag.clone(),
                        first: first.clone(),
                        second: parent_table,
                    });
                }
                Some(_) => {}
                None => {
                    self.parent_of.insert(rec.type_tag.clone(), parent_table.clone());
                }
            }
            rec.parent_table = Some(parent_table);
        }
        if let Some(id) = &rec.id {
            let tables = self.seen.entry(id.clone()).or_default();
            if !tables.contains(&rec.type_tag) {
                tables.push(rec.type_tag.clone());
            }
        }
        self.routed += 1;
        Ok(Some(rec))
    }

    /// Table of the row `pid` refers to. Once a type's parent table is known it is preferred;
    /// otherwise the earliest table other than the child's own wins.
    fn resolve_parent(&self, child: &str, pid: &str) -> Option<String> {
        let tables = self.seen.get(pid)?;
        if let Some(known) = self.parent_of.get(child) {
            if tables.contains(known) {
                return Some(known.clone());
            }
        }
        tables.iter().find(|t| t.as_str() != child).or_else(|| tables.first()).cloned()
    }

    pub fn records_routed(&self) -> u64 {
        self.routed
    }

    /// Skipped orphans per table, sorted by table name.
    pub fn orphans_skipped(&self) -> Vec<(String, u64)> {
        let mut v: Vec<(String, u64)> = self.orphans.iter().map(|(k, n)| (k.clone(), *n)).collect();
        v.sort();
        v
    }

    pub fn total_orphans(&self) -> u64 {
        self.orphans.values().sum()
    }
}
