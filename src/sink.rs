//! Sink boundary: where finalized tables go.

use crate::materialize::{Column, FinalizedTable, ForeignKey};
use crate::util::{create_with_backoff, normalize_name, replace_file_atomic_backoff};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Receives each finalized table once. Shared by every endpoint pipeline.
pub trait TableSink: Send + Sync {
    fn accept(&self, endpoint: &str, table: &FinalizedTable) -> Result<()>;
}

/// Owned copy of a finalized table.
#[derive(Clone, Debug, PartialEq)]
pub struct TableSnapshot {
    pub endpoint: String,
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: String,
    pub foreign_key: Option<ForeignKey>,
    pub rows: Vec<Vec<Value>>,
}

impl TableSnapshot {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Cell of `row` in column `name`.
    pub fn cell(&self, row: usize, name: &str) -> Option<&Value> {
        let i = self.column_index(name)?;
        self.rows.get(row)?.get(i)
    }
}

/// Collects snapshots in memory.
#[derive(Default)]
pub struct MemorySink {
    tables: Mutex<Vec<TableSnapshot>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tables(&self) -> Vec<TableSnapshot> {
        self.tables.lock().clone()
    }

    pub fn table(&self, endpoint: &str, name: &str) -> Option<TableSnapshot> {
        self.tables.lock().iter().find(|t| t.endpoint == endpoint && t.name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TableSink for MemorySink {
    fn accept(&self, endpoint: &str, table: &FinalizedTable) -> Result<()> {
        let snap = TableSnapshot {
            endpoint: endpoint.to_string(),
            name: table.name().to_string(),
            columns: table.columns().to_vec(),
            primary_key: table.primary_key().to_string(),
            foreign_key: table.foreign_key().cloned(),
            rows: table.collect_rows()?,
        };
        self.tables.lock().push(snap);
        Ok(())
    }
}

#[derive(Serialize)]
struct TableManifest<'a> {
    name: &'a str,
    primary_key: &'a str,
    foreign_key: Option<&'a ForeignKey>,
    columns: &'a [Column],
    row_count: u64,
}

/// Writes `<dir>/<endpoint>/<table>.jsonl` plus `<table>.manifest.json`.
pub struct JsonlSink {
    dir: PathBuf,
    write_buf: usize,
}

impl JsonlSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf(), write_buf: 256 * 1024 }
    }

    pub fn with_write_buffer(mut self, bytes: usize) -> Self {
        self.write_buf = bytes.max(4096);
        self
    }

    pub fn table_path(&self, endpoint: &str, table: &str) -> PathBuf {
        self.dir.join(normalize_name(endpoint)).join(format!("{}.jsonl", normalize_name(table)))
    }

    pub fn manifest_path(&self, endpoint: &str, table: &str) -> PathBuf {
        self.dir.join(normalize_name(endpoint)).join(format!("{}.manifest.json", normalize_name(table)))
    }

    fn write_atomic(&self, dest: &Path, body: impl FnOnce(&mut BufWriter<fs::File>) -> Result<()>) -> Result<()> {
        let tmp = dest.with_extension("tmp");
        let file = create_with_backoff(&tmp, 16, 50).with_context(|| format!("create {}", tmp.display()))?;
        let mut w = BufWriter::with_capacity(self.write_buf, file);
        body(&mut w)?;
        w.flush()?;
        drop(w);
        replace_file_atomic_backoff(&tmp, dest)
    }
}

impl TableSink for JsonlSink {
    fn accept(&self, endpoint: &str, table: &FinalizedTable) -> Result<()> {
        let data = self.table_path(endpoint, table.name());
        if let Some(parent) = data.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }

        self.write_atomic(&data, |w| {
            for row in table.rows() {
                let row = row?;
                let obj: Map<String, Value> =
                    table.columns().iter().map(|c| c.name.clone()).zip(row).collect();
                serde_json::to_writer(&mut *w, &obj)?;
                w.write_all(b"\n")?;
            }
            Ok(())
        })?;

        let manifest = TableManifest {
            name: table.name(),
            primary_key: table.primary_key(),
            foreign_key: table.foreign_key(),
            columns: table.columns(),
            row_count: table.row_count(),
        };
        self.write_atomic(&self.manifest_path(endpoint, table.name()), |w| {
            serde_json::to_writer_pretty(&mut *w, &manifest)?;
            w.write_all(b"\n")?;
            Ok(())
        })?;
        tracing::debug!("Wrote table {} of {} ({} rows)", table.name(), endpoint, table.row_count());
        Ok(())
    }
}
