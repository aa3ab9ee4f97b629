//! Table materializer: per-table row buffers under a growing schema, with disk spill.
//!
//! Rows keep the values for the columns known when they were appended. Columns only ever grow,
//! so a row's cells keep their positions and finalize pads the short ones with NULL. Nothing is
//! handed out before `finalize`; to bound memory, full buffers are spilled to a zstd run in the
//! work directory and streamed back, re-projected, when the finalized table is read.

use crate::error::{KeyKind, MaterializeError};
use crate::mem::is_low_memory;
use crate::reconstruct::{RawRecord, RecordLayout};
use crate::schema::{coerce, InferredType, TableSchema};
use crate::util::{create_with_backoff, normalize_name, open_with_backoff, remove_with_backoff};
use ahash::AHashMap;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use zstd::stream::read::Decoder;
use zstd::stream::write::Encoder;

/// Under memory pressure, spill once at least this many rows are buffered.
const MIN_PRESSURE_SPILL_ROWS: usize = 1024;

/// Where and when buffered rows go to disk.
#[derive(Clone, Debug)]
pub struct SpillConfig {
    pub dir: PathBuf,
    pub threshold: usize,
    pub low_memory_fraction: f64,
    pub read_buf_bytes: usize,
    pub write_buf_bytes: usize,
}

impl SpillConfig {
    pub fn new(dir: impl AsRef<Path>, threshold: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            threshold: threshold.max(1),
            low_memory_fraction: 0.0,
            read_buf_bytes: 256 * 1024,
            write_buf_bytes: 256 * 1024,
        }
    }
    pub fn with_low_memory_fraction(mut self, frac: f64) -> Self {
        self.low_memory_fraction = frac;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: InferredType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub column: String,
    pub parent_table: String,
}

struct SpillWriter {
    path: PathBuf,
    enc: Option<Encoder<'static, BufWriter<File>>>,
    keep: bool,
}

impl SpillWriter {
    fn create(path: PathBuf, write_buf: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let f = create_with_backoff(&path, 16, 50)?;
        let enc = Encoder::new(BufWriter::with_capacity(write_buf, f), 3)?;
        Ok(Self { path, enc: Some(enc), keep: false })
    }

    fn write_rows(&mut self, rows: &[Vec<Value>]) -> io::Result<()> {
        let Some(enc) = self.enc.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "spill already finished"));
        };
        for row in rows {
            serde_json::to_writer(&mut *enc, row)?;
            enc.write_all(b"\n")?;
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<PathBuf> {
        if let Some(enc) = self.enc.take() {
            enc.finish()?.flush()?;
        }
        self.keep = true;
        Ok(self.path.clone())
    }
}

impl Drop for SpillWriter {
    fn drop(&mut self) {
        if !self.keep {
            drop(self.enc.take());
            let _ = remove_with_backoff(&self.path, 4, 25);
        }
    }
}

/// Per-table context: schema, keys, buffered rows, spill state.
struct TableContext {
    name: String,
    seq: usize,
    schema: TableSchema,
    primary_key: String,
    foreign_key: Option<ForeignKey>,
    rows: Vec<Vec<Value>>,
    row_count: u64,
    spilled_rows: u64,
    spill: Option<SpillWriter>,
    failed: Option<MaterializeError>,
    fk_shadow_warned: bool,
}

impl TableContext {
    fn new(name: &str, seq: usize, primary_key: &str) -> Self {
        let mut schema = TableSchema::new();
        schema.ensure_column(primary_key);
        Self {
            name: name.to_string(),
            seq,
            schema,
            primary_key: primary_key.to_string(),
            foreign_key: None,
            rows: Vec::new(),
            row_count: 0,
            spilled_rows: 0,
            spill: None,
            failed: None,
            fk_shadow_warned: false,
        }
    }

    fn fail(&mut self, err: MaterializeError) -> MaterializeError {
        tracing::warn!("{err}; table {} will not be emitted", self.name);
        self.rows = Vec::new();
        self.spill = None;
        self.failed = Some(err.clone());
        err
    }

    fn missing(&mut self, key: KeyKind) -> MaterializeError {
        let err = MaterializeError::MissingKey { table: self.name.clone(), key, row: self.row_count };
        self.fail(err)
    }

    fn spill_buffered(&mut self, cfg: &SpillConfig) -> Result<(), MaterializeError> {
        if self.rows.is_empty() {
            return Ok(());
        }
        if self.spill.is_none() {
            let path = cfg.dir.join(format!("{:04}_{}.spill.zst", self.seq, normalize_name(&self.name)));
            let w = SpillWriter::create(path, cfg.write_buf_bytes)
                .map_err(|e| MaterializeError::Spill { table: self.name.clone(), message: e.to_string() })?;
            self.spill = Some(w);
        }
        if let Some(w) = self.spill.as_mut() {
            w.write_rows(&self.rows)
                .map_err(|e| MaterializeError::Spill { table: self.name.clone(), message: e.to_string() })?;
        }
        tracing::debug!("Spilled {} rows of table {}", self.rows.len(), self.name);
        self.spilled_rows += self.rows.len() as u64;
        self.rows.clear();
        Ok(())
    }
}

fn context_for<'t>(
    tables: &'t mut AHashMap<String, TableContext>,
    order: &mut Vec<String>,
    next_seq: &mut usize,
    id_field: &str,
    table: &str,
) -> &'t mut TableContext {
    tables.entry(table.to_string()).or_insert_with(|| {
        order.push(table.to_string());
        *next_seq += 1;
        TableContext::new(table, *next_seq - 1, id_field)
    })
}

/// Owns every table context of one endpoint pipeline.
pub struct TableMaterializer {
    layout: RecordLayout,
    spill: SpillConfig,
    tables: AHashMap<String, TableContext>,
    order: Vec<String>,
    next_seq: usize,
}

impl TableMaterializer {
    pub fn new(layout: RecordLayout, spill: SpillConfig) -> Self {
        Self { layout, spill, tables: AHashMap::new(), order: Vec::new(), next_seq: 0 }
    }

    fn context(&mut self, table: &str) -> &mut TableContext {
        context_for(&mut self.tables, &mut self.order, &mut self.next_seq, &self.layout.id_field, table)
    }

    /// Widen `column` of `table` by `value`.
    pub fn observe(&mut self, table: &str, column: &str, value: &Value) -> InferredType {
        self.context(table).schema.observe(column, value)
    }

    /// Table names in first-seen order.
    pub fn table_names(&self) -> &[String] {
        &self.order
    }

    /// Current (not yet final) type of a column.
    pub fn column_type(&self, table: &str, column: &str) -> Option<InferredType> {
        self.tables.get(table).and_then(|t| t.schema.type_of(column))
    }

    /// Add one record as a row of `table`. An error means the table is now failed;
    /// later records for it are dropped and `finalize` reports the same error.
    pub fn append(&mut self, table: &str, record: RawRecord) -> Result<(), MaterializeError> {
        let fk_column = self.layout.foreign_key_column.as_str();
        let cfg = &self.spill;
        let ctx = context_for(&mut self.tables, &mut self.order, &mut self.next_seq, &self.layout.id_field, table);
        if ctx.failed.is_some() {
            return Ok(());
        }

        let Some(id_value) = record.id.as_ref().and(record.id_value) else {
            return Err(ctx.missing(KeyKind::Primary));
        };

        match (record.parent_table, ctx.foreign_key.is_some()) {
            (Some(parent_table), false) => {
                if ctx.row_count > 0 {
                    return Err(ctx.missing(KeyKind::Foreign));
                }
                ctx.schema.ensure_column(fk_column);
                ctx.foreign_key = Some(ForeignKey { column: fk_column.to_string(), parent_table });
            }
            (None, true) => return Err(ctx.missing(KeyKind::Foreign)),
            _ => {}
        }

        let mut row = vec![Value::Null; ctx.schema.len()];
        ctx.schema.observe(&ctx.primary_key, &id_value);
        row[0] = id_value;
        if ctx.foreign_key.is_some() {
            let parent_value = record.parent_value.unwrap_or(Value::Null);
            ctx.schema.observe(fk_column, &parent_value);
            if let Some(i) = ctx.schema.index_of(fk_column) {
                row[i] = parent_value;
            }
        }

        for (k, v) in record.fields {
            if k == ctx.primary_key {
                continue;
            }
            if ctx.foreign_key.is_some() && k == fk_column {
                if !ctx.fk_shadow_warned {
                    tracing::warn!(
                        "table {}: field {k} has the foreign-key column's name; keeping the parent reference",
                        ctx.name
                    );
                    ctx.fk_shadow_warned = true;
                }
                continue;
            }
            ctx.schema.observe(&k, &v);
            let Some(i) = ctx.schema.index_of(&k) else { continue };
            if i >= row.len() {
                row.resize(i + 1, Value::Null);
            }
            row[i] = v;
        }

        ctx.rows.push(row);
        ctx.row_count += 1;

        let buffered = ctx.rows.len();
        let pressure = buffered >= MIN_PRESSURE_SPILL_ROWS
            && buffered % 256 == 0
            && is_low_memory(cfg.low_memory_fraction);
        if buffered >= cfg.threshold || pressure {
            if let Err(e) = ctx.spill_buffered(cfg) {
                return Err(ctx.fail(e));
            }
        }
        Ok(())
    }

    /// Close `table` and produce its immutable result.
    pub fn finalize(&mut self, table: &str) -> Result<FinalizedTable, MaterializeError> {
        let Some(mut ctx) = self.tables.remove(table) else {
            return Err(MaterializeError::UnknownTable(table.to_string()));
        };
        self.order.retain(|t| t != table);
        if let Some(err) = ctx.failed.take() {
            return Err(err);
        }
        let spill_path = match ctx.spill.as_mut() {
            Some(w) => Some(
                w.finish().map_err(|e| MaterializeError::Spill { table: ctx.name.clone(), message: e.to_string() })?,
            ),
            None => None,
        };
        let columns = ctx
            .schema
            .columns()
            .iter()
            .map(|(name, ty)| Column { name: name.clone(), ty: *ty })
            .collect();
        tracing::debug!(
            "Finalized table {}: {} rows ({} spilled)",
            ctx.name,
            ctx.row_count,
            ctx.spilled_rows
        );
        Ok(FinalizedTable {
            name: ctx.name.clone(),
            columns,
            primary_key: ctx.primary_key.clone(),
            foreign_key: ctx.foreign_key.take(),
            row_count: ctx.row_count,
            spill_path,
            tail: std::mem::take(&mut ctx.rows),
            read_buf_bytes: self.spill.read_buf_bytes,
        })
    }

    /// Finalize every table in first-seen order (parents before their children).
    pub fn finalize_all(&mut self) -> Vec<(String, Result<FinalizedTable, MaterializeError>)> {
        let names = self.order.clone();
        names
            .into_iter()
            .map(|n| {
                let res = self.finalize(&n);
                (n, res)
            })
            .collect()
    }
}

/// Immutable, fully typed table ready for a sink.
pub struct FinalizedTable {
    name: String,
    columns: Vec<Column>,
    primary_key: String,
    foreign_key: Option<ForeignKey>,
    row_count: u64,
    spill_path: Option<PathBuf>,
    tail: Vec<Vec<Value>>,
    read_buf_bytes: usize,
}

impl std::fmt::Debug for FinalizedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizedTable")
            .field("name", &self.name)
            .field("columns", &self.columns)
            .field("primary_key", &self.primary_key)
            .field("foreign_key", &self.foreign_key)
            .field("row_count", &self.row_count)
            .finish()
    }
}

impl FinalizedTable {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }
    pub fn foreign_key(&self) -> Option<&ForeignKey> {
        self.foreign_key.as_ref()
    }
    pub fn row_count(&self) -> u64 {
        self.row_count
    }
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
    pub fn column_type(&self, name: &str) -> Option<InferredType> {
        self.columns.iter().find(|c| c.name == name).map(|c| c.ty)
    }

    /// Every row over the final column set, spilled rows first, cells coerced to column types.
    pub fn rows(&self) -> RowIter<'_> {
        let mut pending_err = None;
        let spill = match &self.spill_path {
            Some(p) => match open_spill(p, self.read_buf_bytes) {
                Ok(lines) => Some(lines),
                Err(e) => {
                    pending_err = Some(self.spill_error(e));
                    None
                }
            },
            None => None,
        };
        RowIter { table: self, spill, tail_pos: 0, pending_err, done: false }
    }

    pub fn collect_rows(&self) -> Result<Vec<Vec<Value>>, MaterializeError> {
        self.rows().collect()
    }

    fn project(&self, raw: &[Value]) -> Vec<Value> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, c)| raw.get(i).map(|v| coerce(v, c.ty)).unwrap_or(Value::Null))
            .collect()
    }

    fn spill_error(&self, e: impl std::fmt::Display) -> MaterializeError {
        MaterializeError::Spill { table: self.name.clone(), message: e.to_string() }
    }
}

impl Drop for FinalizedTable {
    fn drop(&mut self) {
        if let Some(p) = self.spill_path.take() {
            if let Err(e) = remove_with_backoff(&p, 4, 25) {
                tracing::warn!("Could not remove spill file: {e:#}");
            }
        }
    }
}

type SpillLines = Lines<BufReader<Decoder<'static, BufReader<File>>>>;

fn open_spill(path: &Path, read_buf: usize) -> io::Result<SpillLines> {
    let f = open_with_backoff(path, 16, 50)?;
    let dec = Decoder::new(f)?;
    Ok(BufReader::with_capacity(read_buf, dec).lines())
}

pub struct RowIter<'a> {
    table: &'a FinalizedTable,
    spill: Option<SpillLines>,
    tail_pos: usize,
    pending_err: Option<MaterializeError>,
    done: bool,
}

impl Iterator for RowIter<'_> {
    type Item = Result<Vec<Value>, MaterializeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(e) = self.pending_err.take() {
            self.done = true;
            return Some(Err(e));
        }
        while let Some(lines) = self.spill.as_mut() {
            match lines.next() {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => {
                    return match serde_json::from_str::<Vec<Value>>(&line) {
                        Ok(raw) => Some(Ok(self.table.project(&raw))),
                        Err(e) => {
                            self.done = true;
                            Some(Err(self.table.spill_error(e)))
                        }
                    };
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(self.table.spill_error(e)));
                }
                None => self.spill = None,
            }
        }
        let raw = self.table.tail.get(self.tail_pos)?;
        self.tail_pos += 1;
        Some(Ok(self.table.project(raw)))
    }
}
