//! Raw result archiving: every consumed line goes to a zstd JSONL file that `ReplayApi` can read.
//!
//! Lines are written to `<dir>/<endpoint>.jsonl.zst.tmp` and promoted to `<endpoint>.jsonl.zst` only
//! by `commit`, so an interrupted stream never leaves a truncated archive behind.

use crate::util::{create_with_backoff, normalize_name, remove_with_backoff, replace_file_atomic_backoff};
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use zstd::stream::write::Encoder;

pub struct RawArchive {
    tmp: PathBuf,
    dest: PathBuf,
    enc: Option<Encoder<'static, BufWriter<File>>>,
    lines: u64,
}

impl RawArchive {
    pub fn create(dir: &Path, endpoint: &str, write_buf: usize) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create archive dir {}", dir.display()))?;
        let stem = normalize_name(endpoint);
        let dest = dir.join(format!("{stem}.jsonl.zst"));
        let tmp = dir.join(format!("{stem}.jsonl.zst.tmp"));
        let file = create_with_backoff(&tmp, 16, 50).with_context(|| format!("create {}", tmp.display()))?;
        let mut enc = Encoder::new(BufWriter::with_capacity(write_buf, file), 3)?;
        enc.include_checksum(true)?;
        Ok(Self { tmp, dest, enc: Some(enc), lines: 0 })
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        let enc = self.enc.as_mut().context("archive already committed")?;
        enc.write_all(line.as_bytes())?;
        enc.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Finish the zstd frame and move the archive into place.
    pub fn commit(mut self) -> Result<PathBuf> {
        let enc = self.enc.take().context("archive already committed")?;
        enc.finish()?.flush()?;
        replace_file_atomic_backoff(&self.tmp, &self.dest)
            .with_context(|| format!("promote {}", self.dest.display()))?;
        tracing::info!("Archived {} raw lines to {}", self.lines, self.dest.display());
        Ok(self.dest.clone())
    }
}

impl Drop for RawArchive {
    fn drop(&mut self) {
        if self.enc.take().is_some() {
            if let Err(e) = remove_with_backoff(&self.tmp, 4, 25) {
                tracing::warn!("Could not remove partial archive: {e:#}");
            }
        }
    }
}
