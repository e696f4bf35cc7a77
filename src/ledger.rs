//! Checkpoint ledger: the summary table and error log that make runs resumable.
//!
//! The summary CSV records every granule that produced rows; the error log
//! records every granule that failed. Both are re-read at startup, and both
//! file handles are owned by the [`OutputWriter`] returned from
//! [`Ledger::open`] so every write goes through one lock per file.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};

pub const GRANULE_COLUMN: &str = "granule";

/// Granules already known to have succeeded or failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecklistSets {
    pub processed: HashSet<String>,
    pub in_error: HashSet<String>,
}

impl ChecklistSets {
    /// Drops failed granules from `processed` so they are queued again.
    pub fn release_errors(&mut self) {
        for granule in &self.in_error {
            self.processed.remove(granule);
        }
    }
}

/// Opens the ledger files for a run.
pub struct Ledger;

impl Ledger {
    /// Loads prior state and opens both output files.
    ///
    /// `header` is written immediately when the summary file is new. Pass
    /// `None` when rows arrive as CSV blocks that carry their own header; the
    /// first block written then keeps its header line.
    pub fn open(
        summary_path: &Path,
        error_path: &Path,
        reprocess: bool,
        header: Option<&str>,
    ) -> Result<(ChecklistSets, OutputWriter)> {
        let mut sets = ChecklistSets::default();

        // a crash mid-write leaves a partial last row; cut it before reading
        if summary_path.is_file() {
            repair_torn_tail(summary_path)?;
        }
        let summary_exists = fs::metadata(summary_path)
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);

        let (summary_file, needs_header) = if summary_exists {
            sets.processed = read_summary_granules(summary_path)?;
            let file = OpenOptions::new()
                .append(true)
                .open(summary_path)
                .map_err(|e| Error::io(summary_path, e))?;
            (file, false)
        } else {
            let mut file = File::create(summary_path).map_err(|e| Error::io(summary_path, e))?;
            match header {
                Some(h) => {
                    writeln!(file, "{}", h)
                        .and_then(|_| file.flush())
                        .map_err(|e| Error::io(summary_path, e))?;
                    (file, false)
                }
                None => (file, true),
            }
        };

        if error_path.exists() {
            let text = fs::read_to_string(error_path).map_err(|e| Error::io(error_path, e))?;
            sets.in_error = text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
        }
        let error_file = File::create(error_path).map_err(|e| Error::io(error_path, e))?;

        let writer = OutputWriter {
            summary: Mutex::new(SummarySink {
                path: summary_path.to_path_buf(),
                out: BufWriter::new(summary_file),
                needs_header,
            }),
            errors: Mutex::new(ErrorSink {
                path: error_path.to_path_buf(),
                out: BufWriter::new(error_file),
            }),
        };

        if reprocess {
            sets.release_errors();
        } else {
            let mut carried: Vec<&String> = sets.in_error.iter().collect();
            carried.sort();
            for granule in carried {
                writer.record_error(granule)?;
            }
        }

        debug!(
            "Loaded ledger: {} processed, {} in error",
            sets.processed.len(),
            sets.in_error.len()
        );
        Ok((sets, writer))
    }
}

/// Drops an unterminated last row and every other row of its granule, so
/// the granule is queued again instead of being counted as processed.
fn repair_torn_tail(path: &Path) -> Result<()> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    if text.is_empty() || text.ends_with('\n') {
        return Ok(());
    }

    let cut = text.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let (kept, fragment) = text.split_at(cut);
    warn!("Dropping torn row {:?} from {:?}", fragment, path);

    let mut lines = kept.lines();
    let mut repaired = String::with_capacity(kept.len());
    if let Some(header) = lines.next() {
        repaired.push_str(header);
        repaired.push('\n');

        // granule of the torn row, when the fragment reaches that far
        let column = header.split(',').position(|h| h.trim() == GRANULE_COLUMN);
        let fragment_fields: Vec<&str> = fragment.split(',').collect();
        let torn = column
            .filter(|&c| c + 1 < fragment_fields.len())
            .map(|c| fragment_fields[c].trim());

        let mut dropped = 0usize;
        for line in lines {
            let granule = column.and_then(|c| line.split(',').nth(c)).map(str::trim);
            if torn.is_some() && granule == torn {
                dropped += 1;
                continue;
            }
            repaired.push_str(line);
            repaired.push('\n');
        }
        if let Some(granule) = torn {
            if dropped > 0 {
                warn!("Dropping {} earlier rows of {} from {:?}", dropped, granule, path);
            }
        }
    }

    fs::write(path, repaired).map_err(|e| Error::io(path, e))
}

fn read_summary_granules(path: &Path) -> Result<HashSet<String>> {
    let csv_err = |source| Error::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;
    let column = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .position(|h| h.trim() == GRANULE_COLUMN)
        .ok_or_else(|| Error::MissingColumn {
            path: path.to_path_buf(),
            column: GRANULE_COLUMN.to_string(),
        })?;

    let mut granules = HashSet::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        if let Some(value) = record.get(column) {
            granules.insert(value.trim().to_string());
        }
    }
    debug!("Read {} granules from {:?}", granules.len(), path);
    Ok(granules)
}

struct SummarySink {
    path: PathBuf,
    out: BufWriter<File>,
    needs_header: bool,
}

struct ErrorSink {
    path: PathBuf,
    out: BufWriter<File>,
}

/// Appends completed rows and failed granule names. Every write is flushed
/// before the lock is released.
pub struct OutputWriter {
    summary: Mutex<SummarySink>,
    errors: Mutex<ErrorSink>,
}

impl OutputWriter {
    /// Appends a CSV block whose first line is a header. The header is kept
    /// only when nothing has been written to a new summary yet. Returns the
    /// number of data rows written.
    pub fn append_block(&self, block: &str) -> Result<usize> {
        let mut lines = block
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.is_empty());

        let mut sink = self.summary.lock();
        let header = lines.next();
        let mut text = String::new();
        if sink.needs_header {
            if let Some(h) = header {
                text.push_str(h);
                text.push('\n');
            }
        }
        let mut rows = 0;
        for line in lines {
            text.push_str(line);
            text.push('\n');
            rows += 1;
        }
        if text.is_empty() {
            return Ok(0);
        }

        let SummarySink {
            path,
            out,
            needs_header,
        } = &mut *sink;
        out.write_all(text.as_bytes())
            .and_then(|_| out.flush())
            .map_err(|e| Error::io(path.as_path(), e))?;
        *needs_header = false;
        Ok(rows)
    }

    /// Appends one granule name to the error log.
    pub fn record_error(&self, granule: &str) -> Result<()> {
        let mut sink = self.errors.lock();
        let ErrorSink { path, out } = &mut *sink;
        writeln!(out, "{}", granule)
            .and_then(|_| out.flush())
            .map_err(|e| Error::io(path.as_path(), e))
    }
}
