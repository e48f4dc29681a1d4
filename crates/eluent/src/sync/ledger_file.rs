//! Streaming scan and atomic rewrite of the ledger data file.
//!
//! Atoms live one-JSON-object-per-line in `.eluent/data.jsonl` inside the
//! ledger worktree. A rewrite copies every line verbatim except the target
//! record, which is parsed, mutated, and re-serialized; unknown fields on the
//! target survive through [`AtomRecord::extra`](crate::domain::AtomRecord).
//! Writes go to a pid-suffixed temp file, fsync, then rename over the
//! original.

use crate::domain::AtomRecord;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::LedgerError;

/// Directory mirrored by the ledger branch.
pub const LEDGER_DIR: &str = ".eluent";
/// Atom records, one JSON object per line.
pub const DATA_FILE: &str = "data.jsonl";

/// Path of the atom data file inside a worktree (or the primary tree).
pub fn data_file_path(tree_root: &Path) -> PathBuf {
    tree_root.join(LEDGER_DIR).join(DATA_FILE)
}

/// Scan for the atom with the given id.
///
/// A missing data file reads as an empty ledger. Lines that fail to parse
/// are skipped; they are preserved verbatim by any rewrite.
pub fn find_atom(path: &Path, atom_id: &str) -> Result<Option<AtomRecord>, LedgerError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(LedgerError::Internal(format!(
                "failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| {
            LedgerError::Internal(format!("failed to read {}: {}", path.display(), e))
        })?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_str::<AtomRecord>(&line) {
            if record.id == atom_id {
                return Ok(Some(record));
            }
        }
    }

    Ok(None)
}

/// Rewrite the record with the given id in place, atomically.
///
/// Returns whether the atom was found. When it is not found the file is left
/// untouched. On any I/O error the temp file is removed and an error is
/// returned.
pub fn rewrite_atom(
    path: &Path,
    atom_id: &str,
    mutate: impl FnOnce(&mut AtomRecord),
) -> Result<bool, LedgerError> {
    let mut mutate = Some(mutate);
    let changed = rewrite_records(path, |record| {
        if record.id == atom_id {
            if let Some(f) = mutate.take() {
                f(record);
                return true;
            }
        }
        false
    })?;
    Ok(changed > 0)
}

/// Rewrite every record for which `mutate` returns true, atomically.
///
/// Returns the number of records rewritten; when zero, the original file is
/// left untouched.
pub fn rewrite_records(
    path: &Path,
    mut mutate: impl FnMut(&mut AtomRecord) -> bool,
) -> Result<usize, LedgerError> {
    let io_err = |e: std::io::Error| {
        LedgerError::Internal(format!("failed to update atom file {}: {}", path.display(), e))
    };

    let input = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_err(e)),
    };

    let temp_path = path.with_extension(format!("jsonl.{}.tmp", std::process::id()));
    let result = (|| -> Result<usize, LedgerError> {
        let mut writer = BufWriter::new(File::create(&temp_path).map_err(io_err)?);
        let mut changed = 0usize;

        for line in BufReader::new(input).lines() {
            let line = line.map_err(io_err)?;
            if !line.trim().is_empty() {
                if let Ok(mut record) = serde_json::from_str::<AtomRecord>(&line) {
                    if mutate(&mut record) {
                        let rewritten = serde_json::to_string(&record).map_err(|e| {
                            LedgerError::Internal(format!("failed to serialize atom: {e}"))
                        })?;
                        writeln!(writer, "{rewritten}").map_err(io_err)?;
                        changed += 1;
                        continue;
                    }
                }
            }
            writeln!(writer, "{line}").map_err(io_err)?;
        }

        let file = writer.into_inner().map_err(|e| io_err(e.into_error()))?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        if changed == 0 {
            fs::remove_file(&temp_path).map_err(io_err)?;
            return Ok(0);
        }

        fs::rename(&temp_path, path).map_err(io_err)?;
        if let Some(dir) = path.parent() {
            if let Ok(dir_file) = File::open(dir) {
                let _ = dir_file.sync_all();
            }
        }
        Ok(changed)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}
