//! Line-delimited JSON records and atomic file writes

use crate::error::{PipelineError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{create_dir_all, read_to_string};
use std::io::{BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Reads one record per non-empty line. Fields not present on `T` are
/// ignored; a missing field fails with `MalformedRecord`.
pub fn read_jsonl<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<Vec<T>> {
    let path = path.as_ref();
    let contents = read_to_string(path)?;
    let mut records = Vec::new();

    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: T =
            serde_json::from_str(line).map_err(|e| PipelineError::MalformedRecord {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: e.to_string(),
            })?;
        records.push(record);
    }

    Ok(records)
}

/// Writes one JSON object per line, UTF-8, newline-terminated.
pub fn write_jsonl<T: Serialize, P: AsRef<Path>>(path: P, records: &[T]) -> Result<()> {
    write_atomic(path, |out| {
        for record in records {
            serde_json::to_writer(&mut *out, record)?;
            out.write_all(b"\n")?;
        }
        Ok(())
    })
}

/// Writes to a temporary file next to `path` and renames it into place, so
/// readers either see the complete file or no file.
pub fn write_atomic<P, F>(path: P, write_fn: F) -> Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut BufWriter<&mut NamedTempFile>) -> Result<()>,
{
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut out = BufWriter::new(&mut tmp);
        write_fn(&mut out)?;
        out.flush()?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
