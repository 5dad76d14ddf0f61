//! Purpose: Offline consistency check of one store file and its index file.
//! Exports: `validate`, `ValidationReport`, `ValidationStatus`, `ValidationIssue`.
//! Role: Diagnostics for the CLI and API users after an unclean shutdown.
//! Invariants: Files are opened read-only; nothing is locked, grown or repaired.
//! Invariants: Every problem found is reported; the scan does not stop at the first.

use crate::core::encoding::{self, ENT_WIDTH, IndexEntry, LEN_WIDTH};
use crate::core::error::{Error, io_error};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Ok,
    Corrupt,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ValidationReport {
    pub store_path: PathBuf,
    pub index_path: PathBuf,
    pub status: ValidationStatus,
    pub store_size: u64,
    pub frames: u64,
    pub entries: u64,
    pub issues: Vec<ValidationIssue>,
    pub remediation_hints: Vec<String>,
}

impl ValidationReport {
    fn new(store_path: &Path, index_path: &Path) -> Self {
        Self {
            store_path: store_path.to_path_buf(),
            index_path: index_path.to_path_buf(),
            status: ValidationStatus::Ok,
            store_size: 0,
            frames: 0,
            entries: 0,
            issues: Vec::new(),
            remediation_hints: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ValidationStatus::Ok
    }

    pub fn has_issue(&self, code: &str) -> bool {
        self.issues.iter().any(|issue| issue.code == code)
    }

    fn push(&mut self, issue: ValidationIssue) {
        self.status = ValidationStatus::Corrupt;
        self.issues.push(issue);
    }

    fn finish(mut self) -> Self {
        if self.has_issue("store_torn_frame") {
            self.remediation_hints.push(
                "The store ends inside a frame; bytes after the last whole frame were never fully flushed."
                    .to_string(),
            );
        }
        if self.has_issue("index_padding") || self.has_issue("index_misaligned") {
            self.remediation_hints.push(
                "The index was not closed cleanly; trailing entries are preallocation padding."
                    .to_string(),
            );
        }
        if self.has_issue("index_position_past_end") || self.has_issue("index_position_unaligned")
        {
            self.remediation_hints.push(
                "Some index entries do not point at frames in the store; the pair is out of sync."
                    .to_string(),
            );
        }
        self
    }
}

/// Scans `store_path` frame by frame and checks every entry of `index_path`
/// against the frames found.
///
/// Only failing to open or read either file is an `Err`; structural problems
/// are returned as issues in the report.
pub fn validate(
    store_path: impl AsRef<Path>,
    index_path: impl AsRef<Path>,
) -> Result<ValidationReport, Error> {
    let store_path = store_path.as_ref();
    let index_path = index_path.as_ref();
    let mut report = ValidationReport::new(store_path, index_path);

    let scan = scan_store(store_path)?;
    report.store_size = scan.size;
    report.frames = scan.starts.len() as u64;
    if let Some(position) = scan.torn_at {
        report.push(issue(
            "store_torn_frame",
            format!(
                "store ends inside the frame at {position} ({} bytes on disk)",
                scan.size
            ),
            None,
            Some(position),
        ));
    }

    let bytes = fs::read(index_path).map_err(io_error(index_path))?;
    let remainder = bytes.len() as u64 % ENT_WIDTH;
    if remainder != 0 {
        report.push(issue(
            "index_misaligned",
            format!("index length {} leaves {remainder} trailing bytes", bytes.len()),
            None,
            None,
        ));
    }

    let entries = bytes
        .chunks_exact(ENT_WIDTH as usize)
        .map(IndexEntry::decode)
        .collect::<Result<Vec<_>, _>>()?;
    let padding_start = padding_start(&bytes, entries.len());
    if padding_start < entries.len() {
        report.push(issue(
            "index_padding",
            format!(
                "{} zeroed entries trail the index",
                entries.len() - padding_start
            ),
            Some(padding_start as u64),
            None,
        ));
    }
    report.entries = padding_start as u64;

    for (i, entry) in entries.iter().take(padding_start).enumerate() {
        let i = i as u64;
        if u64::from(entry.offset) != i {
            report.push(issue(
                "index_offset_gap",
                format!("entry {i} carries relative offset {}", entry.offset),
                Some(i),
                Some(entry.position),
            ));
        }
        if entry.position >= scan.valid_end {
            report.push(issue(
                "index_position_past_end",
                format!(
                    "entry {i} points at {} but whole frames end at {}",
                    entry.position, scan.valid_end
                ),
                Some(i),
                Some(entry.position),
            ));
        } else if scan.starts.binary_search(&entry.position).is_err() {
            report.push(issue(
                "index_position_unaligned",
                format!("entry {i} points at {} which is not a frame start", entry.position),
                Some(i),
                Some(entry.position),
            ));
        }
    }

    Ok(report.finish())
}

struct StoreScan {
    size: u64,
    // Sorted frame start positions.
    starts: Vec<u64>,
    // End of the last whole frame.
    valid_end: u64,
    torn_at: Option<u64>,
}

fn scan_store(path: &Path) -> Result<StoreScan, Error> {
    let file = File::open(path).map_err(io_error(path))?;
    let size = file
        .metadata()
        .map(|meta| meta.len())
        .map_err(io_error(path))?;
    let mut reader = BufReader::new(file);

    let mut starts = Vec::new();
    let mut position = 0u64;
    let mut torn_at = None;
    while position < size {
        if size - position < LEN_WIDTH {
            torn_at = Some(position);
            break;
        }
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        reader.read_exact(&mut len_buf).map_err(io_error(path))?;
        let len = encoding::decode_len(&len_buf);
        let end = match (position + LEN_WIDTH).checked_add(len) {
            Some(end) if end <= size => end,
            _ => {
                torn_at = Some(position);
                break;
            }
        };
        starts.push(position);
        // `end <= size` keeps `len` well inside i64.
        reader
            .seek_relative(len as i64)
            .map_err(io_error(path))?;
        position = end;
    }

    Ok(StoreScan {
        size,
        starts,
        valid_end: position,
        torn_at,
    })
}

/// First entry of the trailing run of all-zero entries. Entry 0 is never
/// padding since `(0, 0)` is the legitimate first entry.
fn padding_start(bytes: &[u8], entries: usize) -> usize {
    let width = ENT_WIDTH as usize;
    let mut start = entries;
    while start > 1 {
        let chunk = &bytes[(start - 1) * width..start * width];
        if chunk.iter().any(|byte| *byte != 0) {
            break;
        }
        start -= 1;
    }
    start
}

fn issue(code: &str, message: String, entry: Option<u64>, position: Option<u64>) -> ValidationIssue {
    ValidationIssue {
        code: code.to_string(),
        message,
        entry,
        position,
    }
}

#[cfg(test)]
mod tests {
    use super::{ValidationStatus, padding_start, validate};
    use crate::core::encoding::{ENT_WIDTH, IndexEntry};
    use std::path::Path;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u64).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn write_index(path: &Path, entries: &[(u32, u64)]) {
        let mut bytes = Vec::new();
        for (offset, position) in entries {
            bytes.extend_from_slice(&IndexEntry::new(*offset, *position).encode());
        }
        std::fs::write(path, bytes).expect("write index");
    }

    #[test]
    fn consistent_pair_is_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = dir.path().join("seg.store");
        let index = dir.path().join("seg.index");
        let mut bytes = frame(b"alpha");
        bytes.extend(frame(b""));
        bytes.extend(frame(b"gamma"));
        std::fs::write(&store, bytes).expect("write store");
        write_index(&index, &[(0, 0), (1, 13), (2, 21)]);

        let report = validate(&store, &index).expect("validate");
        assert_eq!(report.status, ValidationStatus::Ok);
        assert_eq!(report.frames, 3);
        assert_eq!(report.entries, 3);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn torn_trailing_frame_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = dir.path().join("seg.store");
        let index = dir.path().join("seg.index");
        let mut bytes = frame(b"alpha");
        let torn = frame(b"partially flushed");
        bytes.extend_from_slice(&torn[..12]);
        std::fs::write(&store, bytes).expect("write store");
        write_index(&index, &[(0, 0), (1, 13)]);

        let report = validate(&store, &index).expect("validate");
        assert!(!report.is_ok());
        assert!(report.has_issue("store_torn_frame"));
        assert!(report.has_issue("index_position_past_end"));
        assert_eq!(report.frames, 1);
        assert!(!report.remediation_hints.is_empty());
    }

    #[test]
    fn unaligned_and_gapped_entries_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = dir.path().join("seg.store");
        let index = dir.path().join("seg.index");
        let mut bytes = frame(b"alpha");
        bytes.extend(frame(b"beta"));
        std::fs::write(&store, bytes).expect("write store");
        write_index(&index, &[(0, 0), (5, 4)]);

        let report = validate(&store, &index).expect("validate");
        assert!(report.has_issue("index_offset_gap"));
        assert!(report.has_issue("index_position_unaligned"));
        assert_eq!(report.issues.len(), 2);
    }

    #[test]
    fn preallocated_padding_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = dir.path().join("seg.store");
        let index = dir.path().join("seg.index");
        std::fs::write(&store, frame(b"alpha")).expect("write store");
        let mut bytes = IndexEntry::new(0, 0).encode().to_vec();
        bytes.resize(ENT_WIDTH as usize * 4 + 5, 0);
        std::fs::write(&index, bytes).expect("write index");

        let report = validate(&store, &index).expect("validate");
        assert!(report.has_issue("index_padding"));
        assert!(report.has_issue("index_misaligned"));
        assert_eq!(report.entries, 1);
        assert!(!report.has_issue("index_offset_gap"));
    }

    #[test]
    fn missing_files_are_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = validate(dir.path().join("nope.store"), dir.path().join("nope.index"))
            .expect_err("missing");
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Io);
    }

    #[test]
    fn first_zero_entry_is_not_padding() {
        let bytes = [0u8; 12];
        assert_eq!(padding_start(&bytes, 1), 1);
        let bytes = [0u8; 36];
        assert_eq!(padding_start(&bytes, 3), 1);
    }
}
