// Memory-mapped index of fixed-width (relative offset, store position) entries.
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use memmap2::MmapMut;

use crate::core::encoding::{ENT_WIDTH, IndexEntry, LAST_ENTRY};
use crate::core::error::{Error, ErrorKind, closed, io_error, poisoned};
use crate::core::lock;

pub const DEFAULT_MAX_INDEX_BYTES: u64 = 1024 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct IndexOptions {
    pub max_bytes: u64,
}

impl IndexOptions {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INDEX_BYTES)
    }
}

/// Fixed-width offset index over a preallocated, memory-mapped file.
///
/// While open, the file is grown to `max_bytes` so the mapping never has to
/// move. `close` truncates it back to the bytes actually used; the entry count
/// after a reopen is recovered purely from the file length, so an index that
/// was never closed reopens with its padding counted as entries.
#[derive(Debug)]
pub struct Index {
    path: PathBuf,
    max_bytes: u64,
    state: Mutex<IndexState>,
}

#[derive(Debug)]
struct IndexState {
    mapped: Option<Mapped>,
    // Set when close unmapped the file but could not truncate or sync it.
    unmapped: Option<File>,
    size: u64,
}

// The map is declared first so it is dropped before the file.
#[derive(Debug)]
struct Mapped {
    mmap: MmapMut,
    file: File,
}

impl Index {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with(path, IndexOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: IndexOptions) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if options.max_bytes < ENT_WIDTH || usize::try_from(options.max_bytes).is_err() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "index capacity {} cannot hold a {ENT_WIDTH}-byte entry",
                    options.max_bytes
                ))
                .with_path(&path));
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_error(&path))?;
        lock::lock_exclusive(&file, &path)?;

        let size = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(io_error(&path))?;
        if size % ENT_WIDTH != 0 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "index length {size} is not a multiple of {ENT_WIDTH}"
                ))
                .with_path(&path)
                .with_hint("The index was not closed cleanly. Run `framelog validate` on the segment."));
        }
        if size > options.max_bytes {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "index already holds {size} bytes, more than capacity {}",
                    options.max_bytes
                ))
                .with_path(&path)
                .with_hint("Reopen with a capacity at least as large as the existing file."));
        }

        file.set_len(options.max_bytes).map_err(io_error(&path))?;
        // SAFETY: the file is exclusively locked and keeps its length until the
        // map is dropped in `shutdown`.
        let mmap = match unsafe { MmapMut::map_mut(&file) } {
            Ok(mmap) => mmap,
            Err(err) => {
                if let Err(restore) = file.set_len(size) {
                    tracing::warn!(path = %path.display(), size, error = %restore, "could not restore index length");
                }
                return Err(io_error(&path)(err).with_message("failed to map index"));
            }
        };
        tracing::debug!(
            path = %path.display(),
            entries = size / ENT_WIDTH,
            max_bytes = options.max_bytes,
            "index opened"
        );

        Ok(Self {
            path,
            max_bytes: options.max_bytes,
            state: Mutex::new(IndexState {
                mapped: Some(Mapped { mmap, file }),
                unmapped: None,
                size,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u64 {
        self.max_bytes
    }

    /// Bytes holding valid entries.
    pub fn size_bytes(&self) -> Result<u64, Error> {
        let state = self.lock()?;
        if state.mapped.is_none() {
            return Err(closed(&self.path));
        }
        Ok(state.size)
    }

    pub fn len(&self) -> Result<u64, Error> {
        Ok(self.size_bytes()? / ENT_WIDTH)
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.size_bytes()? == 0)
    }

    /// Appends the next entry. Offsets are expected to run 0, 1, 2, ... but
    /// that ordering is left to the caller.
    pub fn write(&self, offset: u32, position: u64) -> Result<(), Error> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let mapped = state.mapped.as_mut().ok_or_else(|| closed(&self.path))?;

        if state.size + ENT_WIDTH > self.max_bytes {
            let entries = state.size / ENT_WIDTH;
            return Err(Error::new(ErrorKind::Capacity)
                .with_message(format!("index is full at {entries} entries"))
                .with_path(&self.path)
                .with_entry(entries as i64)
                .with_hint("Start a new index file or open with a larger capacity."));
        }

        let start = state.size as usize;
        let end = start + ENT_WIDTH as usize;
        mapped.mmap[start..end].copy_from_slice(&IndexEntry::new(offset, position).encode());
        state.size += ENT_WIDTH;
        Ok(())
    }

    /// Reads entry `relative_index`, or the newest entry for [`LAST_ENTRY`].
    ///
    /// Returns a `NotFound` error when the entry has not been written.
    pub fn read(&self, relative_index: i64) -> Result<IndexEntry, Error> {
        if relative_index < LAST_ENTRY {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("relative index must be -1 or non-negative")
                .with_path(&self.path)
                .with_entry(relative_index));
        }

        let state = self.lock()?;
        let mapped = state.mapped.as_ref().ok_or_else(|| closed(&self.path))?;
        let entries = state.size / ENT_WIDTH;
        if entries == 0 {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("index is empty")
                .with_path(&self.path)
                .with_entry(relative_index));
        }

        let entry = if relative_index == LAST_ENTRY {
            entries - 1
        } else {
            relative_index as u64
        };
        if entry >= entries {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message(format!("no entry {entry} (index holds {entries})"))
                .with_path(&self.path)
                .with_entry(relative_index));
        }

        let start = (entry * ENT_WIDTH) as usize;
        IndexEntry::decode(&mapped.mmap[start..start + ENT_WIDTH as usize])
    }

    pub fn last(&self) -> Result<IndexEntry, Error> {
        self.read(LAST_ENTRY)
    }

    /// Snapshot of every valid entry, in write order.
    pub fn entries(&self) -> Result<Vec<IndexEntry>, Error> {
        let state = self.lock()?;
        let mapped = state.mapped.as_ref().ok_or_else(|| closed(&self.path))?;
        mapped.mmap[..state.size as usize]
            .chunks_exact(ENT_WIDTH as usize)
            .map(IndexEntry::decode)
            .collect()
    }

    /// Syncs, unmaps and truncates the file to its entries. A failed close can
    /// be retried; it picks up from the step that failed.
    pub fn close(&self) -> Result<(), Error> {
        let mut state = self.lock()?;
        shutdown(&self.path, &mut state)
    }

    fn lock(&self) -> Result<MutexGuard<'_, IndexState>, Error> {
        self.state.lock().map_err(|_| poisoned(&self.path))
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.mapped.is_none() && state.unmapped.is_none() {
            return;
        }
        if let Err(err) = shutdown(&self.path, state) {
            tracing::warn!(path = %self.path.display(), error = %err, "index dropped without a clean close");
            // Still try to cut off the preallocated tail.
            if let Some(Mapped { mmap, file }) = state.mapped.take() {
                drop(mmap);
                if let Err(err) = file.set_len(state.size) {
                    tracing::warn!(path = %self.path.display(), error = %err, "index left at capacity");
                }
            }
        }
    }
}

/// Syncs and unmaps, then cuts the file back to its logical size.
///
/// Each step leaves the state where a retry can resume: the map stays in place
/// until it is synced, and the file stays held until it is truncated and synced.
fn shutdown(path: &Path, state: &mut IndexState) -> Result<(), Error> {
    if let Some(mapped) = state.mapped.as_ref() {
        mapped.mmap.flush().map_err(io_error(path))?;
    }
    if let Some(Mapped { mmap, file }) = state.mapped.take() {
        drop(mmap);
        state.unmapped = Some(file);
    }

    let file = state.unmapped.as_ref().ok_or_else(|| closed(path))?;
    file.set_len(state.size)
        .and_then(|()| file.sync_all())
        .map_err(io_error(path))?;
    if let Some(file) = state.unmapped.take() {
        lock::unlock(&file, path);
    }
    tracing::debug!(path = %path.display(), entries = state.size / ENT_WIDTH, "index closed");
    Ok(())
}
