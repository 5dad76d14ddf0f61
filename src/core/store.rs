// Append-only store of length-prefixed frames behind a buffered writer and one exclusive lock.
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::encoding::{self, LEN_WIDTH};
use crate::core::error::{Error, ErrorKind, closed, io_error, poisoned};
use crate::core::lock;

pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

#[derive(Clone, Copy, Debug)]
pub struct StoreOptions {
    pub buffer_capacity: usize,
}

impl StoreOptions {
    pub fn new(buffer_capacity: usize) -> Self {
        Self { buffer_capacity }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

/// Where a frame landed and how many bytes it occupies, prefix included.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
pub struct Appended {
    pub frame_len: u64,
    pub position: u64,
}

/// Append-only frame store.
///
/// Frames are `[u64 BE length][payload]` with no padding. Appends go through a
/// buffered writer and are only pushed to the file by `read`, `read_at`,
/// `sync` or `close`; anything appended after the last of those can be lost if
/// the process dies.
///
/// Every operation takes the same exclusive lock, so reads and appends never
/// interleave.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    state: Mutex<StoreState>,
}

#[derive(Debug)]
struct StoreState {
    // None once closed.
    writer: Option<BufWriter<File>>,
    size: u64,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with(path, StoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        // Append mode keeps writes at the end of the file no matter where reads seek.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_error(&path))?;
        lock::lock_exclusive(&file, &path)?;

        let size = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(io_error(&path))?;
        tracing::debug!(path = %path.display(), size, "store opened");

        Ok(Self {
            path,
            state: Mutex::new(StoreState {
                writer: Some(BufWriter::with_capacity(options.buffer_capacity, file)),
                size,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended so far, buffered bytes included.
    pub fn size(&self) -> Result<u64, Error> {
        let state = self.lock()?;
        if state.writer.is_none() {
            return Err(closed(&self.path));
        }
        Ok(state.size)
    }

    pub fn append(&self, payload: &[u8]) -> Result<Appended, Error> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let writer = state.writer.as_mut().ok_or_else(|| closed(&self.path))?;

        let position = state.size;
        let frame_len = encoding::frame_len(payload.len() as u64);
        let spare = (writer.capacity() - writer.buffer().len()) as u64;
        if frame_len > spare {
            // Earlier frames go out first, so a failed write below only leaves
            // bytes of this frame past `position`.
            writer.flush().map_err(io_error(&self.path))?;
        }
        if let Err(err) = write_frame(writer, payload) {
            let err = io_error(&self.path)(err).with_position(position);
            discard_partial_frame(&self.path, state, position)?;
            return Err(err);
        }

        state.size += frame_len;
        Ok(Appended {
            frame_len,
            position,
        })
    }

    /// Reads back the payload of the frame starting at `position`.
    pub fn read(&self, position: u64) -> Result<Vec<u8>, Error> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let writer = state.writer.as_mut().ok_or_else(|| closed(&self.path))?;
        writer.flush().map_err(io_error(&self.path))?;
        let file = writer.get_ref();

        if !fits(position, LEN_WIDTH, state.size) {
            return Err(frame_past_end(&self.path, position));
        }
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        read_exact_at(file, &mut len_buf, position)
            .map_err(|err| frame_read_error(&self.path, position, err))?;
        let len = encoding::decode_len(&len_buf);

        let body = position + LEN_WIDTH;
        if !fits(body, len, state.size) {
            return Err(frame_past_end(&self.path, position));
        }
        let len = usize::try_from(len).map_err(|_| frame_past_end(&self.path, position))?;
        let mut payload = vec![0u8; len];
        read_exact_at(file, &mut payload, body)
            .map_err(|err| frame_read_error(&self.path, position, err))?;
        Ok(payload)
    }

    /// Raw positional read with no framing. A short count means the file ended.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let mut guard = self.lock()?;
        let writer = guard.writer.as_mut().ok_or_else(|| closed(&self.path))?;
        writer.flush().map_err(io_error(&self.path))?;
        let mut file = writer.get_ref();

        file.seek(SeekFrom::Start(offset))
            .map_err(io_error(&self.path))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(io_error(&self.path)(err).with_position(offset)),
            }
        }
        Ok(filled)
    }

    /// Flushes buffered frames and forces them to stable storage.
    pub fn sync(&self) -> Result<(), Error> {
        let mut guard = self.lock()?;
        let writer = guard.writer.as_mut().ok_or_else(|| closed(&self.path))?;
        writer.flush().map_err(io_error(&self.path))?;
        writer.get_ref().sync_all().map_err(io_error(&self.path))
    }

    /// Flushes, syncs and releases the file. A failed close leaves the store
    /// open with its unwritten frames still buffered, so it can be retried.
    pub fn close(&self) -> Result<(), Error> {
        let mut state = self.lock()?;
        shutdown(&self.path, &mut state)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, Error> {
        self.state.lock().map_err(|_| poisoned(&self.path))
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.writer.is_some() {
            if let Err(err) = shutdown(&self.path, state) {
                tracing::warn!(path = %self.path.display(), error = %err, "store dropped without a clean close");
            }
        }
    }
}

fn shutdown(path: &Path, state: &mut StoreState) -> Result<(), Error> {
    let writer = state.writer.as_mut().ok_or_else(|| closed(path))?;
    writer.flush().map_err(io_error(path))?;
    writer.get_ref().sync_all().map_err(io_error(path))?;

    if let Some(writer) = state.writer.take() {
        // Nothing is buffered after the flush above.
        let (file, _) = writer.into_parts();
        lock::unlock(&file, path);
    }
    tracing::debug!(path = %path.display(), size = state.size, "store closed");
    Ok(())
}

fn write_frame(writer: &mut BufWriter<File>, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&encoding::encode_len(payload.len() as u64))?;
    writer.write_all(payload)
}

/// Drops whatever part of a failed frame reached the buffer or the file.
///
/// Writes only touch the file after `append` has flushed earlier frames, so
/// the file holds exactly `position` good bytes. If the file cannot be cut back the store is closed.
fn discard_partial_frame(path: &Path, state: &mut StoreState, position: u64) -> Result<(), Error> {
    let Some(writer) = state.writer.take() else {
        return Ok(());
    };
    let capacity = writer.capacity();
    let (file, _partial) = writer.into_parts();
    match file.set_len(position) {
        Ok(()) => {
            state.writer = Some(BufWriter::with_capacity(capacity, file));
            Ok(())
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), position, error = %err, "could not discard a partial frame");
            lock::unlock(&file, path);
            Err(io_error(path)(err)
                .with_position(position)
                .with_message("partial frame left in store")
                .with_hint("The store was closed. Run `framelog validate` before reopening it."))
        }
    }
}

fn fits(start: u64, len: u64, size: u64) -> bool {
    start.checked_add(len).is_some_and(|end| end <= size)
}

fn read_exact_at(mut file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

fn frame_past_end(path: &Path, position: u64) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("frame extends past end of store")
        .with_path(path)
        .with_position(position)
        .with_source(io::Error::from(io::ErrorKind::UnexpectedEof))
}

fn frame_read_error(path: &Path, position: u64, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        return frame_past_end(path, position);
    }
    io_error(path)(err).with_position(position)
}

#[cfg(test)]
mod tests {
    use super::{Store, StoreOptions};
    use crate::core::encoding::LEN_WIDTH;
    use crate::core::error::ErrorKind;

    const WRITE: &[u8] = b"Hello World";
    const WIDTH: u64 = WRITE.len() as u64 + LEN_WIDTH;

    fn append_three(store: &Store) {
        for i in 1..4u64 {
            let appended = store.append(WRITE).expect("append");
            assert_eq!(appended.frame_len, WIDTH);
            assert_eq!(appended.position + appended.frame_len, WIDTH * i);
        }
    }

    fn read_three(store: &Store) {
        let mut position = 0;
        for _ in 1..4 {
            let read = store.read(position).expect("read");
            assert_eq!(read, WRITE);
            position += WIDTH;
        }
    }

    fn read_at_three(store: &Store) {
        let mut offset = 0u64;
        for _ in 1..4 {
            let mut len_buf = [0u8; LEN_WIDTH as usize];
            let n = store.read_at(&mut len_buf, offset).expect("read len");
            assert_eq!(n as u64, LEN_WIDTH);
            offset += n as u64;

            let size = u64::from_be_bytes(len_buf);
            let mut body = vec![0u8; size as usize];
            let n = store.read_at(&mut body, offset).expect("read body");
            assert_eq!(body, WRITE);
            assert_eq!(n as u64, size);
            offset += n as u64;
        }
    }

    #[test]
    fn append_read_and_recover() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("segment.store");

        let store = Store::open(&path).expect("open");
        append_three(&store);
        read_three(&store);
        read_at_three(&store);
        store.close().expect("close");

        let store = Store::open(&path).expect("reopen");
        assert_eq!(store.size().expect("size"), WIDTH * 3);
        read_at_three(&store);
    }

    #[test]
    fn appends_stay_buffered_until_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("segment.store");

        let store = Store::open_with(&path, StoreOptions::new(1024)).expect("open");
        store.append(WRITE).expect("append");
        let before = std::fs::metadata(&path).expect("stat").len();
        store.close().expect("close");
        let after = std::fs::metadata(&path).expect("stat").len();
        assert!(after > before);
        assert_eq!(after, WIDTH);
    }

    #[test]
    fn empty_payload_still_gets_a_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("segment.store")).expect("open");

        let first = store.append(b"").expect("append empty");
        assert_eq!(first.position, 0);
        assert_eq!(first.frame_len, LEN_WIDTH);
        let second = store.append(b"x").expect("append");
        assert_eq!(second.position, LEN_WIDTH);

        assert!(store.read(0).expect("read empty").is_empty());
        assert_eq!(store.read(LEN_WIDTH).expect("read"), b"x");
    }

    #[test]
    fn read_past_end_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("segment.store")).expect("open");
        store.append(WRITE).expect("append");

        let err = store.read(WIDTH).expect_err("nothing at end");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.position(), Some(WIDTH));

        // Position 1 decodes a length prefix that overruns the file.
        let err = store.read(1).expect_err("bad position");
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn read_at_past_end_returns_short_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("segment.store")).expect("open");
        store.append(WRITE).expect("append");

        let mut buf = [0u8; 32];
        let n = store.read_at(&mut buf, 0).expect("read_at");
        assert_eq!(n as u64, WIDTH);
        let n = store.read_at(&mut buf, 1000).expect("read_at past end");
        assert_eq!(n, 0);
    }

    #[test]
    fn operations_after_close_fail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("segment.store")).expect("open");
        store.close().expect("close");

        assert_eq!(store.append(WRITE).expect_err("append").kind(), ErrorKind::Closed);
        assert_eq!(store.read(0).expect_err("read").kind(), ErrorKind::Closed);
        assert_eq!(store.size().expect_err("size").kind(), ErrorKind::Closed);
        assert_eq!(store.close().expect_err("close").kind(), ErrorKind::Closed);
    }

    #[test]
    fn second_open_is_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("segment.store");
        let store = Store::open(&path).expect("open");

        let err = Store::open(&path).expect_err("second open");
        assert_eq!(err.kind(), ErrorKind::Busy);

        store.close().expect("close");
        Store::open(&path).expect("open after close");
    }

    #[test]
    fn drop_flushes_buffered_frames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("segment.store");
        {
            let store = Store::open(&path).expect("open");
            store.append(WRITE).expect("append");
        }
        assert_eq!(std::fs::metadata(&path).expect("stat").len(), WIDTH);
    }
}
