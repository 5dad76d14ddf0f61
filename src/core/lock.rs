// Exclusive advisory file locks held for the lifetime of an open store or index.
use std::fs::File;
use std::io;
use std::path::Path;

use fs2::FileExt;
use libc::{EACCES, EPERM};

use crate::core::error::{Error, ErrorKind};

/// Takes a non-blocking exclusive lock so a second opener fails fast with `Busy`.
pub(crate) fn lock_exclusive(file: &File, path: &Path) -> Result<(), Error> {
    file.try_lock_exclusive().map_err(|err| {
        let kind = lock_error_kind(&err);
        let err = Error::new(kind).with_path(path).with_source(err);
        match kind {
            ErrorKind::Busy => err
                .with_message("file is already open elsewhere")
                .with_hint("Close the other handle or process before reopening."),
            _ => err.with_message("failed to lock file"),
        }
    })
}

pub(crate) fn unlock(file: &File, path: &Path) {
    if let Err(err) = FileExt::unlock(file) {
        tracing::debug!(path = %path.display(), error = %err, "unlock failed");
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
        return ErrorKind::Busy;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::{lock_error_kind, lock_exclusive};
    use crate::core::error::ErrorKind;
    use std::fs::OpenOptions;

    #[cfg(unix)]
    #[test]
    fn lock_errors_map_to_expected_kinds() {
        let err = std::io::Error::from_raw_os_error(libc::EAGAIN);
        assert_eq!(lock_error_kind(&err), ErrorKind::Busy);

        let err = std::io::Error::from_raw_os_error(libc::EWOULDBLOCK);
        assert_eq!(lock_error_kind(&err), ErrorKind::Busy);

        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(lock_error_kind(&err), ErrorKind::Io);
    }

    #[test]
    fn second_lock_is_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("locked.store");
        let open = || {
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)
                .expect("open")
        };
        let first = open();
        let second = open();
        lock_exclusive(&first, &path).expect("first lock");
        let err = lock_exclusive(&second, &path).expect_err("second lock should fail");
        assert_eq!(err.kind(), ErrorKind::Busy);
    }
}
