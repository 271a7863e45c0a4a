//! Platform-specific durable sync implementations
//!
//! Maps `durable_sync` to the strongest durability primitive each platform offers,
//! and `sync_directory` to the call that persists renames and unlinks.

use std::fs::File;
use std::io;
use std::path::Path;

/// Ensures data is durably written to persistent storage before returning.
///
/// Platform behaviors:
/// - Linux: fdatasync() - syncs data but not metadata
/// - macOS/iOS: fcntl(F_FULLFSYNC) - bypasses the drive's volatile cache
/// - Windows: FlushFileBuffers()
/// - Other: file.sync_data()
///
/// The caller must not hold locks that readers wait on: this may block during heavy I/O.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live File reference, so it is open for the duration of the call.
        let result = unsafe { libc::fdatasync(fd) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        // Plain fsync() on Apple platforms stops at the drive cache.
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live File reference, so it is open for the duration of the call.
        let result = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        let handle = file.as_raw_handle();
        // SAFETY: handle comes from a live File reference.
        let result = unsafe { FlushFileBuffers(handle as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Persist directory entries (file creation, rename, removal) inside `dir`.
///
/// Windows cannot open directories as files; NTFS journals metadata, so this is a no-op there.
pub fn sync_directory(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        handle.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}
