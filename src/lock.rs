//! Advisory lock on the base directory, so two engines never write the
//! same stores. The daemon and `run` hold it for their lifetime, mutating
//! CLI commands for one invocation, read-only commands not at all.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const LOCK_FILE_NAME: &str = "syllabuzz.lock";

/// Held until dropped. The file carries the holder's pid for diagnostics.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Non-blocking. Fails with `WouldBlock` naming the holder's pid when
    /// another process has the lock.
    pub fn try_acquire(base_path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(base_path.join(LOCK_FILE_NAME))?;

        if let Err(err) = flock_exclusive(&file) {
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            let holder = holder.trim();
            let msg = if holder.is_empty() {
                "base directory is locked by another syllabuzz process".to_string()
            } else {
                format!("base directory is locked by syllabuzz process {holder}")
            };
            return Err(io::Error::new(io::ErrorKind::WouldBlock, msg));
        }

        file.set_len(0)?;
        file.rewind()?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(FileLock { file })
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &File) -> io::Result<()> {
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        #[cfg(unix)]
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN)
        };
    }
}

pub enum LockGuard {
    Held(FileLock),
    Skipped,
}

impl LockGuard {
    pub fn acquire(base_path: &Path, mutating: bool) -> io::Result<Self> {
        if mutating {
            FileLock::try_acquire(base_path).map(LockGuard::Held)
        } else {
            Ok(LockGuard::Skipped)
        }
    }
}
