//! The xtables advisory lock shared with iptables and friends

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_LOCK_PATH: &str = "/run/xtables.lock";

/// An exclusive `flock` on the lock file, released on drop
#[derive(Debug)]
pub struct XtablesLock {
    path: PathBuf,
    _file: File,
}

impl XtablesLock {
    /// Take the lock. With `wait` the call blocks until the holder lets go;
    /// otherwise a busy lock fails with `WouldBlock`.
    pub fn acquire(path: &Path, wait: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock && wait => {
                warn!(path = %path.display(), "waiting for xtables lock");
                flock(&file, libc::LOCK_EX)?;
            }
            Err(err) => {
                if err.kind() == io::ErrorKind::WouldBlock {
                    warn!(path = %path.display(), "xtables lock is held by another process");
                }
                return Err(err);
            }
        }

        debug!(path = %path.display(), "acquired xtables lock");
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn flock(file: &File, op: i32) -> io::Result<()> {
    loop {
        let ret = unsafe { libc::flock(file.as_raw_fd(), op) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
