//! Locking primitives.
//!
//! - `ProcessLock`: advisory `flock()` on `<base>/expertdb.lock`, so only one
//!   process writes a store at a time. The holder's pid is written into the
//!   file so a second process can say who it is waiting on.
//! - `acquire_*`: bounded acquisition of in-process locks. Callers get
//!   `ConcurrencyTimeout` instead of waiting forever behind a long commit.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::thread::sleep;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::errors::StoreError;

const LOCK_FILE_NAME: &str = "expertdb.lock";

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Exclusive ownership of a store directory, released on drop.
pub struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl ProcessLock {
    /// Take the store under `base` or fail right away naming the holder.
    pub fn acquire(base: &Path) -> io::Result<Self> {
        let path = base.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !try_flock(&file)? {
            let holder = match lock_owner(base) {
                Some(pid) => format!("expertdb process {pid}"),
                None => "another expertdb process".to_string(),
            };
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("{} is held by {holder}", path.display()),
            ));
        }

        // only rewritten while locked, so readers never see a stale owner
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        log::debug!("locked {} for pid {}", path.display(), std::process::id());

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.set_len(0) {
            log::warn!("failed to clear {}: {err}", self.path.display());
        }
        unlock(&self.file);
    }
}

/// Pid recorded by the process holding the store under `base`.
pub fn lock_owner(base: &Path) -> Option<u32> {
    std::fs::read_to_string(base.join(LOCK_FILE_NAME))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// `Ok(false)` when another open file description holds the lock.
#[cfg(unix)]
fn try_flock(file: &File) -> io::Result<bool> {
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_flock(_file: &File) -> io::Result<bool> {
    // no advisory locking outside unix, single-writer is assumed
    Ok(true)
}

#[cfg(unix)]
fn unlock(file: &File) {
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

pub fn acquire_mutex<'a, T>(
    lock: &'a Mutex<T>,
    name: &'static str,
    timeout: Duration,
) -> Result<MutexGuard<'a, T>, StoreError> {
    let started = Instant::now();
    loop {
        match lock.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(_)) => return Err(StoreError::poisoned(name)),
            Err(TryLockError::WouldBlock) => {}
        }
        if started.elapsed() >= timeout {
            log::warn!("gave up waiting for the {name} lock");
            return Err(StoreError::ConcurrencyTimeout {
                lock: name,
                waited: started.elapsed(),
            });
        }
        sleep(POLL_INTERVAL);
    }
}

pub fn acquire_read<'a, T>(
    lock: &'a RwLock<T>,
    name: &'static str,
    timeout: Duration,
) -> Result<RwLockReadGuard<'a, T>, StoreError> {
    let started = Instant::now();
    loop {
        match lock.try_read() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(_)) => return Err(StoreError::poisoned(name)),
            Err(TryLockError::WouldBlock) => {}
        }
        if started.elapsed() >= timeout {
            log::warn!("gave up waiting for the {name} read lock");
            return Err(StoreError::ConcurrencyTimeout {
                lock: name,
                waited: started.elapsed(),
            });
        }
        sleep(POLL_INTERVAL);
    }
}

pub fn acquire_write<'a, T>(
    lock: &'a RwLock<T>,
    name: &'static str,
    timeout: Duration,
) -> Result<RwLockWriteGuard<'a, T>, StoreError> {
    let started = Instant::now();
    loop {
        match lock.try_write() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(_)) => return Err(StoreError::poisoned(name)),
            Err(TryLockError::WouldBlock) => {}
        }
        if started.elapsed() >= timeout {
            log::warn!("gave up waiting for the {name} write lock");
            return Err(StoreError::ConcurrencyTimeout {
                lock: name,
                waited: started.elapsed(),
            });
        }
        sleep(POLL_INTERVAL);
    }
}
