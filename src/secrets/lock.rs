use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use super::error::{IoContext, Scope, SecretsError};
use crate::config::LockConfig;

/// Exclusive, installation-wide lock held as an advisory lock on `ca.lock`.
///
/// The kernel drops the lock when the holder's file is closed, including when
/// the process dies, so a crashed run never leaves the installation locked.
/// The lock file itself stays on disk.
#[derive(Debug)]
pub struct CaLock {
    path: PathBuf,
    _file: File,
}

impl CaLock {
    pub fn acquire(path: &Path, config: &LockConfig) -> Result<Self, SecretsError> {
        let step = "acquire CA lock";
        let scope = Scope::Installation;
        let started = Instant::now();
        let timeout = Duration::from_millis(config.timeout_ms);
        let interval = Duration::from_millis(config.retry_interval_ms);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .io_step(step, &scope, path)?;

        loop {
            match try_lock_exclusive(&file) {
                Ok(true) => break,
                Ok(false) => {
                    if started.elapsed() >= timeout {
                        return Err(SecretsError::LockTimeout {
                            path: path.to_path_buf(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    thread::sleep(interval);
                }
                Err(e) => return Err(e).io_step(step, &scope, path),
            }
        }

        // Owner pid is informational only
        file.set_len(0).io_step(step, &scope, path)?;
        file.seek(SeekFrom::Start(0)).io_step(step, &scope, path)?;
        writeln!(file, "{}", std::process::id()).io_step(step, &scope, path)?;

        debug!("🔒 Acquired CA lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CaLock {
    fn drop(&mut self) {
        // Closing the file releases the lock; the file is never deleted, so
        // every contender always locks the same inode.
        debug!("🔓 Released CA lock {}", self.path.display());
    }
}

/// Non-blocking `flock(LOCK_EX)`; `Ok(false)` when another holder has it.
#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::fd::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    match file.try_lock() {
        Ok(()) => Ok(true),
        Err(std::fs::TryLockError::WouldBlock) => Ok(false),
        Err(std::fs::TryLockError::Error(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn fast_lock() -> LockConfig {
        LockConfig {
            retry_interval_ms: 5,
            timeout_ms: 50,
        }
    }

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ca.lock");

        let lock = CaLock::acquire(&path, &fast_lock()).unwrap();
        assert!(path.exists());

        let second = CaLock::acquire(&path, &fast_lock());
        assert!(matches!(second, Err(SecretsError::LockTimeout { .. })));

        drop(lock);
        assert!(CaLock::acquire(&path, &fast_lock()).is_ok());
    }

    #[test]
    fn test_leftover_lock_file_does_not_block() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ca.lock");
        // What a crashed holder leaves behind
        fs::write(&path, "12345\n").unwrap();

        let lock = CaLock::acquire(&path, &fast_lock()).unwrap();
        assert_eq!(lock.path(), path.as_path());
        let owner = fs::read_to_string(&path).unwrap();
        assert_eq!(owner.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_one_holder_at_a_time() {
        let temp_dir = TempDir::new().unwrap();
        let path = Arc::new(temp_dir.path().join("ca.lock"));
        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));
        let config = LockConfig {
            retry_interval_ms: 1,
            timeout_ms: 10_000,
        };

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let (path, holders, max_holders, barrier, config) = (
                    Arc::clone(&path),
                    Arc::clone(&holders),
                    Arc::clone(&max_holders),
                    Arc::clone(&barrier),
                    config.clone(),
                );
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..5 {
                        let _lock = CaLock::acquire(&path, &config).unwrap();
                        let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                        max_holders.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        holders.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in threads {
            handle.join().unwrap();
        }
        assert_eq!(max_holders.load(Ordering::SeqCst), 1);
    }
}
