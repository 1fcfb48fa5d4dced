//! Per-domain run lock
//!
//! Two layers: an async mutex per lock path excludes runs inside one
//! process (the daemon's scheduler and a SIGHUP-triggered check), and an
//! exclusive `flock` on `<domain dir>/.lock` excludes other processes (a
//! manual `certpilot renew` while the daemon runs). The guard releases both
//! on drop, including on panic or cancellation.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, trace};

use certpilot_common::{PollOutcome, PollPolicy};

/// Lock file name under the domain directory
pub const LOCK_FILE: &str = ".lock";

type LocalLocks = Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>;

fn local_locks() -> &'static LocalLocks {
    static LOCKS: OnceLock<LocalLocks> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Exclusive lock over one domain's runs
#[derive(Debug, Clone)]
pub struct DomainLock {
    path: PathBuf,
    policy: PollPolicy,
}

/// Held while a run owns the domain
#[derive(Debug)]
pub struct DomainLockGuard {
    path: PathBuf,
    _file: Flock<File>,
    _local: OwnedMutexGuard<()>,
}

impl Drop for DomainLockGuard {
    fn drop(&mut self) {
        trace!(path = %self.path.display(), "Released domain lock");
    }
}

impl DomainLock {
    /// Lock over `domain_dir`, waiting according to `policy`
    pub fn new(domain_dir: &Path, policy: PollPolicy) -> Self {
        Self {
            path: domain_dir.join(LOCK_FILE),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock without waiting; `Ok(None)` when another run holds it
    pub fn try_acquire(&self) -> io::Result<Option<DomainLockGuard>> {
        let local = {
            let mut locks = local_locks().lock();
            Arc::clone(locks.entry(self.path.clone()).or_default())
        };

        let Ok(local) = local.try_lock_owned() else {
            trace!(path = %self.path.display(), "Domain lock held in this process");
            return Ok(None);
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;

        let mut file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => file,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                trace!(path = %self.path.display(), "Domain lock held by another process");
                return Ok(None);
            }
            Err((_, errno)) => return Err(io::Error::from(errno)),
        };

        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;

        debug!(path = %self.path.display(), "Acquired domain lock");
        Ok(Some(DomainLockGuard {
            path: self.path.clone(),
            _file: file,
            _local: local,
        }))
    }

    /// Poll for the lock until the policy deadline; `Ok(None)` means busy
    pub async fn acquire(&self) -> io::Result<Option<DomainLockGuard>> {
        let outcome = self
            .policy
            .poll(move |_| async move {
                match self.try_acquire() {
                    Ok(Some(guard)) => Ok(Ok(guard)),
                    Ok(None) => Err(()),
                    Err(e) => Ok(Err(e)),
                }
            })
            .await;

        match outcome {
            PollOutcome::Ready { value, .. } => value.map(Some),
            PollOutcome::TimedOut { elapsed, .. } => {
                debug!(
                    path = %self.path.display(),
                    waited_ms = elapsed.as_millis() as u64,
                    "Domain lock still busy"
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick() -> PollPolicy {
        PollPolicy::new(Duration::from_millis(20), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_second_acquire_is_busy_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DomainLock::new(dir.path(), quick());

        let guard = lock.acquire().await.unwrap().expect("first acquire");
        assert!(lock.acquire().await.unwrap().is_none());

        drop(guard);
        assert!(lock.acquire().await.unwrap().is_some());
    }

    #[test]
    fn test_foreign_flock_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DomainLock::new(dir.path(), quick());

        // An independent open file description behaves like another process
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock.path())
            .unwrap();
        let foreign = Flock::lock(file, FlockArg::LockExclusiveNonblock).unwrap();

        assert!(lock.try_acquire().unwrap().is_none());

        drop(foreign);
        let guard = lock.try_acquire().unwrap().expect("lock after release");
        let pid = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(pid, std::process::id().to_string());
        drop(guard);
    }

    #[tokio::test]
    async fn test_distinct_domains_do_not_contend() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();

        let _a = DomainLock::new(a.path(), quick()).acquire().await.unwrap();
        let b = DomainLock::new(b.path(), quick()).acquire().await.unwrap();
        assert!(b.is_some());
    }
}
