// Sniffer
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Filesystem-backed per-file mutual exclusion
//!
//! A lock is a marker file created with create-if-absent semantics inside the
//! lock directory. The marker records the holder PID, the acquisition time
//! and a random token. A marker is stale when its holder process is gone or
//! its age exceeds the lock timeout; stale markers are broken and acquisition
//! retries immediately.
//!
//! Removing a marker, whether breaking a stale one or releasing a held one,
//! requires the removal guard `<marker>.removing`, itself taken with
//! create-if-absent. The remover re-reads the marker under the guard and only
//! deletes the exact marker it judged, so a fresh marker written after a break
//! is never removed by a second breaker still holding the old verdict.
//!
//! ## Marker format (JSON)
//!
//! ```json
//! {"pid":4242,"acquired_at":"2025-06-01T12:00:00Z","token":"9f0c...","path":"/repo/src/app.py"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sniffer_common::{SnifferError, SnifferResult};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::LockConfig;

/// Contents of a lock marker file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMarker {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub token: String,
    pub path: PathBuf,
}

impl LockMarker {
    fn for_current_process(path: &Path) -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
            token: uuid::Uuid::new_v4().to_string(),
            path: path.to_path_buf(),
        }
    }

    fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Check whether a process with the given PID exists on this host
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // Signal 0 performs the permission and existence checks without delivering anything
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    // Without a portable liveness check only age-based staleness applies
    pid != 0
}

/// Lock for a single file path
#[derive(Debug, Clone)]
pub struct FileLock {
    target: PathBuf,
    marker_path: PathBuf,
    timeout: Duration,
    check_interval: Duration,
}

impl FileLock {
    /// Lock for `target`, with its marker stored under `lock_dir`
    pub fn new(lock_dir: impl AsRef<Path>, target: impl AsRef<Path>, timeout: Duration, check_interval: Duration) -> Self {
        let target = normalize_target(target.as_ref());
        let digest = blake3::hash(target.to_string_lossy().as_bytes()).to_hex();
        let marker_path = lock_dir.as_ref().join(format!("{}.lock", &digest.as_str()[..32]));
        Self {
            target,
            marker_path,
            timeout,
            check_interval,
        }
    }

    pub fn from_config(config: &LockConfig, target: impl AsRef<Path>) -> Self {
        Self::new(&config.lock_dir, target, config.file_lock_timeout(), config.check_interval())
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    /// Wait until the lock is held or the timeout elapses
    ///
    /// # Errors
    /// `LockTimeout` when the lock could not be taken within the timeout,
    /// `Io` for filesystem failures other than contention.
    pub async fn acquire(&self) -> SnifferResult<FileLockGuard> {
        if let Some(parent) = self.marker_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let started = Instant::now();
        loop {
            let marker = LockMarker::for_current_process(&self.target);
            if self.try_create(&marker).await? {
                debug!(path = %self.target.display(), "File lock acquired");
                return Ok(FileLockGuard {
                    target: self.target.clone(),
                    marker_path: self.marker_path.clone(),
                    token: marker.token,
                    stale_after: self.timeout,
                    released: false,
                });
            }

            if self.break_if_stale().await? {
                continue;
            }

            let waited = started.elapsed();
            if waited >= self.timeout {
                return Err(SnifferError::LockTimeout {
                    path: self.target.clone(),
                    waited,
                });
            }
            tokio::time::sleep(self.check_interval.min(self.timeout - waited)).await;
        }
    }

    /// Read the current marker, if any. `Ok(None)` covers both a missing
    /// marker and one that is still being written.
    pub async fn read_marker(&self) -> io::Result<Option<LockMarker>> {
        match tokio::fs::read_to_string(&self.marker_path).await {
            Ok(content) => Ok(serde_json::from_str(content.trim()).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn try_create(&self, marker: &LockMarker) -> io::Result<bool> {
        let file = tokio::fs::OpenOptions::new().write(true).create_new(true).open(&self.marker_path).await;
        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e),
        };

        let payload = serde_json::to_vec(marker).map_err(io::Error::other)?;
        if let Err(e) = async {
            file.write_all(&payload).await?;
            file.flush().await
        }
        .await
        {
            let _ = tokio::fs::remove_file(&self.marker_path).await;
            return Err(e);
        }
        Ok(true)
    }

    /// Returns true when a stale marker was removed and acquisition should retry
    async fn break_if_stale(&self) -> io::Result<bool> {
        let content = match tokio::fs::read_to_string(&self.marker_path).await {
            Ok(content) => content,
            // Released between our create attempt and this read
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e),
        };

        let reason = match serde_json::from_str::<LockMarker>(content.trim()) {
            Ok(marker) if !process_alive(marker.pid) => Some(format!("holder process {} is gone", marker.pid)),
            Ok(marker) if marker.age() > self.timeout => Some(format!("held by {} for {:?}", marker.pid, marker.age())),
            Ok(_) => None,
            // Unreadable markers may still be mid-write; only their age can condemn them
            Err(_) => match tokio::fs::metadata(&self.marker_path).await {
                Ok(meta) => {
                    let age = meta.modified().ok().and_then(|m| m.elapsed().ok()).unwrap_or(Duration::ZERO);
                    (age > self.timeout).then(|| format!("unreadable marker aged {age:?}"))
                }
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
                Err(e) => return Err(e),
            },
        };

        let Some(reason) = reason else {
            return Ok(false);
        };

        let Some(_removal) = RemovalGuard::try_take(&self.marker_path, self.timeout)? else {
            // Someone else is breaking or releasing this marker
            return Ok(false);
        };
        match std::fs::read_to_string(&self.marker_path) {
            Ok(current) if current == content => {
                std::fs::remove_file(&self.marker_path)?;
                warn!(path = %self.target.display(), reason = %reason, "Broke stale file lock");
            }
            // Replaced since it was judged; the new marker gets its own verdict
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(true)
    }
}

/// Exclusive right to remove one lock marker, dropped as soon as the removal
/// is done
#[derive(Debug)]
struct RemovalGuard {
    path: PathBuf,
}

impl RemovalGuard {
    /// `Ok(None)` while another remover holds the guard. A guard older than
    /// `stale_after` was left by a crashed remover and is cleared for the
    /// next attempt.
    fn try_take(marker_path: &Path, stale_after: Duration) -> io::Result<Option<Self>> {
        let path = marker_path.with_extension("removing");
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(Some(Self { path }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let age = std::fs::metadata(&path).ok().and_then(|meta| meta.modified().ok()).and_then(|m| m.elapsed().ok()).unwrap_or(Duration::ZERO);
                if age > stale_after {
                    warn!(guard = %path.display(), age = ?age, "Clearing abandoned lock removal guard");
                    let _ = std::fs::remove_file(&path);
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(guard = %self.path.display(), error = %e, "Failed to drop lock removal guard");
        }
    }
}

/// How long a release waits for a concurrent remover before giving up
const RELEASE_GUARD_WAIT: Duration = Duration::from_millis(250);

/// Scoped ownership of a file lock; the marker is removed on release or drop
#[derive(Debug)]
pub struct FileLockGuard {
    target: PathBuf,
    marker_path: PathBuf,
    token: String,
    stale_after: Duration,
    released: bool,
}

impl FileLockGuard {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn release(mut self) {
        self.release_marker();
    }

    fn wait_for_removal_guard(&self) -> Option<RemovalGuard> {
        let deadline = Instant::now() + RELEASE_GUARD_WAIT;
        loop {
            match RemovalGuard::try_take(&self.marker_path, self.stale_after) {
                Ok(Some(guard)) => return Some(guard),
                Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(1)),
                Ok(None) => return None,
                Err(e) => {
                    warn!(path = %self.target.display(), error = %e, "Failed to take lock removal guard");
                    return None;
                }
            }
        }
    }

    fn release_marker(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let Some(_removal) = self.wait_for_removal_guard() else {
            warn!(path = %self.target.display(), "Lock marker left in place for stale recovery");
            return;
        };

        let content = match std::fs::read_to_string(&self.marker_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %self.target.display(), "Lock marker already gone at release");
                return;
            }
            Err(e) => {
                warn!(path = %self.target.display(), error = %e, "Failed to read lock marker at release");
                return;
            }
        };

        match serde_json::from_str::<LockMarker>(content.trim()) {
            Ok(marker) if marker.token == self.token => {
                if let Err(e) = std::fs::remove_file(&self.marker_path) {
                    if e.kind() == ErrorKind::NotFound {
                        warn!(path = %self.target.display(), "Lock marker already gone at release");
                    } else {
                        warn!(path = %self.target.display(), error = %e, "Failed to remove lock marker");
                    }
                } else {
                    debug!(path = %self.target.display(), "File lock released");
                }
            }
            _ => {
                warn!(path = %self.target.display(), "Lock marker now belongs to another holder; leaving it in place");
            }
        }
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        self.release_marker();
    }
}

fn normalize_target(target: &Path) -> PathBuf {
    std::fs::canonicalize(target)
        .or_else(|_| std::path::absolute(target))
        .unwrap_or_else(|_| target.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lock_in(dir: &Path, target: &str, timeout_ms: u64) -> FileLock {
        FileLock::new(dir.join("locks"), dir.join(target), Duration::from_millis(timeout_ms), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), "a.py", 500);

        let guard = lock.acquire().await.unwrap();
        let marker = lock.read_marker().await.unwrap().unwrap();
        assert_eq!(marker.pid, std::process::id());
        assert_eq!(marker.token, guard.token());

        guard.release();
        assert!(!lock.marker_path().exists());
    }

    #[tokio::test]
    async fn test_second_acquirer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), "a.py", 100);

        let _held = lock.acquire().await.unwrap();
        let started = Instant::now();
        let err = lock_in(dir.path(), "a.py", 100).acquire().await.unwrap_err();
        assert!(matches!(err, SnifferError::LockTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), "a.py", 500);
        {
            let _guard = lock.acquire().await.unwrap();
            assert!(lock.marker_path().exists());
        }
        assert!(!lock.marker_path().exists());
        lock.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_holder_is_broken_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let check_interval = Duration::from_millis(200);
        let lock = FileLock::new(dir.path().join("locks"), dir.path().join("a.py"), Duration::from_secs(5), check_interval);
        std::fs::create_dir_all(lock.marker_path().parent().unwrap()).unwrap();

        let dead = LockMarker {
            pid: 0x7fff_fff0,
            acquired_at: Utc::now(),
            token: "dead".to_string(),
            path: lock.target().to_path_buf(),
        };
        std::fs::write(lock.marker_path(), serde_json::to_vec(&dead).unwrap()).unwrap();

        let started = Instant::now();
        let guard = lock.acquire().await.unwrap();
        // Recovered without sitting out a single check interval
        assert!(started.elapsed() < check_interval);
        assert_ne!(guard.token(), "dead");
        assert!(!lock.marker_path().with_extension("removing").exists());
    }

    #[tokio::test]
    async fn test_old_marker_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), "a.py", 200);
        std::fs::create_dir_all(lock.marker_path().parent().unwrap()).unwrap();

        let old = LockMarker {
            pid: std::process::id(),
            acquired_at: Utc::now() - chrono::Duration::seconds(60),
            token: "old".to_string(),
            path: lock.target().to_path_buf(),
        };
        std::fs::write(lock.marker_path(), serde_json::to_vec(&old).unwrap()).unwrap();

        let guard = lock.acquire().await.unwrap();
        assert_ne!(guard.token(), "old");
    }

    #[tokio::test]
    async fn test_release_with_missing_marker_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), "a.py", 500);
        let guard = lock.acquire().await.unwrap();
        std::fs::remove_file(lock.marker_path()).unwrap();
        guard.release();
    }

    #[tokio::test]
    async fn test_release_keeps_foreign_marker() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), "a.py", 500);
        let guard = lock.acquire().await.unwrap();

        let foreign = LockMarker::for_current_process(lock.target());
        std::fs::write(lock.marker_path(), serde_json::to_vec(&foreign).unwrap()).unwrap();
        guard.release();
        assert!(lock.marker_path().exists());
    }

    #[tokio::test]
    async fn test_equivalent_paths_share_a_marker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let direct = lock_in(dir.path(), "a.py", 500);
        let dotted = lock_in(dir.path(), "./a.py", 500);
        assert_eq!(direct.marker_path(), dotted.marker_path());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquirers_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let holders = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock_in(dir.path(), "shared.py", 5_000);
            let holders = holders.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let guard = lock.acquire().await.unwrap();
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
                guard.release();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_racing_breakers_admit_a_single_holder() {
        let dir = tempfile::tempdir().unwrap();

        for round in 0..100 {
            let target = dir.path().join(format!("race-{round}.py"));
            let seed = FileLock::new(dir.path().join("locks"), &target, Duration::from_secs(5), Duration::from_millis(2));
            std::fs::create_dir_all(seed.marker_path().parent().unwrap()).unwrap();
            let dead = LockMarker {
                pid: 0x7fff_fff0,
                acquired_at: Utc::now(),
                token: format!("dead-{round}"),
                path: seed.target().to_path_buf(),
            };
            std::fs::write(seed.marker_path(), serde_json::to_vec(&dead).unwrap()).unwrap();

            let start = Arc::new(tokio::sync::Barrier::new(8));
            let holders = Arc::new(AtomicUsize::new(0));
            let max_seen = Arc::new(AtomicUsize::new(0));
            let mut handles = Vec::new();
            for _ in 0..8 {
                let lock = seed.clone();
                let (start, holders, max_seen) = (start.clone(), holders.clone(), max_seen.clone());
                handles.push(tokio::spawn(async move {
                    start.wait().await;
                    let guard = lock.acquire().await.unwrap();
                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    holders.fetch_sub(1, Ordering::SeqCst);
                    guard.release();
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            assert_eq!(max_seen.load(Ordering::SeqCst), 1, "two holders in round {round}");
            assert!(!seed.marker_path().exists());
            assert!(!seed.marker_path().with_extension("removing").exists());
        }
    }
}
