//! Directory-based coordination lock
//!
//! # Layout
//!
//! - `coordination.lock`: exclusive `flock`, held from acquire until release
//! - `owner.pid`: pid of the current owner, replaced atomically on promotion
//! - `<pid>.sock`: the owner's handoff socket, bound by its [`Upgrader`](crate::Upgrader)

use super::{Coordinator, Predecessor};
use crate::error::{HandoverError, Phase, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const LOCK_FILE: &str = "coordination.lock";
const OWNER_FILE: &str = "owner.pid";

/// Who owns a coordination directory right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerStatus {
    /// Owner process is alive
    Running { pid: u32 },
    /// Owner pid recorded but the process is gone
    Stale { pid: u32 },
    /// No owner recorded yet
    NotRunning,
}

/// Held `flock` on a coordination directory
///
/// Dropping the handle unlocks too, so a crashed handoff never wedges the chain.
pub struct FileLockHandle {
    dir: PathBuf,
    lock: Flock<File>,
}

impl FileLockHandle {
    /// Coordination directory this handle locks
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl fmt::Debug for FileLockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLockHandle")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

/// Coordinator backed by a lock file, a pid file and per-owner Unix sockets
#[derive(Debug, Clone)]
pub struct FileCoordinator {
    pid: u32,
}

impl Default for FileCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl FileCoordinator {
    /// Coordinator acting for the current process
    pub fn new() -> Self {
        Self::with_pid(std::process::id())
    }

    /// Coordinator acting for an explicit pid
    pub fn with_pid(pid: u32) -> Self {
        Self { pid }
    }

    /// Pid this coordinator records on promotion
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Where this process's handoff socket lives in `dir`
    pub fn socket_path(&self, dir: &Path) -> PathBuf {
        owner_socket_path(dir, self.pid)
    }

    /// Pid recorded as owner of `dir`, if any
    pub fn owner_pid(dir: &Path) -> Result<Option<u32>> {
        let contents = match fs::read_to_string(dir.join(OWNER_FILE)) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(HandoverError::lock(
                    Phase::Connect,
                    format!("failed to read owner file: {}", e),
                ))
            }
        };

        match contents.trim().parse() {
            Ok(pid) => Ok(Some(pid)),
            Err(e) => {
                warn!("Ignoring invalid owner pid {:?}: {}", contents.trim(), e);
                Ok(None)
            }
        }
    }

    /// Status of the owner of `dir`
    pub fn owner_status(dir: &Path) -> Result<OwnerStatus> {
        Ok(match Self::owner_pid(dir)? {
            None => OwnerStatus::NotRunning,
            Some(pid) if is_process_running(pid) => OwnerStatus::Running { pid },
            Some(pid) => OwnerStatus::Stale { pid },
        })
    }
}

impl Coordinator for FileCoordinator {
    type Handle = FileLockHandle;
    type Channel = UnixStream;

    fn acquire_or_join(&self, dir: &Path) -> Result<FileLockHandle> {
        ensure_directory(dir)?;

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(dir.join(LOCK_FILE))
            .map_err(|e| {
                HandoverError::lock(Phase::Acquire, format!("failed to open lock file: {}", e))
            })?;

        debug!("Waiting for coordination lock in {}", dir.display());
        let lock = loop {
            match Flock::lock(file, FlockArg::LockExclusive) {
                Ok(lock) => break lock,
                Err((returned, Errno::EINTR)) => file = returned,
                Err((_, errno)) => {
                    return Err(HandoverError::lock(
                        Phase::Acquire,
                        format!("failed to lock coordination directory: {}", errno),
                    ))
                }
            }
        };
        info!("Locked coordination directory {}", dir.display());

        Ok(FileLockHandle {
            dir: dir.to_path_buf(),
            lock,
        })
    }

    fn connect_predecessor(&self, handle: &mut FileLockHandle) -> Result<Predecessor<UnixStream>> {
        let Some(pid) = Self::owner_pid(&handle.dir)? else {
            debug!("No owner recorded in {}", handle.dir.display());
            return Ok(Predecessor::NotFound);
        };

        if pid == self.pid {
            warn!("Owner file names this process ({}), nothing to inherit", pid);
            return Ok(Predecessor::NotFound);
        }
        if !is_process_running(pid) {
            warn!("Found stale owner pid {}, starting fresh", pid);
            return Ok(Predecessor::NotFound);
        }

        let socket_path = owner_socket_path(&handle.dir, pid);
        // A live owner that cannot be reached still holds its listeners, so
        // starting fresh here would leave two owners.
        match UnixStream::connect(&socket_path) {
            Ok(stream) => {
                info!("Connected to predecessor {} at {}", pid, socket_path.display());
                Ok(Predecessor::Connected(stream))
            }
            Err(e) => {
                error!(
                    "Owner {} is alive but not accepting handoffs at {}: {}",
                    pid,
                    socket_path.display(),
                    e
                );
                Err(HandoverError::lock(
                    Phase::Connect,
                    format!(
                        "owner {} is running but unreachable at {}: {}",
                        pid,
                        socket_path.display(),
                        e
                    ),
                ))
            }
        }
    }

    fn promote_to_owner(&self, handle: &mut FileLockHandle) -> Result<()> {
        let owner_path = handle.dir.join(OWNER_FILE);
        let temp_path = handle.dir.join(format!("{}.{}.tmp", OWNER_FILE, self.pid));

        fs::write(&temp_path, self.pid.to_string())
            .and_then(|_| fs::rename(&temp_path, &owner_path))
            .map_err(|e| {
                let _ = fs::remove_file(&temp_path);
                HandoverError::lock(Phase::Promote, format!("failed to write owner file: {}", e))
            })?;

        info!("Process {} is now the owner of {}", self.pid, handle.dir.display());
        Ok(())
    }

    fn release(&self, handle: FileLockHandle) -> Result<()> {
        let FileLockHandle { dir, lock } = handle;
        lock.unlock().map_err(|(_, errno)| {
            HandoverError::lock(
                Phase::Release,
                format!("failed to unlock {}: {}", dir.display(), errno),
            )
        })?;
        debug!("Released coordination lock on {}", dir.display());
        Ok(())
    }
}

fn owner_socket_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("{}.sock", pid))
}

fn ensure_directory(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| {
        HandoverError::lock(
            Phase::Acquire,
            format!("failed to create coordination directory: {}", e),
        )
    })?;

    // Owner-only: the sockets in here hand out live listeners.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o700);
        fs::set_permissions(dir, perms).map_err(|e| {
            HandoverError::lock(
                Phase::Acquire,
                format!("failed to set directory permissions: {}", e),
            )
        })?;
    }

    Ok(())
}

/// Check if a process is running
fn is_process_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks existence and permissions.
    kill(Pid::from_raw(raw), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("coord");
        let coordinator = FileCoordinator::new();

        let handle = coordinator.acquire_or_join(&dir).unwrap();
        assert!(dir.join(LOCK_FILE).exists());
        assert_eq!(handle.dir(), dir.as_path());
        coordinator.release(handle).unwrap();
    }

    #[test]
    fn test_no_owner_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = FileCoordinator::new();

        let mut handle = coordinator.acquire_or_join(temp_dir.path()).unwrap();
        assert!(matches!(
            coordinator.connect_predecessor(&mut handle).unwrap(),
            Predecessor::NotFound
        ));
        assert_eq!(
            FileCoordinator::owner_status(temp_dir.path()).unwrap(),
            OwnerStatus::NotRunning
        );
    }

    #[test]
    fn test_stale_owner_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(OWNER_FILE), "99999").unwrap();
        let coordinator = FileCoordinator::new();

        let mut handle = coordinator.acquire_or_join(temp_dir.path()).unwrap();
        assert!(matches!(
            coordinator.connect_predecessor(&mut handle).unwrap(),
            Predecessor::NotFound
        ));
        assert_eq!(
            FileCoordinator::owner_status(temp_dir.path()).unwrap(),
            OwnerStatus::Stale { pid: 99999 }
        );
    }

    #[test]
    fn test_live_owner_without_socket_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let owner = FileCoordinator::new();
        let successor = FileCoordinator::with_pid(owner.pid() + 1);

        let mut handle = owner.acquire_or_join(temp_dir.path()).unwrap();
        owner.promote_to_owner(&mut handle).unwrap();
        owner.release(handle).unwrap();

        let mut handle = successor.acquire_or_join(temp_dir.path()).unwrap();
        let err = successor.connect_predecessor(&mut handle).err().unwrap();
        assert!(matches!(
            err,
            HandoverError::Lock {
                phase: Phase::Connect,
                ..
            }
        ));
    }

    #[test]
    fn test_live_owner_refusing_connections_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let owner = FileCoordinator::new();
        let successor = FileCoordinator::with_pid(owner.pid() + 1);

        // Socket file left behind with nobody listening on it.
        drop(UnixListener::bind(owner.socket_path(temp_dir.path())).unwrap());

        let mut handle = owner.acquire_or_join(temp_dir.path()).unwrap();
        owner.promote_to_owner(&mut handle).unwrap();
        owner.release(handle).unwrap();

        let mut handle = successor.acquire_or_join(temp_dir.path()).unwrap();
        let err = successor.connect_predecessor(&mut handle).err().unwrap();
        assert_eq!(err.phase(), Some(Phase::Connect));
    }

    #[test]
    fn test_connects_to_live_owner_socket() {
        let temp_dir = TempDir::new().unwrap();
        let owner = FileCoordinator::new();
        let _listener = UnixListener::bind(owner.socket_path(temp_dir.path())).unwrap();

        let mut handle = owner.acquire_or_join(temp_dir.path()).unwrap();
        owner.promote_to_owner(&mut handle).unwrap();
        owner.release(handle).unwrap();

        let successor = FileCoordinator::with_pid(owner.pid() + 1);
        let mut handle = successor.acquire_or_join(temp_dir.path()).unwrap();
        assert!(matches!(
            successor.connect_predecessor(&mut handle).unwrap(),
            Predecessor::Connected(_)
        ));
    }

    #[test]
    fn test_promote_writes_owner_pid() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = FileCoordinator::with_pid(4242);

        let mut handle = coordinator.acquire_or_join(temp_dir.path()).unwrap();
        coordinator.promote_to_owner(&mut handle).unwrap();

        assert_eq!(FileCoordinator::owner_pid(temp_dir.path()).unwrap(), Some(4242));
        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_invalid_owner_pid_ignored() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(OWNER_FILE), "not-a-pid").unwrap();
        assert_eq!(FileCoordinator::owner_pid(temp_dir.path()).unwrap(), None);
    }

    #[test]
    fn test_lock_is_exclusive_until_release() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();
        let first = FileCoordinator::new();
        let handle = first.acquire_or_join(&dir).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = std::thread::spawn(move || {
            let second = FileCoordinator::with_pid(1);
            let handle = second.acquire_or_join(&dir).unwrap();
            tx.send(()).unwrap();
            second.release(handle).unwrap();
        });

        // flock locks belong to the open file description, so a second open
        // in the same process still blocks.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        first.release(handle).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }
}
