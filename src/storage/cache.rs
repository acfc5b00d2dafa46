use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

/// Raw bytes of the current PRIMARY selection
pub const PRIMARY_FILE: &str = "primary";
/// Decimal change counter, rewritten after every publish
pub const SEQ_FILE: &str = "seq";
/// Process id of the running monitor daemon
pub const PID_FILE: &str = "monitor.pid";

/// File-based publish contract between a monitor daemon and its consumers.
///
/// Consumers watch the modification time of `seq` and then read `primary`,
/// so `primary` is always fully in place before `seq` changes. Both records
/// are swapped in with a rename so a reader never sees a torn write.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Open the cache directory, creating it owner-only if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();

        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .with_context(|| format!("Failed to create cache directory {:?}", dir))?;

        log::debug!("Cache directory: {:?}", dir);
        Ok(CacheStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn primary_path(&self) -> PathBuf {
        self.dir.join(PRIMARY_FILE)
    }

    pub fn seq_path(&self) -> PathBuf {
        self.dir.join(SEQ_FILE)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.join(PID_FILE)
    }

    /// Write an empty selection and the starting counter.
    ///
    /// Must run before the owning process detaches so no consumer can
    /// observe the directory without both records.
    pub fn initialize(&self, seq: u64) -> Result<()> {
        self.publish(&[], seq)?;
        log::debug!("Initialized cache at {:?} with seq {}", self.dir, seq);
        Ok(())
    }

    /// Publish selection bytes, then the counter that announces them
    pub fn publish(&self, content: &[u8], seq: u64) -> Result<()> {
        self.replace(PRIMARY_FILE, content)?;
        self.replace(SEQ_FILE, format!("{}\n", seq).as_bytes())?;
        log::trace!("Published {} bytes as seq {}", content.len(), seq);
        Ok(())
    }

    /// Record the daemon's process id
    pub fn write_pid(&self, pid: u32) -> Result<()> {
        self.replace(PID_FILE, format!("{}\n", pid).as_bytes())
    }

    pub fn read_primary(&self) -> Result<Vec<u8>> {
        let path = self.primary_path();
        fs::read(&path).with_context(|| format!("Failed to read {:?}", path))
    }

    /// Current counter, None when missing or unparseable
    pub fn read_seq(&self) -> Option<u64> {
        read_number(&self.seq_path())
    }

    /// Recorded daemon pid, None when missing or unparseable
    pub fn read_pid(&self) -> Option<u32> {
        read_number(&self.pid_path())
    }

    /// Whether the recorded daemon process still exists.
    ///
    /// Best effort only: a recycled pid reads as alive.
    pub fn daemon_alive(&self) -> bool {
        self.read_pid().is_some_and(process_alive)
    }

    /// Remove all three records. Only the clean shutdown path calls this.
    pub fn teardown(&self) {
        for name in [PRIMARY_FILE, SEQ_FILE, PID_FILE] {
            let path = self.dir.join(name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove {:?}: {}", path, e),
            }
        }
        log::debug!("Removed cache records from {:?}", self.dir);
    }

    /// Atomic write pattern: write to a hidden .tmp sibling, then rename
    fn replace(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.dir.join(name);
        let tmp_path = self.dir.join(format!(".{}.tmp", name));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)
            .with_context(|| format!("Failed to open temporary file {:?}", tmp_path))?;
        file.write_all(bytes)
            .with_context(|| format!("Failed to write temporary file {:?}", tmp_path))?;
        drop(file);

        fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", tmp_path, path))?;

        Ok(())
    }
}

/// Signal-0 liveness probe. EPERM means the process exists under another user.
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn read_number<T: std::str::FromStr>(path: &Path) -> Option<T> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::os::unix::fs::PermissionsExt;

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("cache")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_creates_owner_only_directory() {
        let (_dir, store) = store();
        let mode = fs::metadata(store.dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_initialize_writes_empty_primary_and_seq() {
        let (_dir, store) = store();
        store.initialize(42).unwrap();

        assert_eq!(store.read_primary().unwrap(), Vec::<u8>::new());
        assert_eq!(store.read_seq(), Some(42));
        assert_eq!(fs::read_to_string(store.seq_path()).unwrap(), "42\n");
    }

    #[test]
    fn test_publish_overwrites_wholesale() {
        let (_dir, store) = store();
        store.publish(b"a much longer first selection", 1).unwrap();
        store.publish(b"short", 2).unwrap();

        assert_eq!(store.read_primary().unwrap(), b"short".to_vec());
        assert_eq!(store.read_seq(), Some(2));
    }

    #[test]
    fn test_raw_bytes_survive_unescaped() {
        let (_dir, store) = store();
        let content = b"first line\nsecond\tline\r\n\x00\x07\x1b[31mred\x1b[0m\xff".to_vec();
        store.publish(&content, 7).unwrap();
        assert_eq!(store.read_primary().unwrap(), content);
    }

    #[test]
    fn test_records_are_owner_only() {
        let (_dir, store) = store();
        store.initialize(1).unwrap();
        let mode = fs::metadata(store.primary_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_no_temporary_files_left_behind() {
        let (_dir, store) = store();
        store.publish(b"text", 3).unwrap();
        store.write_pid(1234).unwrap();

        let mut names: Vec<String> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["monitor.pid", "primary", "seq"]);
    }

    #[test]
    fn test_teardown_removes_all_records() {
        let (_dir, store) = store();
        store.initialize(5).unwrap();
        store.write_pid(std::process::id()).unwrap();

        store.teardown();
        assert!(!store.primary_path().exists());
        assert!(!store.seq_path().exists());
        assert!(!store.pid_path().exists());

        // A second teardown has nothing left to remove
        store.teardown();
    }

    #[test]
    fn test_daemon_alive_tracks_pid_record() {
        let (_dir, store) = store();
        assert!(!store.daemon_alive());

        store.write_pid(std::process::id()).unwrap();
        assert_eq!(store.read_pid(), Some(std::process::id()));
        assert!(store.daemon_alive());

        fs::write(store.pid_path(), "not a pid\n").unwrap();
        assert!(!store.daemon_alive());
    }

    #[test]
    fn test_process_alive_rejects_invalid_pids() {
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
        assert!(process_alive(std::process::id()));
    }
}
