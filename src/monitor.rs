use anyhow::Result;

use crate::process::ShutdownFlag;
use crate::storage::CacheStore;

/// State of one running monitor daemon.
///
/// Owns the cache store, the change counter and the shutdown flag, and is
/// threaded explicitly through a backend's event loop.
pub struct Monitor {
    cache: CacheStore,
    seq: u64,
    shutdown: ShutdownFlag,
    published: u64,
}

impl Monitor {
    /// Seed the counter from the wall clock and write the initial records.
    ///
    /// Milliseconds keep a fresh daemon's counter above anything a previous
    /// instance could have reached, so a consumer holding stale state still
    /// sees the first publish as new.
    pub fn start(cache: CacheStore) -> Result<Self> {
        let seed = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        Self::start_at(cache, seed)
    }

    pub fn start_at(cache: CacheStore, seed: u64) -> Result<Self> {
        cache.initialize(seed)?;
        Ok(Monitor {
            cache,
            seq: seed,
            shutdown: ShutdownFlag::new(),
            published: 0,
        })
    }

    /// Replace the flag loops check, normally with one wired to signals
    pub fn set_shutdown(&mut self, shutdown: ShutdownFlag) {
        self.shutdown = shutdown;
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_running()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Publish the outcome of settling `events` ownership changes.
    ///
    /// The counter moves even when the content is identical to the last
    /// publish: reselecting the same text is still a new event. A failed or
    /// ownerless read publishes an empty record.
    pub fn publish(&mut self, content: Option<&[u8]>, events: u64) -> Result<u64> {
        self.seq = self.seq.saturating_add(events.max(1));
        let bytes = content.unwrap_or_default();
        self.cache.publish(bytes, self.seq)?;
        self.published += 1;

        log::debug!(
            "Published {} bytes as seq {} ({} event(s))",
            bytes.len(),
            self.seq,
            events.max(1)
        );
        Ok(self.seq)
    }

    /// Remove the cache records, but only on a signal-driven shutdown.
    /// After a protocol failure the files stay and the dead pid tells
    /// consumers they are stale.
    pub fn finish(self) {
        if self.shutdown.requested() {
            log::info!("Shutting down after {} publishes", self.published);
            self.cache.teardown();
        } else {
            log::warn!("Monitor stopped without a shutdown request, leaving cache records");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn monitor(seed: u64) -> (tempfile::TempDir, Monitor) {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();
        (dir, Monitor::start_at(cache, seed).unwrap())
    }

    #[test]
    fn test_start_initializes_records() {
        let (_dir, monitor) = monitor(1000);
        assert_eq!(monitor.cache().read_seq(), Some(1000));
        assert_eq!(monitor.cache().read_primary().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_start_seeds_from_clock() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = Monitor::start(CacheStore::open(dir.path()).unwrap()).unwrap();
        // Any date after 2020-01-01 in milliseconds
        assert!(monitor.seq() > 1_577_836_800_000);
    }

    #[test]
    fn test_identical_content_still_bumps_seq() {
        let (_dir, mut monitor) = monitor(10);
        let mut last = monitor.seq();

        for _ in 0..5 {
            let seq = monitor.publish(Some(b"same text"), 1).unwrap();
            assert!(seq > last);
            assert_eq!(monitor.cache().read_seq(), Some(seq));
            last = seq;
        }
        assert_eq!(monitor.cache().read_primary().unwrap(), b"same text".to_vec());
    }

    #[test]
    fn test_coalesced_events_advance_per_event() {
        let (_dir, mut monitor) = monitor(10);
        assert_eq!(monitor.publish(Some(b"a"), 3).unwrap(), 13);
        assert_eq!(monitor.publish(Some(b"b"), 0).unwrap(), 14);
    }

    #[test]
    fn test_counter_saturates_instead_of_wrapping() {
        let (_dir, mut monitor) = monitor(u64::MAX - 1);
        assert_eq!(monitor.publish(Some(b"a"), 5).unwrap(), u64::MAX);
        assert_eq!(monitor.publish(Some(b"b"), 1).unwrap(), u64::MAX);
        assert_eq!(monitor.cache().read_seq(), Some(u64::MAX));
    }

    #[test]
    fn test_failed_read_publishes_empty() {
        let (_dir, mut monitor) = monitor(10);
        monitor.publish(Some(b"selected"), 1).unwrap();
        monitor.publish(None, 1).unwrap();
        assert_eq!(monitor.cache().read_primary().unwrap(), Vec::<u8>::new());
        assert_eq!(monitor.cache().read_seq(), Some(12));
    }

    #[test]
    fn test_finish_after_signal_tears_down() {
        let (_dir, mut monitor) = monitor(10);
        monitor.cache().write_pid(std::process::id()).unwrap();
        let cache = monitor.cache().clone();

        let flag = ShutdownFlag::new();
        monitor.set_shutdown(flag.clone());
        flag.request();
        assert!(!monitor.is_running());
        monitor.finish();

        assert!(!cache.primary_path().exists());
        assert!(!cache.seq_path().exists());
        assert!(!cache.pid_path().exists());
    }

    #[test]
    fn test_sigterm_tears_down_records() {
        use nix::sys::signal::{Signal, raise};

        let (_dir, mut monitor) = monitor(10);
        monitor.cache().write_pid(std::process::id()).unwrap();
        let cache = monitor.cache().clone();

        monitor.set_shutdown(ShutdownFlag::install().unwrap());
        assert!(monitor.is_running());

        raise(Signal::SIGTERM).unwrap();
        assert!(!monitor.is_running());
        monitor.finish();

        assert!(!cache.primary_path().exists());
        assert!(!cache.seq_path().exists());
        assert!(!cache.pid_path().exists());
    }

    #[test]
    fn test_finish_without_signal_keeps_records() {
        let (_dir, monitor) = monitor(10);
        let cache = monitor.cache().clone();
        monitor.finish();
        assert!(cache.seq_path().exists());
    }
}
