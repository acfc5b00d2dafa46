use anyhow::{Context, Result};
use nix::unistd::{ForkResult, Pid, dup2, fork, setsid};
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Run flag flipped by termination signals.
///
/// Loops check it once per iteration; every blocking wait in the crate is
/// bounded by one tick, so a signal is noticed within that bound.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// A flag no signal is wired to
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGTERM, SIGINT and SIGHUP into a fresh flag
    pub fn install() -> Result<Self> {
        use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

        let flag = Self::new();
        for signal in [SIGTERM, SIGINT, SIGHUP] {
            signal_hook::flag::register(signal, Arc::clone(&flag.0))
                .with_context(|| format!("Failed to register handler for signal {}", signal))?;
        }
        Ok(flag)
    }

    pub fn is_running(&self) -> bool {
        !self.0.load(Ordering::Relaxed)
    }

    pub fn requested(&self) -> bool {
        !self.is_running()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Start `task` in a detached background process.
///
/// The caller gets the child's pid back immediately. The child leaves the
/// caller's session, points its standard streams at /dev/null, runs the
/// task and exits; it never returns into the caller's code path.
pub fn spawn_detached<F>(task: F) -> Result<Pid>
where
    F: FnOnce() -> Result<()>,
{
    // SAFETY: no threads exist in this process, so the child inherits a
    // consistent copy of every lock and allocator state.
    match unsafe { fork() }.context("Failed to fork")? {
        ForkResult::Parent { child } => {
            log::debug!("Spawned detached process {}", child);
            Ok(child)
        }
        ForkResult::Child => {
            let code = match detach_session().and_then(|()| task()) {
                Ok(()) => 0,
                Err(e) => {
                    log::error!("Detached process failed: {:#}", e);
                    1
                }
            };
            log::logger().flush();
            std::process::exit(code);
        }
    }
}

/// New session, root working directory, standard streams on /dev/null
fn detach_session() -> Result<()> {
    setsid().context("Failed to create a new session")?;

    std::env::set_current_dir("/").context("Failed to change directory to /")?;

    let dev_null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("Failed to open /dev/null")?;

    for stream in [
        nix::libc::STDIN_FILENO,
        nix::libc::STDOUT_FILENO,
        nix::libc::STDERR_FILENO,
    ] {
        dup2(dev_null.as_raw_fd(), stream)
            .with_context(|| format!("Failed to redirect fd {} to /dev/null", stream))?;
    }

    log::debug!("Detached into session {}", std::process::id());
    Ok(())
}
