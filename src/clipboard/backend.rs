use anyhow::Result;

use crate::models::SelectionKind;
use crate::monitor::Monitor;
use crate::process::{self, ShutdownFlag};

/// Trait for selection backend abstraction
/// Implemented once for the X protocol (native X11 and XWayland displays)
/// and once for Wayland
pub trait SelectionBackend {
    /// Get the backend name (for logging/debugging)
    fn name(&self) -> &'static str;

    /// Read the current content of a selection.
    /// Ok(None) means no owner, no text, or an owner that did not answer in time.
    fn read_selection(&mut self, kind: SelectionKind) -> Result<Option<Vec<u8>>>;

    /// Read the highlighted-text selection
    fn read_primary(&mut self) -> Result<Option<Vec<u8>>> {
        self.read_selection(SelectionKind::Primary)
    }

    /// Read the explicit clipboard
    fn read_clipboard(&mut self) -> Result<Option<Vec<u8>>> {
        self.read_selection(SelectionKind::Clipboard)
    }

    /// Tell the display server PRIMARY has no owner any more
    fn clear_primary(&mut self) -> Result<()>;

    /// Take clipboard ownership for `data`; requests are answered later by `serve_clipboard`
    fn claim_clipboard(&mut self, data: Vec<u8>) -> Result<()>;

    /// Answer paste requests until superseded, idle (where applicable) or signaled
    fn serve_clipboard(&mut self, shutdown: &ShutdownFlag) -> Result<()>;

    /// Register for ownership-change events before the daemon detaches,
    /// so setup failures still reach the caller as an exit code
    fn prepare_daemon(&mut self) -> Result<()>;

    /// Publish every PRIMARY ownership change until the monitor is told to stop
    fn run_daemon(&mut self, monitor: &mut Monitor) -> Result<()>;

    /// Take clipboard ownership, then hand serving over to a detached
    /// process. Returns as soon as the server is running.
    fn write_clipboard(&mut self, data: Vec<u8>) -> Result<()> {
        let len = data.len();
        self.claim_clipboard(data)?;

        let pid = process::spawn_detached(|| {
            let shutdown = ShutdownFlag::install()?;
            self.serve_clipboard(&shutdown)
        })?;

        log::info!("{} clipboard server {} holds {} bytes", self.name(), pid, len);
        Ok(())
    }
}
