pub mod backend;
pub mod backoff;
pub mod io;
pub mod wayland;
pub mod x11;

use anyhow::Result;
use std::env;

use crate::error::SelectionError;
use crate::storage::Config;

pub use backend::SelectionBackend;
pub use wayland::WaylandBackend;
pub use x11::{X11Backend, X11Flavor};

/// Which protocol a binary speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Decide from the session environment
    Auto,
    X11,
    XWayland,
    Wayland,
}

/// Pick a backend from which display variables are present.
///
/// A Wayland session that also exposes an X display goes through the X
/// protocol: ownership notifications are uniformly supported there and
/// need no focus surface.
pub fn detect_from(wayland: bool, x: bool) -> Result<BackendKind, SelectionError> {
    match (wayland, x) {
        (true, true) => Ok(BackendKind::XWayland),
        (true, false) => Ok(BackendKind::Wayland),
        (false, true) => Ok(BackendKind::X11),
        (false, false) => Err(SelectionError::NoDisplay),
    }
}

fn env_set(name: &str) -> bool {
    env::var_os(name).is_some_and(|v| !v.is_empty())
}

/// Resolve `Auto` against the current environment
pub fn detect_backend() -> Result<BackendKind, SelectionError> {
    detect_from(env_set("WAYLAND_DISPLAY"), env_set("DISPLAY"))
}

/// Create a selection backend for the requested display server
pub fn create_backend(kind: BackendKind, config: &Config) -> Result<Box<dyn SelectionBackend>> {
    let kind = match kind {
        BackendKind::Auto => detect_backend()?,
        explicit => explicit,
    };

    let backend: Box<dyn SelectionBackend> = match kind {
        BackendKind::Wayland => Box::new(WaylandBackend::connect(config)?),
        BackendKind::XWayland => Box::new(X11Backend::connect(X11Flavor::XWayland, config)?),
        BackendKind::X11 | BackendKind::Auto => {
            Box::new(X11Backend::connect(X11Flavor::Native, config)?)
        }
    };

    log::debug!("Using {} selection backend", backend.name());
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_prefers_x_protocol_on_wayland_with_x() {
        assert_eq!(detect_from(true, true).unwrap(), BackendKind::XWayland);
    }

    #[test]
    fn test_detect_single_display() {
        assert_eq!(detect_from(true, false).unwrap(), BackendKind::Wayland);
        assert_eq!(detect_from(false, true).unwrap(), BackendKind::X11);
    }

    #[test]
    fn test_detect_nothing_is_setup_failure() {
        assert!(matches!(
            detect_from(false, false),
            Err(SelectionError::NoDisplay)
        ));
    }
}
