use thiserror::Error;

/// Setup and protocol failures a caller may want to tell apart.
///
/// Everything else travels as `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// Neither `WAYLAND_DISPLAY` nor `DISPLAY` points at a display server
    #[error("no display server detected (set WAYLAND_DISPLAY or DISPLAY)")]
    NoDisplay,

    /// The display server lacks a protocol extension or global we depend on
    #[error("required protocol extension {0} is not available")]
    MissingExtension(&'static str),

    /// Wayland compositor advertised no seat to attach data devices to
    #[error("the compositor advertised no seat")]
    NoSeat,

    /// Another client kept ownership after we asked for it
    #[error("{0} ownership was refused by the display server")]
    OwnershipRefused(&'static str),
}
