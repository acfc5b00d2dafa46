//! selmon - PRIMARY selection monitor and clipboard helper
//!
//! Tracks the highlighted-text selection on X11, Wayland and XWayland
//! sessions and publishes it to a small file cache, so shells can read it
//! without spawning a clipboard tool.

pub mod cli;
pub mod clipboard;
pub mod error;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod process;
pub mod storage;
