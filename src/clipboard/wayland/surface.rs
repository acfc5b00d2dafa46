use anyhow::{Context, Result};
use nix::sys::memfd::{MemFdCreateFlag, memfd_create};
use nix::unistd::ftruncate;
use std::os::fd::AsFd;
use wayland_client::globals::GlobalList;
use wayland_client::protocol::{wl_buffer, wl_compositor, wl_keyboard, wl_seat, wl_shm, wl_surface};
use wayland_client::{Proxy as _, QueueHandle};
use wayland_protocols::xdg::shell::client::{xdg_surface, xdg_toplevel, xdg_wm_base};

use super::state::State;
use crate::error::SelectionError;

/// One ARGB8888 pixel
const PIXEL_BYTES: i32 = 4;

/// Mapped, invisible 1x1 toplevel.
///
/// Some compositors only send selection events to a client with a mapped,
/// focus-eligible surface. This one has an empty input region and a fully
/// transparent buffer, so it never takes pointer input or shows anything.
#[derive(Debug)]
pub struct FocusSurface {
    surface: wl_surface::WlSurface,
    xdg_surface: xdg_surface::XdgSurface,
    _toplevel: xdg_toplevel::XdgToplevel,
    buffer: wl_buffer::WlBuffer,
    _keyboard: Option<wl_keyboard::WlKeyboard>,
    configured: bool,
}

impl FocusSurface {
    pub fn create(
        globals: &GlobalList,
        seat: &wl_seat::WlSeat,
        seat_caps: wl_seat::Capability,
        qh: &QueueHandle<State>,
    ) -> Result<Self> {
        let compositor: wl_compositor::WlCompositor = globals
            .bind(qh, 1..=4, ())
            .map_err(|_| SelectionError::MissingExtension("wl_compositor"))?;
        let shm: wl_shm::WlShm = globals
            .bind(qh, 1..=1, ())
            .map_err(|_| SelectionError::MissingExtension("wl_shm"))?;
        let wm_base: xdg_wm_base::XdgWmBase = globals
            .bind(qh, 1..=2, ())
            .map_err(|_| SelectionError::MissingExtension("xdg_wm_base"))?;

        let buffer = transparent_buffer(&shm, qh)?;

        let surface = compositor.create_surface(qh, ());
        let region = compositor.create_region(qh, ());
        surface.set_input_region(Some(&region));
        region.destroy();

        let xdg_surface = wm_base.get_xdg_surface(&surface, qh, ());
        let toplevel = xdg_surface.get_toplevel(qh, ());
        toplevel.set_title("selmon".to_string());
        toplevel.set_app_id("selmon".to_string());

        // Bufferless commit; the first configure answers it
        surface.commit();

        let keyboard = if seat_caps.contains(wl_seat::Capability::Keyboard) {
            Some(seat.get_keyboard(qh, ()))
        } else {
            log::warn!("Seat has no keyboard, ownership will use serial 0");
            None
        };

        log::debug!("Created focus surface {}", surface.id());

        Ok(FocusSurface {
            surface,
            xdg_surface,
            _toplevel: toplevel,
            buffer,
            _keyboard: keyboard,
            configured: false,
        })
    }

    /// Acknowledge a configure; the first one maps the surface
    pub fn configure(&mut self, serial: u32) {
        self.xdg_surface.ack_configure(serial);
        if self.configured {
            return;
        }

        self.surface.attach(Some(&self.buffer), 0, 0);
        self.surface.damage(0, 0, 1, 1);
        self.surface.commit();
        self.configured = true;
        log::debug!("Focus surface mapped");
    }

    pub fn owns(&self, surface: &wl_surface::WlSurface) -> bool {
        self.surface == *surface
    }

    pub fn is_mapped(&self) -> bool {
        self.configured
    }
}

/// Single zeroed pixel: ARGB with alpha 0
fn transparent_buffer(
    shm: &wl_shm::WlShm,
    qh: &QueueHandle<State>,
) -> Result<wl_buffer::WlBuffer> {
    let fd = memfd_create(c"selmon-focus", MemFdCreateFlag::MFD_CLOEXEC)
        .context("Failed to create shared memory for the focus surface")?;
    ftruncate(&fd, nix::libc::off_t::from(PIXEL_BYTES))
        .context("Failed to size focus surface buffer")?;

    let pool = shm.create_pool(fd.as_fd(), PIXEL_BYTES, qh, ());
    let buffer = pool.create_buffer(0, 1, 1, PIXEL_BYTES, wl_shm::Format::Argb8888, qh, ());
    pool.destroy();
    Ok(buffer)
}
