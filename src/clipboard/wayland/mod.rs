mod state;
mod surface;

use anyhow::{Context, Result, bail};
use nix::unistd::pipe;
use std::env;
use std::io::ErrorKind;
use std::os::fd::AsFd;
use std::time::{Duration, Instant};
use wayland_client::backend::WaylandError;
use wayland_client::globals::{GlobalList, registry_queue_init};
use wayland_client::protocol::{wl_data_device, wl_data_device_manager, wl_seat};
use wayland_client::{Connection, EventQueue, QueueHandle};
use wayland_protocols::wp::primary_selection::zv1::client::{
    zwp_primary_selection_device_manager_v1, zwp_primary_selection_device_v1,
};

use self::state::{Offer, ServedSource, State};
use self::surface::FocusSurface;
use super::backend::SelectionBackend;
use super::io::{read_pipe, wait_readable};
use crate::error::SelectionError;
use crate::models::{SelectionKind, TEXT_MIME_TYPES, pick_text_mime};
use crate::monitor::Monitor;
use crate::process::ShutdownFlag;
use crate::storage::{Config, TimingConfig};

/// Wayland backend: primary-selection protocol for PRIMARY, core data
/// device for the clipboard
pub struct WaylandBackend {
    conn: Connection,
    queue: EventQueue<State>,
    qh: QueueHandle<State>,
    globals: GlobalList,
    state: State,
    seat: wl_seat::WlSeat,
    data_manager: wl_data_device_manager::WlDataDeviceManager,
    data_device: wl_data_device::WlDataDevice,
    primary_device: Option<zwp_primary_selection_device_v1::ZwpPrimarySelectionDeviceV1>,
    timing: TimingConfig,
    max_selection_bytes: usize,
}

impl WaylandBackend {
    /// Connect, bind the seat and data devices, and collect the selection
    /// state the compositor announces on the first round trip
    pub fn connect(config: &Config) -> Result<Self> {
        if env::var_os("WAYLAND_DISPLAY").is_none() && env::var_os("WAYLAND_SOCKET").is_none() {
            return Err(SelectionError::NoDisplay.into());
        }

        let conn = Connection::connect_to_env().context("Failed to connect to the compositor")?;
        let (globals, mut queue) =
            registry_queue_init::<State>(&conn).context("Failed to read the Wayland registry")?;
        let qh = queue.handle();

        let seat: wl_seat::WlSeat = globals
            .bind(&qh, 1..=7, ())
            .map_err(|_| SelectionError::NoSeat)?;
        let data_manager: wl_data_device_manager::WlDataDeviceManager = globals
            .bind(&qh, 1..=3, ())
            .map_err(|_| SelectionError::MissingExtension("wl_data_device_manager"))?;
        let data_device = data_manager.get_data_device(&seat, &qh, ());

        let primary_device = match globals
            .bind::<zwp_primary_selection_device_manager_v1::ZwpPrimarySelectionDeviceManagerV1, _, _>(
                &qh,
                1..=1,
                (),
            ) {
            Ok(manager) => Some(manager.get_device(&seat, &qh, ())),
            Err(e) => {
                log::debug!("No primary selection support: {}", e);
                None
            }
        };

        let mut state = State::new(config.timing.pipe_first_timeout());
        queue
            .roundtrip(&mut state)
            .context("Initial Wayland round trip failed")?;

        log::debug!(
            "Wayland backend connected (primary events {}, clipboard events {})",
            state.primary.events,
            state.clipboard.events
        );

        Ok(WaylandBackend {
            conn,
            queue,
            qh,
            globals,
            state,
            seat,
            data_manager,
            data_device,
            primary_device,
            timing: config.timing.clone(),
            max_selection_bytes: config.limits.max_selection_bytes,
        })
    }

    fn primary_device(&self) -> Result<&zwp_primary_selection_device_v1::ZwpPrimarySelectionDeviceV1> {
        self.primary_device
            .as_ref()
            .ok_or_else(|| SelectionError::MissingExtension("zwp_primary_selection_device_manager_v1").into())
    }

    /// Dispatch what is queued, then wait at most `timeout` for the socket
    /// and dispatch whatever arrived.
    ///
    /// prepare_read before polling: another reader could otherwise move
    /// events into our queue between the dispatch and the poll, and we
    /// would sleep on an empty socket with work pending.
    fn pump(&mut self, timeout: Duration) -> Result<()> {
        self.queue.dispatch_pending(&mut self.state)?;
        self.queue.flush().context("Failed to flush Wayland requests")?;

        if let Some(guard) = self.queue.prepare_read() {
            if wait_readable(guard.connection_fd(), timeout)? {
                match guard.read() {
                    Ok(_) => {}
                    Err(WaylandError::Io(e)) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e).context("Wayland connection lost"),
                }
            }
        }

        self.queue.dispatch_pending(&mut self.state)?;
        Ok(())
    }

    fn ensure_focus_surface(&mut self) -> Result<()> {
        if self.state.focus.is_some() {
            return Ok(());
        }

        let focus = FocusSurface::create(&self.globals, &self.seat, self.state.seat_caps, &self.qh)?;
        self.state.focus = Some(focus);
        self.conn.flush().context("Failed to flush Wayland requests")?;
        Ok(())
    }

    /// Serial for ownership requests: the focus surface's latest keyboard
    /// serial, or 0 when none shows up in time
    fn input_serial(&mut self) -> Result<u32> {
        self.ensure_focus_surface()?;

        let deadline = Instant::now() + self.timing.serial_wait();
        while self.state.keyboard_serial.is_none() && Instant::now() < deadline {
            self.pump(self.timing.tick())?;
        }

        let mapped = self.state.focus.as_ref().is_some_and(FocusSurface::is_mapped);
        Ok(self.state.keyboard_serial.unwrap_or_else(|| {
            log::debug!("No keyboard serial (surface mapped: {}), using 0", mapped);
            0
        }))
    }

    fn read_offer(&self, offer: &Offer) -> Result<Option<Vec<u8>>> {
        let mimes = offer.mime_types();
        let Some(mime) = pick_text_mime(&mimes) else {
            log::debug!("Offer has no text type among {:?}", mimes);
            return Ok(None);
        };

        let (read, write) = pipe().context("Failed to create transfer pipe")?;
        offer.receive(mime, write.as_fd());
        self.conn.flush().context("Failed to flush Wayland requests")?;
        // Only the owner may hold the write end, or EOF never comes
        drop(write);

        let data = read_pipe(
            read,
            self.max_selection_bytes,
            self.timing.pipe_first_timeout(),
            self.timing.pipe_next_timeout(),
        )?;
        Ok((!data.is_empty()).then_some(data))
    }

    fn read_current(&self, kind: SelectionKind) -> Result<Option<Vec<u8>>> {
        match self.state.slot(kind).offer.clone() {
            Some(offer) => self.read_offer(&offer),
            None => Ok(None),
        }
    }
}

impl SelectionBackend for WaylandBackend {
    fn name(&self) -> &'static str {
        "Wayland"
    }

    fn read_selection(&mut self, kind: SelectionKind) -> Result<Option<Vec<u8>>> {
        if kind == SelectionKind::Primary {
            self.primary_device()?;
        }

        if self.state.slot(kind).events == 0 {
            log::debug!("No {} event after the first round trip, mapping focus surface", kind);
            self.ensure_focus_surface()?;

            let deadline = Instant::now() + self.timing.focus_wait();
            while self.state.slot(kind).events == 0 && Instant::now() < deadline {
                self.pump(self.timing.tick())?;
            }
        }

        self.read_current(kind)
    }

    fn clear_primary(&mut self) -> Result<()> {
        let device = self.primary_device()?.clone();
        let serial = self.input_serial()?;

        device.set_selection(None, serial);
        self.queue
            .roundtrip(&mut self.state)
            .context("Wayland round trip failed")?;
        log::debug!("Cleared primary selection (serial {})", serial);
        Ok(())
    }

    fn claim_clipboard(&mut self, data: Vec<u8>) -> Result<()> {
        let serial = self.input_serial()?;

        let source = self.data_manager.create_data_source(&self.qh, ());
        for mime in TEXT_MIME_TYPES {
            source.offer(mime.to_string());
        }
        self.data_device.set_selection(Some(&source), serial);
        self.state.source = Some(ServedSource::new(source, data));

        self.queue
            .roundtrip(&mut self.state)
            .context("Wayland round trip failed")?;

        if self.state.source.as_ref().is_some_and(|s| s.cancelled) {
            return Err(SelectionError::OwnershipRefused("clipboard").into());
        }
        Ok(())
    }

    fn serve_clipboard(&mut self, shutdown: &ShutdownFlag) -> Result<()> {
        if self.state.source.is_none() {
            bail!("serve_clipboard called without a claimed clipboard");
        }

        while shutdown.is_running() {
            if let Some(served) = self.state.source.as_ref().filter(|s| s.cancelled) {
                log::info!("Clipboard superseded after {} paste(s)", served.sends);
                return Ok(());
            }
            self.pump(self.timing.tick())?;
        }

        if let Some(served) = self.state.source.take() {
            served.source().destroy();
        }
        log::info!("Clipboard server stopped by signal");
        Ok(())
    }

    fn prepare_daemon(&mut self) -> Result<()> {
        self.primary_device()?;
        self.ensure_focus_surface()
    }

    fn run_daemon(&mut self, monitor: &mut Monitor) -> Result<()> {
        let mut last = self.read_current(SelectionKind::Primary)?;
        monitor.publish(last.as_deref(), 1)?;
        let mut handled = self.state.primary.events;

        while monitor.is_running() {
            self.pump(self.timing.tick())?;

            let events = self.state.primary.events;
            if events > handled {
                last = self.read_current(SelectionKind::Primary)?;
                monitor.publish(last.as_deref(), events - handled)?;
                handled = events;
            } else if self.state.primary.offer.is_some() {
                // A selection being extended changes content without a new offer
                let content = self.read_current(SelectionKind::Primary)?;
                if content != last {
                    monitor.publish(content.as_deref(), 1)?;
                    last = content;
                }
            }
        }

        Ok(())
    }
}
