// Selection handshake reference:
// https://tronche.com/gui/x/icccm/sec-2.html#s-2.4

use anyhow::{Context, Result, bail};
use std::collections::VecDeque;
use std::env;
use std::os::fd::AsFd;
use std::thread;
use std::time::{Duration, Instant};
use x11rb::connection::{Connection, RequestConnection as _};
use x11rb::protocol::Event;
use x11rb::protocol::xfixes::{self, ConnectionExt as _, SelectionEventMask};
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ConnectionExt as _, CreateWindowAux, EventMask, PropMode, Property,
    SELECTION_NOTIFY_EVENT, SelectionNotifyEvent, SelectionRequestEvent, Window, WindowClass,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;
use x11rb::{COPY_DEPTH_FROM_PARENT, COPY_FROM_PARENT, CURRENT_TIME, NONE};

use super::backend::SelectionBackend;
use super::backoff::Backoff;
use super::io::wait_readable;
use crate::error::SelectionError;
use crate::models::SelectionKind;
use crate::monitor::Monitor;
use crate::process::ShutdownFlag;
use crate::storage::Config;

x11rb::atom_manager! {
    pub Atoms: AtomsCookie {
        PRIMARY,
        CLIPBOARD,
        TARGETS,
        INCR,

        UTF8_STRING,
        STRING,
        TEXT,
        TEXT_PLAIN: b"text/plain",
        TEXT_PLAIN_UTF8: b"text/plain;charset=utf-8",

        SELMON_SELECTION,
    }
}

/// ChangeProperty request header, subtracted from the maximum request size
const CHANGE_PROPERTY_HEADER: usize = 24;

/// Which X display this backend is pointed at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum X11Flavor {
    /// A plain X session
    Native,
    /// The X-compatibility display of a Wayland session
    XWayland,
}

impl X11Flavor {
    pub fn name(self) -> &'static str {
        match self {
            X11Flavor::Native => "X11",
            X11Flavor::XWayland => "XWayland",
        }
    }
}

/// Outcome of one ConvertSelection handshake
enum Conversion {
    Data(Vec<u8>),
    /// Owner answered with property None (no owner, or target unsupported)
    Refused,
    /// No SelectionNotify within the backoff budget
    TimedOut,
}

/// X selection backend built on ConvertSelection and XFixes ownership events
pub struct X11Backend {
    conn: RustConnection,
    window: Window,
    atoms: Atoms,
    flavor: X11Flavor,
    /// Events pulled off the connection while waiting for a handshake
    deferred: VecDeque<Event>,
    served: Option<Vec<u8>>,
    max_selection_bytes: usize,
    tick: Duration,
    clipboard_idle: Duration,
}

impl X11Backend {
    /// Connect to $DISPLAY and create the hidden helper window
    pub fn connect(flavor: X11Flavor, config: &Config) -> Result<Self> {
        let display = env::var("DISPLAY")
            .ok()
            .filter(|d| !d.is_empty())
            .ok_or(SelectionError::NoDisplay)?;

        if flavor == X11Flavor::XWayland && env::var_os("WAYLAND_DISPLAY").is_none() {
            log::warn!("XWayland backend used outside a Wayland session");
        }

        let (conn, screen_num) = x11rb::connect(Some(display.as_str()))
            .with_context(|| format!("Failed to connect to X display {}", display))?;
        let root = conn.setup().roots[screen_num].root;

        let atoms = Atoms::new(&conn)?.reply().context("Failed to intern atoms")?;

        // Unmapped 1x1 InputOnly window: X has no zero-size windows, and this
        // one is never shown. It only serves as requestor and owner.
        let window = conn.generate_id()?;
        conn.create_window(
            COPY_DEPTH_FROM_PARENT,
            window,
            root,
            0,
            0,
            1,
            1,
            0,
            WindowClass::INPUT_ONLY,
            COPY_FROM_PARENT,
            &CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE),
        )?;
        conn.flush()?;

        log::debug!(
            "{} backend connected to {} (window {:#x})",
            flavor.name(),
            display,
            window
        );

        Ok(X11Backend {
            conn,
            window,
            atoms,
            flavor,
            deferred: VecDeque::new(),
            served: None,
            max_selection_bytes: config.limits.max_selection_bytes,
            tick: config.timing.tick(),
            clipboard_idle: config.timing.clipboard_idle(),
        })
    }

    fn selection_atom(&self, kind: SelectionKind) -> Atom {
        match kind {
            SelectionKind::Primary => self.atoms.PRIMARY,
            SelectionKind::Clipboard => self.atoms.CLIPBOARD,
        }
    }

    fn text_targets(&self) -> [Atom; 5] {
        [
            self.atoms.UTF8_STRING,
            self.atoms.TEXT_PLAIN_UTF8,
            self.atoms.TEXT_PLAIN,
            self.atoms.STRING,
            self.atoms.TEXT,
        ]
    }

    /// Largest payload a single ChangeProperty request can carry
    fn max_reply_bytes(&self) -> usize {
        self.conn
            .maximum_request_bytes()
            .saturating_sub(CHANGE_PROPERTY_HEADER)
    }

    /// Deferred events first, then whatever the connection has buffered
    fn next_event(&mut self) -> Result<Option<Event>> {
        if let Some(event) = self.deferred.pop_front() {
            return Ok(Some(event));
        }
        Ok(self.conn.poll_for_event()?)
    }

    /// Flush and block on the connection socket for at most one tick.
    /// Only call with the event queue drained, or buffered events sit unseen.
    fn wait_for_activity(&self) -> Result<bool> {
        self.conn.flush()?;
        wait_readable(self.conn.stream().as_fd(), self.tick)
    }

    /// Read a selection as text, preferring UTF8_STRING over STRING
    fn convert(&mut self, selection: Atom) -> Result<Option<Vec<u8>>> {
        for target in [self.atoms.UTF8_STRING, self.atoms.STRING] {
            match self.convert_to(selection, target)? {
                Conversion::Data(bytes) => return Ok((!bytes.is_empty()).then_some(bytes)),
                Conversion::Refused => continue,
                Conversion::TimedOut => {
                    log::debug!("Selection {} owner did not answer in time", selection);
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    fn convert_to(&mut self, selection: Atom, target: Atom) -> Result<Conversion> {
        let property = self.atoms.SELMON_SELECTION;

        self.conn.delete_property(self.window, property)?;
        self.conn
            .convert_selection(self.window, selection, target, property, CURRENT_TIME)?;
        self.conn.flush()?;

        let Some(notify) = self.await_notify(selection, target)? else {
            return Ok(Conversion::TimedOut);
        };
        if notify.property == NONE {
            return Ok(Conversion::Refused);
        }

        self.take_property(notify.property)
    }

    /// Poll for the SelectionNotify answering our request, stashing
    /// unrelated events for the caller's loop
    fn await_notify(&mut self, selection: Atom, target: Atom) -> Result<Option<SelectionNotifyEvent>> {
        for delay in Backoff::new() {
            while let Some(event) = self.conn.poll_for_event()? {
                match event {
                    Event::SelectionNotify(ev)
                        if ev.requestor == self.window
                            && ev.selection == selection
                            && ev.target == target =>
                    {
                        return Ok(Some(ev));
                    }
                    Event::SelectionNotify(_) => log::trace!("Dropping stale SelectionNotify"),
                    Event::PropertyNotify(_) => {}
                    other => self.deferred.push_back(other),
                }
            }
            thread::sleep(delay);
        }
        Ok(None)
    }

    /// Fetch and delete the transferred property in one request
    fn take_property(&mut self, property: Atom) -> Result<Conversion> {
        let words = u32::try_from(self.max_selection_bytes.div_ceil(4)).unwrap_or(u32::MAX);
        let reply = self
            .conn
            .get_property(true, self.window, property, AtomEnum::ANY, 0, words)?
            .reply()?;

        if reply.type_ == self.atoms.INCR {
            return self.read_incr(property).map(Conversion::Data);
        }

        if reply.bytes_after > 0 {
            // Over the cap: the server only deletes fully read properties
            self.conn.delete_property(self.window, property)?;
            self.conn.flush()?;
        }

        let mut value = reply.value;
        value.truncate(self.max_selection_bytes);
        Ok(Conversion::Data(value))
    }

    /// Incremental transfer: every deletion of the property asks the owner
    /// for the next chunk, a zero-length chunk ends it
    fn read_incr(&mut self, property: Atom) -> Result<Vec<u8>> {
        self.conn.flush()?;
        let mut data = Vec::new();

        loop {
            if !self.await_new_value(property)? {
                log::debug!("INCR transfer stalled after {} bytes", data.len());
                break;
            }

            let reply = self
                .conn
                .get_property(true, self.window, property, AtomEnum::ANY, 0, u32::MAX / 4)?
                .reply()?;
            self.conn.flush()?;

            if reply.value.is_empty() {
                break;
            }

            let room = self.max_selection_bytes - data.len();
            data.extend_from_slice(&reply.value[..reply.value.len().min(room)]);
            if data.len() >= self.max_selection_bytes {
                log::debug!("INCR transfer reached the cap, abandoning the rest");
                break;
            }
        }

        Ok(data)
    }

    fn await_new_value(&mut self, property: Atom) -> Result<bool> {
        for delay in Backoff::new() {
            while let Some(event) = self.conn.poll_for_event()? {
                match event {
                    Event::PropertyNotify(ev)
                        if ev.window == self.window
                            && ev.atom == property
                            && ev.state == Property::NEW_VALUE =>
                    {
                        return Ok(true);
                    }
                    Event::PropertyNotify(_) | Event::SelectionNotify(_) => {}
                    other => self.deferred.push_back(other),
                }
            }
            thread::sleep(delay);
        }
        Ok(false)
    }

    /// Answer one paste request for the clipboard we own
    fn answer_request(&self, req: &SelectionRequestEvent, data: &[u8]) -> Result<()> {
        // Obsolete clients leave the property unset and expect the target name
        let property = if req.property == NONE {
            req.target
        } else {
            req.property
        };

        let granted = if req.selection != self.atoms.CLIPBOARD {
            false
        } else if req.target == self.atoms.TARGETS {
            let mut targets = vec![self.atoms.TARGETS];
            targets.extend(self.text_targets());
            self.conn.change_property32(
                PropMode::REPLACE,
                req.requestor,
                property,
                AtomEnum::ATOM,
                &targets,
            )?;
            true
        } else if self.text_targets().contains(&req.target) && data.len() > self.max_reply_bytes() {
            log::debug!("Refusing {} byte reply over the request limit", data.len());
            false
        } else if self.text_targets().contains(&req.target) {
            let type_ = reply_type(&self.atoms, req.target);
            self.conn
                .change_property8(PropMode::REPLACE, req.requestor, property, type_, data)?;
            true
        } else {
            log::debug!("Refusing conversion to target atom {}", req.target);
            false
        };

        self.conn.send_event(
            false,
            req.requestor,
            EventMask::NO_EVENT,
            SelectionNotifyEvent {
                response_type: SELECTION_NOTIFY_EVENT,
                sequence: req.sequence,
                time: req.time,
                requestor: req.requestor,
                selection: req.selection,
                target: req.target,
                property: if granted { property } else { NONE },
            },
        )?;
        self.conn.flush()?;
        Ok(())
    }
}

/// Property type for a text reply. TEXT only names a request; the reply
/// carries the concrete encoding instead.
fn reply_type(atoms: &Atoms, target: Atom) -> Atom {
    if target == atoms.TEXT {
        atoms.UTF8_STRING
    } else {
        target
    }
}

impl SelectionBackend for X11Backend {
    fn name(&self) -> &'static str {
        self.flavor.name()
    }

    fn read_selection(&mut self, kind: SelectionKind) -> Result<Option<Vec<u8>>> {
        let selection = self.selection_atom(kind);
        self.convert(selection)
    }

    fn clear_primary(&mut self) -> Result<()> {
        self.conn
            .set_selection_owner(NONE, self.atoms.PRIMARY, CURRENT_TIME)?;
        // Round trip so the request is processed before we disconnect
        self.conn.get_input_focus()?.reply()?;
        log::debug!("Cleared PRIMARY on {}", self.flavor.name());
        Ok(())
    }

    fn claim_clipboard(&mut self, data: Vec<u8>) -> Result<()> {
        if data.len() > self.max_reply_bytes() {
            log::warn!(
                "{} byte clipboard payload exceeds the X request limit, pastes will be refused",
                data.len()
            );
        }

        self.conn
            .set_selection_owner(self.window, self.atoms.CLIPBOARD, CURRENT_TIME)?;
        let owner = self
            .conn
            .get_selection_owner(self.atoms.CLIPBOARD)?
            .reply()?
            .owner;
        if owner != self.window {
            return Err(SelectionError::OwnershipRefused("CLIPBOARD").into());
        }

        self.served = Some(data);
        Ok(())
    }

    fn serve_clipboard(&mut self, shutdown: &ShutdownFlag) -> Result<()> {
        let Some(data) = self.served.take() else {
            bail!("serve_clipboard called without a claimed clipboard");
        };

        let mut last_activity = Instant::now();
        let mut requests = 0u64;

        while shutdown.is_running() {
            while let Some(event) = self.next_event()? {
                match event {
                    Event::SelectionRequest(req) => {
                        self.answer_request(&req, &data)?;
                        requests += 1;
                        last_activity = Instant::now();
                    }
                    Event::SelectionClear(ev) if ev.selection == self.atoms.CLIPBOARD => {
                        log::info!("Clipboard superseded after {} request(s)", requests);
                        return Ok(());
                    }
                    Event::Error(err) => {
                        // Usually a requestor window that vanished mid-transfer
                        log::debug!("X error while serving: {:?}", err);
                    }
                    _ => {}
                }
            }

            if last_activity.elapsed() >= self.clipboard_idle {
                log::info!(
                    "Clipboard server idle for {:?} after {} request(s), exiting",
                    self.clipboard_idle,
                    requests
                );
                return Ok(());
            }

            self.wait_for_activity()?;
        }

        log::info!("Clipboard server stopped by signal");
        Ok(())
    }

    fn prepare_daemon(&mut self) -> Result<()> {
        self.conn
            .extension_information(xfixes::X11_EXTENSION_NAME)?
            .ok_or(SelectionError::MissingExtension("XFIXES"))?;
        self.conn.xfixes_query_version(5, 0)?.reply()?;

        self.conn.xfixes_select_selection_input(
            self.window,
            self.atoms.PRIMARY,
            SelectionEventMask::SET_SELECTION_OWNER
                | SelectionEventMask::SELECTION_WINDOW_DESTROY
                | SelectionEventMask::SELECTION_CLIENT_CLOSE,
        )?;
        self.conn.flush()?;
        Ok(())
    }

    fn run_daemon(&mut self, monitor: &mut Monitor) -> Result<()> {
        let primary = self.atoms.PRIMARY;

        let initial = self.convert(primary)?;
        monitor.publish(initial.as_deref(), 1)?;

        while monitor.is_running() {
            while let Some(event) = self.next_event()? {
                if let Event::XfixesSelectionNotify(ev) = event {
                    if ev.selection != primary {
                        continue;
                    }
                    log::trace!("PRIMARY owner now {:#x} ({:?})", ev.owner, ev.subtype);

                    let content = self.convert(primary)?;
                    monitor.publish(content.as_deref(), 1)?;
                }

                if !monitor.is_running() {
                    break;
                }
            }

            self.wait_for_activity()?;
        }

        Ok(())
    }
}
