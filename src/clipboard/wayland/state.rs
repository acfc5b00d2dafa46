use std::os::fd::BorrowedFd;
use std::sync::Mutex;
use std::time::Duration;
use wayland_client::globals::GlobalListContents;
use wayland_client::protocol::{
    wl_buffer, wl_compositor, wl_data_device, wl_data_device_manager, wl_data_offer,
    wl_data_source, wl_keyboard, wl_region, wl_registry, wl_seat, wl_shm, wl_shm_pool,
    wl_surface,
};
use wayland_client::{
    Connection, Dispatch, Proxy, QueueHandle, WEnum, delegate_noop, event_created_child,
};
use wayland_protocols::wp::primary_selection::zv1::client::{
    zwp_primary_selection_device_manager_v1, zwp_primary_selection_device_v1,
    zwp_primary_selection_offer_v1,
};
use wayland_protocols::xdg::shell::client::{xdg_surface, xdg_toplevel, xdg_wm_base};

use super::surface::FocusSurface;
use crate::clipboard::io::write_all_bounded;
use crate::models::{SelectionKind, TEXT_MIME_TYPES};

/// MIME types announced for an offer, filled in before its selection event
#[derive(Debug, Default)]
pub struct OfferMimes(Mutex<Vec<String>>);

impl OfferMimes {
    fn push(&self, mime: String) {
        if let Ok(mut mimes) = self.0.lock() {
            mimes.push(mime);
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

/// A selection offer from either protocol
#[derive(Debug, Clone)]
pub enum Offer {
    Clipboard(wl_data_offer::WlDataOffer),
    Primary(zwp_primary_selection_offer_v1::ZwpPrimarySelectionOfferV1),
}

impl Offer {
    pub fn mime_types(&self) -> Vec<String> {
        let mimes = match self {
            Offer::Clipboard(offer) => offer.data::<OfferMimes>(),
            Offer::Primary(offer) => offer.data::<OfferMimes>(),
        };
        mimes.map(OfferMimes::snapshot).unwrap_or_default()
    }

    /// Ask the owner to write `mime` content into `fd`
    pub fn receive(&self, mime: &str, fd: BorrowedFd<'_>) {
        match self {
            Offer::Clipboard(offer) => offer.receive(mime.to_string(), fd),
            Offer::Primary(offer) => offer.receive(mime.to_string(), fd),
        }
    }

    fn destroy(&self) {
        match self {
            Offer::Clipboard(offer) => offer.destroy(),
            Offer::Primary(offer) => offer.destroy(),
        }
    }
}

/// Current offer for one selection plus a count of selection events seen
#[derive(Debug, Default)]
pub struct SelectionSlot {
    pub offer: Option<Offer>,
    pub events: u64,
}

impl SelectionSlot {
    fn replace(&mut self, offer: Option<Offer>) {
        if let Some(old) = self.offer.take() {
            old.destroy();
        }
        self.offer = offer;
        self.events += 1;
    }
}

/// Clipboard content we currently own
#[derive(Debug)]
pub struct ServedSource {
    source: wl_data_source::WlDataSource,
    data: Vec<u8>,
    pub cancelled: bool,
    pub sends: u64,
}

impl ServedSource {
    pub fn new(source: wl_data_source::WlDataSource, data: Vec<u8>) -> Self {
        ServedSource {
            source,
            data,
            cancelled: false,
            sends: 0,
        }
    }

    pub fn source(&self) -> &wl_data_source::WlDataSource {
        &self.source
    }
}

/// Dispatch target for every object on the queue
pub struct State {
    pub primary: SelectionSlot,
    pub clipboard: SelectionSlot,
    pub seat_caps: wl_seat::Capability,
    pub focus: Option<FocusSurface>,
    pub keyboard_serial: Option<u32>,
    pub source: Option<ServedSource>,
    write_timeout: Duration,
}

impl State {
    pub fn new(write_timeout: Duration) -> Self {
        State {
            primary: SelectionSlot::default(),
            clipboard: SelectionSlot::default(),
            seat_caps: wl_seat::Capability::empty(),
            focus: None,
            keyboard_serial: None,
            source: None,
            write_timeout,
        }
    }

    pub fn slot(&self, kind: SelectionKind) -> &SelectionSlot {
        match kind {
            SelectionKind::Primary => &self.primary,
            SelectionKind::Clipboard => &self.clipboard,
        }
    }
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for State {
    fn event(
        _: &mut Self,
        _: &wl_registry::WlRegistry,
        _: wl_registry::Event,
        _: &GlobalListContents,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_seat::WlSeat, ()> for State {
    fn event(
        state: &mut Self,
        _: &wl_seat::WlSeat,
        event: wl_seat::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_seat::Event::Capabilities {
            capabilities: WEnum::Value(capabilities),
        } = event
        {
            log::trace!("Seat capabilities: {:?}", capabilities);
            state.seat_caps = capabilities;
        }
    }
}

impl Dispatch<wl_keyboard::WlKeyboard, ()> for State {
    fn event(
        state: &mut Self,
        _: &wl_keyboard::WlKeyboard,
        event: wl_keyboard::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            wl_keyboard::Event::Enter {
                serial, surface, ..
            } => {
                if state.focus.as_ref().is_some_and(|f| f.owns(&surface)) {
                    log::debug!("Focus surface got keyboard focus (serial {})", serial);
                    state.keyboard_serial = Some(serial);
                }
            }
            wl_keyboard::Event::Key { serial, .. } | wl_keyboard::Event::Modifiers { serial, .. } => {
                state.keyboard_serial = Some(serial);
            }
            _ => {}
        }
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for State {
    fn event(
        _: &mut Self,
        wm_base: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            wm_base.pong(serial);
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, ()> for State {
    fn event(
        state: &mut Self,
        xdg_surface: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            match state.focus.as_mut() {
                Some(focus) => focus.configure(serial),
                None => xdg_surface.ack_configure(serial),
            }
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, ()> for State {
    fn event(
        _: &mut Self,
        _: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_toplevel::Event::Close = event {
            // Stays mapped regardless; losing it would cost selection events
            log::debug!("Compositor asked to close the focus surface, ignoring");
        }
    }
}

impl Dispatch<wl_data_device::WlDataDevice, ()> for State {
    fn event(
        state: &mut Self,
        _: &wl_data_device::WlDataDevice,
        event: wl_data_device::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_data_device::Event::Selection { id } = event {
            state.clipboard.replace(id.map(Offer::Clipboard));
        }
    }

    event_created_child!(State, wl_data_device::WlDataDevice, [
        wl_data_device::EVT_DATA_OFFER_OPCODE => (wl_data_offer::WlDataOffer, OfferMimes::default()),
    ]);
}

impl Dispatch<wl_data_offer::WlDataOffer, OfferMimes> for State {
    fn event(
        _: &mut Self,
        _: &wl_data_offer::WlDataOffer,
        event: wl_data_offer::Event,
        mimes: &OfferMimes,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_data_offer::Event::Offer { mime_type } = event {
            mimes.push(mime_type);
        }
    }
}

impl Dispatch<zwp_primary_selection_device_v1::ZwpPrimarySelectionDeviceV1, ()> for State {
    fn event(
        state: &mut Self,
        _: &zwp_primary_selection_device_v1::ZwpPrimarySelectionDeviceV1,
        event: zwp_primary_selection_device_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let zwp_primary_selection_device_v1::Event::Selection { id } = event {
            state.primary.replace(id.map(Offer::Primary));
        }
    }

    event_created_child!(State, zwp_primary_selection_device_v1::ZwpPrimarySelectionDeviceV1, [
        zwp_primary_selection_device_v1::EVT_DATA_OFFER_OPCODE => (zwp_primary_selection_offer_v1::ZwpPrimarySelectionOfferV1, OfferMimes::default()),
    ]);
}

impl Dispatch<zwp_primary_selection_offer_v1::ZwpPrimarySelectionOfferV1, OfferMimes> for State {
    fn event(
        _: &mut Self,
        _: &zwp_primary_selection_offer_v1::ZwpPrimarySelectionOfferV1,
        event: zwp_primary_selection_offer_v1::Event,
        mimes: &OfferMimes,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let zwp_primary_selection_offer_v1::Event::Offer { mime_type } = event {
            mimes.push(mime_type);
        }
    }
}

impl Dispatch<wl_data_source::WlDataSource, ()> for State {
    fn event(
        state: &mut Self,
        source: &wl_data_source::WlDataSource,
        event: wl_data_source::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(served) = state.source.as_mut() else {
            return;
        };

        match event {
            wl_data_source::Event::Send { mime_type, fd } => {
                if !TEXT_MIME_TYPES.contains(&mime_type.as_str()) {
                    // Closing the fd unanswered gives the requester an empty paste
                    log::debug!("Ignoring paste request for {}", mime_type);
                    return;
                }
                match write_all_bounded(fd, &served.data, state.write_timeout) {
                    Ok(()) => {
                        served.sends += 1;
                        log::debug!("Served {} bytes as {}", served.data.len(), mime_type);
                    }
                    Err(e) => log::warn!("Paste as {} failed: {:#}", mime_type, e),
                }
            }
            wl_data_source::Event::Cancelled => {
                served.cancelled = true;
                source.destroy();
            }
            _ => {}
        }
    }
}

delegate_noop!(State: ignore wl_compositor::WlCompositor);
delegate_noop!(State: ignore wl_surface::WlSurface);
delegate_noop!(State: ignore wl_region::WlRegion);
delegate_noop!(State: ignore wl_shm::WlShm);
delegate_noop!(State: ignore wl_shm_pool::WlShmPool);
delegate_noop!(State: ignore wl_buffer::WlBuffer);
delegate_noop!(State: ignore wl_data_device_manager::WlDataDeviceManager);
delegate_noop!(State: ignore zwp_primary_selection_device_manager_v1::ZwpPrimarySelectionDeviceManagerV1);
