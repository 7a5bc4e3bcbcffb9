//! wayland-client glue: a live [`WaylandTransport`] and the event pump
//! that feeds a [`WaylandBackend`] from it.
//!
//! Protocol objects stay here, keyed by protocol id; the device only
//! sees [`OfferId`] / [`SourceId`] handles. Selections and drags need
//! the serial and surface of an input event, which the window layer
//! reports through [`WaylandConnection::note_input`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::os::fd::BorrowedFd;
use std::rc::Rc;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use wayland_client::globals::{GlobalListContents, registry_queue_init};
use wayland_client::protocol::wl_data_device::{self, WlDataDevice};
use wayland_client::protocol::wl_data_device_manager::{DndAction, WlDataDeviceManager};
use wayland_client::protocol::wl_data_offer::{self, WlDataOffer};
use wayland_client::protocol::wl_data_source::{self, WlDataSource};
use wayland_client::protocol::wl_registry::WlRegistry;
use wayland_client::protocol::wl_seat::WlSeat;
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_client::backend::WaylandError;
use wayland_client::{
    Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum, event_created_child,
};

use super::device::PipeInterest;
use super::driver::WaylandBackend;
use super::transport::{DndActions, OfferId, SourceId, WaylandEvent, WaylandTransport};
use crate::error::{ExchangeError, Result};
use crate::request::EventPump;

/// Poll timeout for one pump tick, in milliseconds.
const PUMP_POLL_MS: u16 = 100;

fn conn_err(what: &str, e: impl fmt::Display) -> ExchangeError {
    ExchangeError::Connection(format!("{what}: {e}"))
}

fn actions(value: WEnum<DndAction>) -> DndActions {
    match value {
        WEnum::Value(action) => DndActions(action.bits()),
        WEnum::Unknown(bits) => DndActions(bits),
    }
}

/// Dispatch state: live proxies and the events produced since the last
/// drain.
#[derive(Default)]
struct State {
    offers: HashMap<u32, WlDataOffer>,
    sources: HashMap<u32, WlDataSource>,
    events: Vec<WaylandEvent>,
}

impl State {
    fn register_offer(&mut self, offer: &WlDataOffer) -> OfferId {
        let id = offer.id().protocol_id();
        self.offers.insert(id, offer.clone());
        OfferId(id)
    }
}

impl Dispatch<WlRegistry, GlobalListContents> for State {
    fn event(
        _state: &mut Self,
        _proxy: &WlRegistry,
        _event: <WlRegistry as Proxy>::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<WlSeat, ()> for State {
    fn event(
        _state: &mut Self,
        _proxy: &WlSeat,
        _event: <WlSeat as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<WlDataDeviceManager, ()> for State {
    fn event(
        _state: &mut Self,
        _proxy: &WlDataDeviceManager,
        _event: <WlDataDeviceManager as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<WlDataDevice, ()> for State {
    fn event(
        state: &mut Self,
        _proxy: &WlDataDevice,
        event: wl_data_device::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let event = match event {
            wl_data_device::Event::DataOffer { id } => WaylandEvent::DataOffer {
                offer: state.register_offer(&id),
            },
            wl_data_device::Event::Enter {
                serial, x, y, id, ..
            } => WaylandEvent::Enter {
                serial,
                x,
                y,
                offer: id.map(|o| OfferId(o.id().protocol_id())),
            },
            wl_data_device::Event::Leave => WaylandEvent::Leave,
            wl_data_device::Event::Motion { time, x, y } => WaylandEvent::Motion { time, x, y },
            wl_data_device::Event::Drop => WaylandEvent::Drop,
            wl_data_device::Event::Selection { id } => WaylandEvent::Selection {
                offer: id.map(|o| OfferId(o.id().protocol_id())),
            },
            _ => return,
        };
        state.events.push(event);
    }

    event_created_child!(State, WlDataDevice, [
        wl_data_device::EVT_DATA_OFFER_OPCODE => (WlDataOffer, ()),
    ]);
}

impl Dispatch<WlDataOffer, ()> for State {
    fn event(
        state: &mut Self,
        proxy: &WlDataOffer,
        event: wl_data_offer::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let offer = OfferId(proxy.id().protocol_id());
        let event = match event {
            wl_data_offer::Event::Offer { mime_type } => WaylandEvent::Offer { offer, mime_type },
            wl_data_offer::Event::SourceActions { source_actions } => WaylandEvent::SourceActions {
                offer,
                actions: actions(source_actions),
            },
            wl_data_offer::Event::Action { dnd_action } => WaylandEvent::Action {
                offer,
                action: actions(dnd_action),
            },
            _ => return,
        };
        state.events.push(event);
    }
}

impl Dispatch<WlDataSource, ()> for State {
    fn event(
        state: &mut Self,
        proxy: &WlDataSource,
        event: wl_data_source::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let source = SourceId(proxy.id().protocol_id());
        let event = match event {
            wl_data_source::Event::Target { mime_type } => WaylandEvent::Target { source, mime_type },
            wl_data_source::Event::Send { mime_type, fd } => WaylandEvent::Send {
                source,
                mime_type,
                fd,
            },
            wl_data_source::Event::Cancelled => WaylandEvent::Cancelled { source },
            wl_data_source::Event::DndDropPerformed => WaylandEvent::DndDropPerformed { source },
            wl_data_source::Event::DndFinished => WaylandEvent::DndFinished { source },
            wl_data_source::Event::Action { dnd_action } => WaylandEvent::SourceAction {
                source,
                action: actions(dnd_action),
            },
            _ => return,
        };
        state.events.push(event);
    }
}

/// A compositor connection with the data device of the first seat.
pub struct WaylandConnection {
    conn: Connection,
    queue: RefCell<EventQueue<State>>,
    state: RefCell<State>,
    qh: QueueHandle<State>,
    manager: WlDataDeviceManager,
    device: WlDataDevice,
    serial: Cell<u32>,
    origin: RefCell<Option<WlSurface>>,
}

impl WaylandConnection {
    /// Connect through `WAYLAND_DISPLAY` and bind the data device.
    pub fn connect() -> Result<Rc<Self>> {
        let conn = Connection::connect_to_env().map_err(|e| conn_err("connect", e))?;
        let (globals, mut queue) =
            registry_queue_init::<State>(&conn).map_err(|e| conn_err("registry", e))?;
        let qh = queue.handle();

        let manager: WlDataDeviceManager = globals.bind(&qh, 1..=3, ()).map_err(|e| {
            ExchangeError::UnsupportedBackend(format!("wl_data_device_manager: {e}"))
        })?;
        let seat: WlSeat = globals
            .bind(&qh, 1..=1, ())
            .map_err(|e| ExchangeError::UnsupportedBackend(format!("wl_seat: {e}")))?;
        let device = manager.get_data_device(&seat, &qh, ());

        let mut state = State::default();
        queue
            .roundtrip(&mut state)
            .map_err(|e| conn_err("roundtrip", e))?;
        tracing::info!(version = manager.version(), "bound Wayland data device");

        Ok(Rc::new(Self {
            conn,
            queue: RefCell::new(queue),
            state: RefCell::new(state),
            qh,
            manager,
            device,
            serial: Cell::new(0),
            origin: RefCell::new(None),
        }))
    }

    /// Record the latest input event on one of our surfaces.
    pub fn note_input(&self, serial: u32, surface: Option<WlSurface>) {
        self.serial.set(serial);
        if surface.is_some() {
            *self.origin.borrow_mut() = surface;
        }
    }

    /// Run queued dispatches and hand back the events they produced.
    fn dispatch_pending(&self) -> Result<Vec<WaylandEvent>> {
        let mut queue = self.queue.borrow_mut();
        let mut state = self.state.borrow_mut();
        queue
            .dispatch_pending(&mut state)
            .map_err(|e| conn_err("dispatch", e))?;
        Ok(std::mem::take(&mut state.events))
    }

    fn offer(&self, offer: OfferId) -> Result<WlDataOffer> {
        self.state
            .borrow()
            .offers
            .get(&offer.0)
            .cloned()
            .ok_or_else(|| ExchangeError::Protocol(format!("unknown data offer {}", offer.0)))
    }

    fn source(&self, source: SourceId) -> Result<WlDataSource> {
        self.state
            .borrow()
            .sources
            .get(&source.0)
            .cloned()
            .ok_or_else(|| ExchangeError::Protocol(format!("unknown data source {}", source.0)))
    }
}

impl WaylandTransport for WaylandConnection {
    fn version(&self) -> u32 {
        self.manager.version()
    }

    fn input_serial(&self) -> u32 {
        self.serial.get()
    }

    fn offer_receive(&self, offer: OfferId, mime_type: &str, fd: BorrowedFd<'_>) -> Result<()> {
        self.offer(offer)?.receive(mime_type.to_string(), fd);
        Ok(())
    }

    fn offer_accept(&self, offer: OfferId, serial: u32, mime_type: Option<&str>) -> Result<()> {
        self.offer(offer)?
            .accept(serial, mime_type.map(str::to_string));
        Ok(())
    }

    fn offer_set_actions(
        &self,
        offer: OfferId,
        actions: DndActions,
        preferred: DndActions,
    ) -> Result<()> {
        self.offer(offer)?.set_actions(
            DndAction::from_bits_truncate(actions.0),
            DndAction::from_bits_truncate(preferred.0),
        );
        Ok(())
    }

    fn offer_finish(&self, offer: OfferId) -> Result<()> {
        self.offer(offer)?.finish();
        Ok(())
    }

    fn offer_destroy(&self, offer: OfferId) {
        if let Some(proxy) = self.state.borrow_mut().offers.remove(&offer.0) {
            proxy.destroy();
        }
    }

    fn create_source(&self) -> Result<SourceId> {
        let source = self.manager.create_data_source(&self.qh, ());
        let id = source.id().protocol_id();
        self.state.borrow_mut().sources.insert(id, source);
        Ok(SourceId(id))
    }

    fn source_offer(&self, source: SourceId, mime_type: &str) -> Result<()> {
        self.source(source)?.offer(mime_type.to_string());
        Ok(())
    }

    fn source_set_actions(&self, source: SourceId, actions: DndActions) -> Result<()> {
        self.source(source)?
            .set_actions(DndAction::from_bits_truncate(actions.0));
        Ok(())
    }

    fn source_destroy(&self, source: SourceId) {
        if let Some(proxy) = self.state.borrow_mut().sources.remove(&source.0) {
            proxy.destroy();
        }
    }

    fn set_selection(&self, source: Option<SourceId>, serial: u32) -> Result<()> {
        let proxy = source.map(|s| self.source(s)).transpose()?;
        self.device.set_selection(proxy.as_ref(), serial);
        Ok(())
    }

    fn start_drag(&self, source: SourceId, serial: u32) -> Result<()> {
        let proxy = self.source(source)?;
        let origin = self.origin.borrow();
        let Some(origin) = origin.as_ref() else {
            return Err(ExchangeError::Protocol(
                "no surface has received input to start a drag from".into(),
            ));
        };
        self.device.start_drag(Some(&proxy), origin, None, serial);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.conn.flush().map_err(|e| conn_err("flush", e))
    }
}

/// [`EventPump`] over a live compositor connection and the transfer
/// pipes of its backend.
pub struct WaylandEventPump {
    conn: Rc<WaylandConnection>,
    backend: Rc<WaylandBackend>,
}

impl WaylandEventPump {
    pub fn new(conn: Rc<WaylandConnection>, backend: Rc<WaylandBackend>) -> Self {
        Self { conn, backend }
    }

    /// Handle everything already dispatched. Returns how many events were
    /// seen.
    fn drain(&self) -> Result<usize> {
        let events = self.conn.dispatch_pending()?;
        let seen = events.len();
        for event in events {
            self.backend.handle_event(event)?;
        }
        Ok(seen)
    }

    fn dispatch(&self) -> Result<()> {
        if self.drain()? > 0 {
            return Ok(());
        }
        self.conn.flush()?;
        let Some(guard) = self.conn.queue.borrow().prepare_read() else {
            self.drain()?;
            return Ok(());
        };

        let pipes = self.backend.poll_fds();
        let mut fds = Vec::with_capacity(pipes.len() + 1);
        fds.push(PollFd::new(guard.connection_fd(), PollFlags::POLLIN));
        for (fd, interest) in &pipes {
            // SAFETY: the device owns these fds and only closes them in
            // service_pipes, which runs after this poll returns.
            let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
            let flags = match interest {
                PipeInterest::Read => PollFlags::POLLIN,
                PipeInterest::Write => PollFlags::POLLOUT,
            };
            fds.push(PollFd::new(borrowed, flags));
        }

        let ready = match poll(&mut fds, PollTimeout::from(PUMP_POLL_MS)) {
            Ok(n) => n,
            Err(nix::Error::EINTR) => 0,
            Err(e) => return Err(conn_err("poll on Wayland fd", e)),
        };
        let display_ready = fds[0].revents().is_some_and(|r| {
            r.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP)
        });
        drop(fds);

        if display_ready {
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(conn_err("read", e)),
            }
        } else {
            drop(guard);
        }
        if ready > 0 && !pipes.is_empty() {
            self.backend.service_pipes();
        }
        self.drain()?;
        Ok(())
    }
}

impl EventPump for WaylandEventPump {
    fn pump(&self) -> Result<()> {
        self.backend.flush();
        let result = self.dispatch();
        if let Err(e) = &result
            && e.is_fatal()
        {
            tracing::error!(error = %e, "Wayland connection lost");
            self.backend.shutdown();
        }
        result
    }
}
