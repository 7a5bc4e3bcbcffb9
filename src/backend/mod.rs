//! Native backends and the context the window layer talks to.
//!
//! A [`Backend`] is picked once at start-up. [`AppContext`] pairs it with
//! the [`LoopControl`] that drives its events and exposes the only entry
//! points surrounding code uses: set or read the clipboard, start a drag,
//! and install the drag-and-drop listener.

pub mod com;
pub mod wayland;
pub mod x11;

use std::rc::Rc;

use crate::config::{BackendKind, ExchangeConfig};
use crate::error::Result;
use crate::exchange::{DataOffer, DataSource, DndListener, DropOutcome};
use crate::request::{EventPump, LoopControl, RequestState};

use self::com::ComDataManager;
use self::wayland::WaylandBackend;
use self::x11::{X11Backend, X11Connection, X11EventPump, X11Transport};

/// The protocol engine in use.
#[derive(Clone)]
pub enum Backend {
    X11(Rc<X11Backend>),
    Wayland(Rc<WaylandBackend>),
    Com(Rc<ComDataManager>),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::X11(_) => "x11",
            Backend::Wayland(_) => "wayland",
            Backend::Com(_) => "com",
        }
    }

    pub fn set_listener(&self, listener: Box<dyn DndListener>) {
        match self {
            Backend::X11(b) => b.set_listener(listener),
            Backend::Wayland(b) => b.set_listener(listener),
            Backend::Com(b) => b.set_listener(listener),
        }
    }

    pub fn clipboard_set(&self, source: Option<Rc<dyn DataSource>>) -> bool {
        match self {
            Backend::X11(b) => b.clipboard_set(source),
            Backend::Wayland(b) => b.clipboard_set(source),
            Backend::Com(b) => b.clipboard_set(source),
        }
    }

    pub fn clipboard(&self) -> Option<Rc<dyn DataOffer>> {
        match self {
            Backend::X11(b) => b.clipboard(),
            Backend::Wayland(b) => b.clipboard(),
            Backend::Com(b) => b.clipboard(),
        }
    }

    /// Only X11 has a primary selection.
    pub fn primary_set(&self, source: Option<Rc<dyn DataSource>>) -> bool {
        match self {
            Backend::X11(b) => b.primary_set(source),
            _ => {
                tracing::debug!(backend = self.name(), "no primary selection");
                false
            }
        }
    }

    pub fn primary(&self) -> Option<Rc<dyn DataOffer>> {
        match self {
            Backend::X11(b) => b.primary(),
            _ => None,
        }
    }

    pub fn owns_clipboard(&self) -> bool {
        match self {
            Backend::X11(b) => b.owns_clipboard(),
            Backend::Wayland(b) => b.owns_clipboard(),
            Backend::Com(b) => b.owns_clipboard(),
        }
    }

    pub fn owns_primary(&self) -> bool {
        match self {
            Backend::X11(b) => b.owns_primary(),
            _ => false,
        }
    }

    /// Start a drag. On X11 the window layer then feeds pointer motion
    /// and the release through [`X11Backend`]; Wayland and OLE run the
    /// drag themselves and report its outcome.
    pub fn start_drag(&self, source: Rc<dyn DataSource>) -> bool {
        match self {
            Backend::X11(b) => b.start_drag(source),
            Backend::Wayland(b) => {
                let request = b.start_drag(source);
                if request.state() != RequestState::Pending {
                    return false;
                }
                request.on_ready(log_outcome);
                true
            }
            Backend::Com(b) => match b.start_drag(source).try_take() {
                Ok(Some(outcome)) => {
                    log_outcome(outcome);
                    matches!(outcome, DropOutcome::Completed(_))
                }
                _ => false,
            },
        }
    }

    /// Tear down every session; outstanding requests resolve as failed.
    pub fn shutdown(&self) {
        match self {
            Backend::X11(b) => b.shutdown(),
            Backend::Wayland(b) => b.shutdown(),
            Backend::Com(b) => b.shutdown(),
        }
    }
}

fn log_outcome(outcome: DropOutcome) {
    tracing::debug!(?outcome, "drag finished");
}

/// Entry point for the window layer.
pub struct AppContext {
    backend: Backend,
    control: LoopControl,
}

impl AppContext {
    pub fn new(backend: Backend, pump: Rc<dyn EventPump>) -> Self {
        Self {
            backend,
            control: LoopControl::new(pump),
        }
    }

    /// Connect to the display server `config` selects.
    pub fn connect(config: &ExchangeConfig) -> Result<Self> {
        match config.backend.resolve() {
            BackendKind::Wayland => Self::connect_wayland(config),
            BackendKind::X11 | BackendKind::Auto => {
                let conn = Rc::new(X11Connection::connect(config.xdnd_version())?);
                let backend = Rc::new(X11Backend::new(
                    conn.clone() as Rc<dyn X11Transport>,
                    config.clone(),
                )?);
                let pump = Rc::new(X11EventPump::new(conn, backend.clone()));
                tracing::info!(backend = "x11", "exchange backend ready");
                Ok(Self::new(Backend::X11(backend), pump))
            }
        }
    }

    #[cfg(feature = "wayland")]
    fn connect_wayland(config: &ExchangeConfig) -> Result<Self> {
        use self::wayland::WaylandTransport;
        use self::wayland::native::{WaylandConnection, WaylandEventPump};

        let conn = WaylandConnection::connect()?;
        let backend = Rc::new(WaylandBackend::new(
            conn.clone() as Rc<dyn WaylandTransport>,
            config.clone(),
        ));
        let pump = Rc::new(WaylandEventPump::new(conn, backend.clone()));
        tracing::info!(backend = "wayland", "exchange backend ready");
        Ok(Self::new(Backend::Wayland(backend), pump))
    }

    #[cfg(not(feature = "wayland"))]
    fn connect_wayland(_config: &ExchangeConfig) -> Result<Self> {
        Err(crate::error::ExchangeError::UnsupportedBackend(
            "built without the wayland feature".into(),
        ))
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn loop_control(&self) -> &LoopControl {
        &self.control
    }

    /// One event-loop tick.
    pub fn dispatch(&self) -> Result<()> {
        self.control.pump_once()
    }

    pub fn set_listener(&self, listener: Box<dyn DndListener>) {
        self.backend.set_listener(listener);
    }

    /// Offer `source` on the clipboard, or give the clipboard up with
    /// `None`.
    pub fn clipboard_set(&self, source: Option<Rc<dyn DataSource>>) -> bool {
        self.backend.clipboard_set(source)
    }

    pub fn clipboard(&self) -> Option<Rc<dyn DataOffer>> {
        self.backend.clipboard()
    }

    pub fn primary_set(&self, source: Option<Rc<dyn DataSource>>) -> bool {
        self.backend.primary_set(source)
    }

    pub fn primary(&self) -> Option<Rc<dyn DataOffer>> {
        self.backend.primary()
    }

    /// Whether the clipboard still holds what we last set.
    pub fn owns_clipboard(&self) -> bool {
        self.backend.owns_clipboard()
    }

    pub fn owns_primary(&self) -> bool {
        self.backend.owns_primary()
    }

    pub fn start_drag_drop(&self, source: Rc<dyn DataSource>) -> bool {
        self.backend.start_drag(source)
    }

    pub fn shutdown(&self) {
        self.backend.shutdown();
    }
}


#[cfg(test)]
mod tests {
    use super::com::fixture::Fixture as ComFixture;
    use super::testing::Recorder;
    use super::wayland::fixture::Fixture as WaylandFixture;
    use super::x11::fixture::Fixture as X11Fixture;
    use super::*;
    use crate::exchange::{DropAction, MemorySource};
    use crate::format::{DataFormat, ExchangeData};
    use crate::request::testing::ScriptPump;

    fn context(backend: Backend) -> AppContext {
        AppContext::new(backend, Rc::new(ScriptPump::default()))
    }

    fn text(value: &str) -> Rc<dyn DataSource> {
        Rc::new(MemorySource::text(value))
    }

    #[test]
    fn clipboard_round_trip_through_the_context() {
        let fx = ComFixture::new();
        let ctx = context(Backend::Com(fx.manager.clone()));
        assert!(ctx.clipboard_set(Some(text("hello"))));
        let offer = ctx.clipboard().unwrap();
        let data = offer
            .data(&DataFormat::text())
            .wait(ctx.loop_control(), None)
            .unwrap();
        assert_eq!(data, ExchangeData::Text("hello".into()));
    }

    #[test]
    fn primary_exists_only_on_x11() {
        let com = context(Backend::Com(ComFixture::new().manager.clone()));
        assert!(!com.primary_set(Some(text("x"))));
        assert!(com.primary().is_none());

        let fx = X11Fixture::new();
        let x11 = context(Backend::X11(fx.backend.clone()));
        assert!(x11.primary_set(Some(text("x"))));
        let offer = x11.primary().unwrap();
        assert_eq!(
            offer.data(&DataFormat::text()).wait(x11.loop_control(), None),
            Ok(ExchangeData::Text("x".into()))
        );
    }

    #[test]
    fn modal_drag_reports_completion() {
        let fx = ComFixture::new();
        let ctx = context(Backend::Com(fx.manager.clone()));
        ctx.set_listener(Box::new(Recorder::accepting(DropAction::Copy)));
        fx.drag_drop.aim_at(fx.manager.drop_target());
        assert!(ctx.start_drag_drop(text("x")));

        ctx.set_listener(Box::new(Recorder::accepting(DropAction::None)));
        assert!(!ctx.start_drag_drop(text("x")));
    }

    #[test]
    fn wayland_drag_stays_pending() {
        let fx = WaylandFixture::new();
        let ctx = context(Backend::Wayland(fx.backend.clone()));
        assert!(ctx.start_drag_drop(text("x")));
        assert_eq!(ctx.backend().name(), "wayland");
    }

    #[test]
    fn dispatch_surfaces_a_lost_connection() {
        let fx = ComFixture::new();
        let pump = Rc::new(ScriptPump::default());
        pump.push(|| Ok(()));
        let ctx = AppContext::new(Backend::Com(fx.manager.clone()), pump);
        assert!(ctx.dispatch().is_ok());
        assert!(ctx.dispatch().unwrap_err().is_fatal());
    }
}
