//! X11 backend: ICCCM selections (CLIPBOARD, PRIMARY) and Xdnd.
//!
//! [`X11DataManager`] is the protocol engine; it owns every session and
//! only talks to the display through [`X11Transport`]. [`X11Backend`]
//! wraps it for the application and [`X11EventPump`] feeds it from a
//! live connection.

mod atoms;
mod driver;
mod manager;
mod offer;
mod selection;
mod transport;
mod xdnd;

pub use driver::{X11Backend, X11EventPump};
pub use manager::{ReplyTo, X11DataManager, X11Notice};
pub use offer::X11Offer;
pub use transport::{PropertyValue, X11Connection, X11Event, X11Transport, pack32};

#[cfg(test)]
pub(super) mod fixture {
    //! A backend over the recording transport.

    use std::cell::RefCell;
    use std::rc::Rc;

    use x11rb::protocol::xproto::Atom;

    use super::manager::X11DataManager;
    use super::transport::testing::{FakeTransport, OUR_WINDOW};
    use super::transport::{X11Event, X11Transport, pack32};
    use super::X11Backend;
    use crate::config::ExchangeConfig;
    use crate::exchange::{DataSource, MemorySource};

    pub use crate::backend::testing::Recorder;

    pub struct Fixture {
        pub transport: Rc<FakeTransport>,
        pub manager: Rc<RefCell<X11DataManager>>,
        pub backend: Rc<X11Backend>,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with_config(ExchangeConfig::default())
        }

        pub fn with_config(config: ExchangeConfig) -> Self {
            let transport = Rc::new(FakeTransport::default());
            let version = config.xdnd_version();
            let backend = Rc::new(
                X11Backend::new(transport.clone() as Rc<dyn X11Transport>, config)
                    .expect("fake transport never fails"),
            );
            // As X11Connection::connect does for the real window.
            transport.set_property(
                OUR_WINDOW,
                transport.atom("XdndAware"),
                transport.atom("ATOM"),
                32,
                pack32(&[version]),
            );
            let manager = backend.manager().clone();
            Self {
                transport,
                manager,
                backend,
            }
        }

        pub fn atom(&self, name: &str) -> Atom {
            self.transport.atom(name)
        }

        pub fn claim_clipboard(&self, source: MemorySource) {
            let source: Rc<dyn DataSource> = Rc::new(source);
            assert!(self.backend.clipboard_set(Some(source)));
            self.transport.take_sent();
        }
    }

    /// Feed one event as the pump would.
    pub fn deliver(fx: &Fixture, event: X11Event) {
        fx.backend
            .handle_event(event)
            .expect("fake transport never loses the connection");
    }
}
