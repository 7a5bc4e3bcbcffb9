//! Wayland backend: the core data-device protocol (selection and drag and
//! drop).
//!
//! [`WaylandDataDevice`] is the protocol engine over the
//! [`WaylandTransport`] seam. Transfers run through non-blocking pipes the
//! event loop polls alongside the display fd. The `wayland` feature adds
//! [`native`], the wayland-client glue.

mod device;
mod dnd;
mod driver;
mod offer;
mod pipe;
mod transport;

#[cfg(feature = "wayland")]
pub mod native;

pub use device::{PipeInterest, ReplyTo, WaylandDataDevice, WaylandNotice};
pub use driver::WaylandBackend;
pub use offer::WaylandOffer;
pub use pipe::{PipeReader, PipeWriter, ReadStatus};
pub use transport::{DndActions, OfferId, SourceId, WaylandEvent, WaylandTransport};

#[cfg(test)]
pub(super) mod fixture {
    //! A backend over the recording transport.

    use std::cell::RefCell;
    use std::rc::Rc;

    use super::device::WaylandDataDevice;
    use super::driver::WaylandBackend;
    use super::transport::testing::FakeTransport;
    use super::transport::{WaylandEvent, WaylandTransport};
    use crate::config::ExchangeConfig;

    pub use crate::backend::testing::Recorder;

    pub struct Fixture {
        pub transport: Rc<FakeTransport>,
        pub device: Rc<RefCell<WaylandDataDevice>>,
        pub backend: Rc<WaylandBackend>,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with_config(ExchangeConfig::default())
        }

        pub fn with_config(config: ExchangeConfig) -> Self {
            let transport = Rc::new(FakeTransport::default());
            let backend = Rc::new(WaylandBackend::new(
                transport.clone() as Rc<dyn WaylandTransport>,
                config,
            ));
            let device = backend.device().clone();
            Self {
                transport,
                device,
                backend,
            }
        }

        /// Feed one event as the pump would.
        pub fn deliver(&self, event: WaylandEvent) {
            self.backend
                .handle_event(event)
                .expect("fake transport never loses the connection");
        }
    }
}
