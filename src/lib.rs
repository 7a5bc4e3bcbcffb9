//! Clipboard and drag-and-drop data exchange.
//!
//! One asynchronous model over three native protocols: X11 selections
//! and Xdnd, the Wayland data device, and OLE data objects. Producers
//! implement [`DataSource`]; consumers receive a [`DataOffer`] whose
//! every query returns an [`AsyncRequest`] resolved by the event loop.
//!
//! Everything runs on the thread that owns the event loop.

pub mod backend;
pub mod config;
pub mod error;
pub mod exchange;
pub mod format;
pub mod request;

pub use backend::{AppContext, Backend};
pub use config::{BackendKind, ExchangeConfig};
pub use error::{ExchangeError, Result, WaitError};
pub use exchange::{
    DataOffer, DataSource, DndEvent, DndListener, DndReply, DropAction, DropOutcome, MemorySource,
    Position,
};
pub use format::{DataFormat, ExchangeData, ImageBuffer};
pub use request::{AsyncRequest, CancelHandle, Completer, EventPump, LoopControl};
