//! The data-device request surface and the events it produces.
//!
//! Protocol objects are referred to by [`OfferId`] / [`SourceId`]
//! handles; the transport owns the actual proxies.

use std::fmt;
use std::os::fd::{BorrowedFd, OwnedFd};

use crate::error::Result;
use crate::exchange::DropAction;

/// Handle of a `wl_data_offer` the compositor introduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OfferId(pub u32);

/// Handle of a `wl_data_source` we created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u32);

/// `wl_data_device_manager.dnd_action` bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct DndActions(pub u32);

impl DndActions {
    pub const NONE: DndActions = DndActions(0);
    pub const COPY: DndActions = DndActions(1);
    pub const MOVE: DndActions = DndActions(2);
    pub const ASK: DndActions = DndActions(4);

    pub fn contains(self, other: DndActions) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The single action a bit set names, preferring copy.
    pub fn to_action(self) -> DropAction {
        if self.contains(Self::COPY) {
            DropAction::Copy
        } else if self.contains(Self::MOVE) {
            DropAction::Move
        } else if self.contains(Self::ASK) {
            DropAction::Ask
        } else {
            DropAction::None
        }
    }

    /// Link has no data-device equivalent.
    pub fn from_action(action: DropAction) -> DndActions {
        match action {
            DropAction::Copy => Self::COPY,
            DropAction::Move => Self::MOVE,
            DropAction::Ask => Self::ASK,
            DropAction::None | DropAction::Link => Self::NONE,
        }
    }
}

impl std::ops::BitOr for DndActions {
    type Output = DndActions;

    fn bitor(self, rhs: DndActions) -> DndActions {
        DndActions(self.0 | rhs.0)
    }
}

impl fmt::Debug for DndActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [(Self::COPY, "copy"), (Self::MOVE, "move"), (Self::ASK, "ask")] {
            if self.contains(bit) {
                names.push(name);
            }
        }
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Everything `wl_data_device`, `wl_data_offer` and `wl_data_source`
/// send us.
#[derive(Debug)]
pub enum WaylandEvent {
    // wl_data_device
    /// A new offer object; its mime types follow as `Offer` events.
    DataOffer { offer: OfferId },
    Enter {
        serial: u32,
        x: f64,
        y: f64,
        offer: Option<OfferId>,
    },
    Leave,
    Motion { time: u32, x: f64, y: f64 },
    Drop,
    Selection { offer: Option<OfferId> },

    // wl_data_offer
    Offer { offer: OfferId, mime_type: String },
    SourceActions { offer: OfferId, actions: DndActions },
    Action { offer: OfferId, action: DndActions },

    // wl_data_source
    Target {
        source: SourceId,
        mime_type: Option<String>,
    },
    Send {
        source: SourceId,
        mime_type: String,
        fd: OwnedFd,
    },
    Cancelled { source: SourceId },
    DndDropPerformed { source: SourceId },
    DndFinished { source: SourceId },
    SourceAction { source: SourceId, action: DndActions },
}

/// Requests the data-device machinery issues.
pub trait WaylandTransport {
    /// Bound version of `wl_data_device_manager`. Drag actions need 3.
    fn version(&self) -> u32;

    /// Serial of the latest input event on our surfaces; selections and
    /// drags must be started with one.
    fn input_serial(&self) -> u32;

    fn offer_receive(&self, offer: OfferId, mime_type: &str, fd: BorrowedFd<'_>) -> Result<()>;

    fn offer_accept(&self, offer: OfferId, serial: u32, mime_type: Option<&str>) -> Result<()>;

    fn offer_set_actions(
        &self,
        offer: OfferId,
        actions: DndActions,
        preferred: DndActions,
    ) -> Result<()>;

    fn offer_finish(&self, offer: OfferId) -> Result<()>;

    fn offer_destroy(&self, offer: OfferId);

    fn create_source(&self) -> Result<SourceId>;

    fn source_offer(&self, source: SourceId, mime_type: &str) -> Result<()>;

    fn source_set_actions(&self, source: SourceId, actions: DndActions) -> Result<()>;

    fn source_destroy(&self, source: SourceId);

    fn set_selection(&self, source: Option<SourceId>, serial: u32) -> Result<()>;

    /// Start a drag from the surface that received `serial`.
    fn start_drag(&self, source: SourceId, serial: u32) -> Result<()>;

    fn flush(&self) -> Result<()>;
}
