//! `IDropSource`.

use super::object::Unknown;
use super::types::{DropEffect, Guid, HResult, IID_IDROPSOURCE, MK_LBUTTON};

/// Decides when a modal `DoDragDrop` loop ends. The drag runs while the
/// button that started it stays down.
#[derive(Debug, Clone, Copy)]
pub struct DropSource {
    button: u32,
}

impl DropSource {
    pub fn new(button: u32) -> Self {
        Self { button }
    }

    pub fn query_continue_drag(&self, escape_pressed: bool, key_state: u32) -> HResult {
        if escape_pressed {
            HResult::DRAGDROP_S_CANCEL
        } else if key_state & self.button == 0 {
            HResult::DRAGDROP_S_DROP
        } else {
            HResult::S_OK
        }
    }

    pub fn give_feedback(&self, effect: DropEffect) -> HResult {
        tracing::trace!(?effect, "drag feedback");
        HResult::DRAGDROP_S_USEDEFAULTCURSORS
    }
}

impl Default for DropSource {
    fn default() -> Self {
        Self::new(MK_LBUTTON)
    }
}

impl Unknown for DropSource {
    fn interfaces(&self) -> &'static [Guid] {
        &[IID_IDROPSOURCE]
    }
}
