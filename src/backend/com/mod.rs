//! OLE data transfer: `IDataObject`, `IDropTarget` and `IDropSource`.
//!
//! Objects are plain Rust values behind [`ComObject`] handles; reference
//! counts are `Rc` counts. The OLE entry points the engine needs are the
//! [`OleClipboard`] and [`OleDragDrop`] seams, which a platform shim
//! implements over the native calls (and registers
//! [`ComDataManager::drop_target`] with `RegisterDragDrop`).
//!
//! `GetData` is synchronous, so every [`AsyncRequest`](crate::request::AsyncRequest)
//! this backend hands out is already resolved.

pub mod convert;
mod data_object;
mod drop_source;
mod drop_target;
mod manager;
mod object;
mod offer;
pub mod types;

pub use data_object::{ComDataObject, DataObject, EnumFormatEtc};
pub use drop_source::DropSource;
pub use drop_target::{DropTarget, SharedListener, hover_effect, performed_effect};
pub use manager::{ComDataManager, OleClipboard, OleDragDrop};
pub use object::{ComObject, Unknown};
pub use offer::ComOffer;
pub use types::{ClipFormat, DropEffect, FormatEtc, FormatRegistry, Guid, HResult, StgMedium};

#[cfg(test)]
pub(super) mod fixture {
    //! In-memory stand-ins for the OLE clipboard and `DoDragDrop`.

    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::types::MK_LBUTTON;
    use super::*;
    use crate::exchange::Position;

    pub use crate::backend::testing::Recorder;

    /// A process-wide clipboard holding one data object.
    #[derive(Default)]
    pub struct FakeClipboard {
        current: RefCell<Option<ComObject<dyn ComDataObject>>>,
        pub refuse: Cell<bool>,
        pub flushed: Cell<bool>,
    }

    impl FakeClipboard {
        pub fn holds_object(&self) -> bool {
            self.current.borrow().is_some()
        }
    }

    impl OleClipboard for FakeClipboard {
        fn set_clipboard(&self, data: Option<ComObject<dyn ComDataObject>>) -> HResult {
            if self.refuse.get() {
                return HResult::E_FAIL;
            }
            *self.current.borrow_mut() = data;
            HResult::S_OK
        }

        fn get_clipboard(&self) -> Result<ComObject<dyn ComDataObject>, HResult> {
            self.current.borrow().clone().ok_or(HResult::E_FAIL)
        }

        fn is_current_clipboard(&self, data: &ComObject<dyn ComDataObject>) -> bool {
            self.current
                .borrow()
                .as_ref()
                .is_some_and(|current| current.ptr_eq(data))
        }

        fn flush_clipboard(&self) -> HResult {
            self.flushed.set(true);
            self.current.borrow_mut().take();
            HResult::S_OK
        }
    }

    /// Plays one drag: press, enter, move, release (or escape) over the
    /// target it is aimed at.
    #[derive(Default)]
    pub struct FakeDragDrop {
        target: RefCell<Option<ComObject<DropTarget>>>,
        pub escape: Cell<bool>,
    }

    impl FakeDragDrop {
        pub fn aim_at(&self, target: ComObject<DropTarget>) {
            *self.target.borrow_mut() = Some(target);
        }
    }

    impl OleDragDrop for FakeDragDrop {
        fn do_drag_drop(
            &self,
            data: ComObject<dyn ComDataObject>,
            source: ComObject<DropSource>,
            allowed: DropEffect,
        ) -> (HResult, DropEffect) {
            let target = self.target.borrow().clone();
            let Some(target) = target else {
                return (HResult::DRAGDROP_S_DROP, DropEffect::NONE);
            };
            assert_eq!(source.query_continue_drag(false, MK_LBUTTON), HResult::S_OK);
            let effect = target
                .drag_enter(data.clone(), MK_LBUTTON, Position::new(5, 5), allowed)
                .unwrap_or(DropEffect::NONE);
            source.give_feedback(effect);
            let effect = target
                .drag_over(MK_LBUTTON, Position::new(6, 6), allowed)
                .unwrap_or(DropEffect::NONE);
            source.give_feedback(effect);

            match source.query_continue_drag(self.escape.get(), 0) {
                HResult::DRAGDROP_S_DROP if effect != DropEffect::NONE => {
                    let effect = target
                        .drop(data, 0, Position::new(6, 6), allowed)
                        .unwrap_or(DropEffect::NONE);
                    (HResult::DRAGDROP_S_DROP, effect)
                }
                HResult::DRAGDROP_S_DROP => {
                    target.drag_leave();
                    (HResult::DRAGDROP_S_DROP, DropEffect::NONE)
                }
                _ => {
                    target.drag_leave();
                    (HResult::DRAGDROP_S_CANCEL, DropEffect::NONE)
                }
            }
        }
    }

    pub struct Fixture {
        pub clipboard: Rc<FakeClipboard>,
        pub drag_drop: Rc<FakeDragDrop>,
        pub manager: Rc<ComDataManager>,
    }

    impl Fixture {
        pub fn new() -> Self {
            let clipboard = Rc::new(FakeClipboard::default());
            let drag_drop = Rc::new(FakeDragDrop::default());
            let manager = Rc::new(ComDataManager::new(clipboard.clone(), drag_drop.clone()));
            Self {
                clipboard,
                drag_drop,
                manager,
            }
        }
    }
}
