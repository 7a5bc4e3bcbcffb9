//! [`ComDataManager`]: clipboard and drag-and-drop over the OLE entry
//! points.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::data_object::{ComDataObject, DataObject};
use super::drop_source::DropSource;
use super::drop_target::{DropTarget, SharedListener};
use super::object::ComObject;
use super::offer::ComOffer;
use super::types::{DropEffect, FormatRegistry, HResult};
use crate::exchange::{DataOffer, DataSource, DndListener, DropOutcome, LocalOffer, RejectAll};
use crate::request::AsyncRequest;

/// `OleSetClipboard`, `OleGetClipboard`, `OleIsCurrentClipboard` and
/// `OleFlushClipboard`.
pub trait OleClipboard {
    /// `None` empties the clipboard.
    fn set_clipboard(&self, data: Option<ComObject<dyn ComDataObject>>) -> HResult;

    fn get_clipboard(&self) -> Result<ComObject<dyn ComDataObject>, HResult>;

    fn is_current_clipboard(&self, data: &ComObject<dyn ComDataObject>) -> bool;

    /// Render everything and let go of our data object.
    fn flush_clipboard(&self) -> HResult;
}

/// `DoDragDrop`: runs the modal drag loop and returns once it ends.
pub trait OleDragDrop {
    fn do_drag_drop(
        &self,
        data: ComObject<dyn ComDataObject>,
        source: ComObject<DropSource>,
        allowed: DropEffect,
    ) -> (HResult, DropEffect);
}

struct Owned {
    source: Rc<dyn DataSource>,
    object: ComObject<dyn ComDataObject>,
}

pub struct ComDataManager {
    clipboard: Rc<dyn OleClipboard>,
    drag_drop: Rc<dyn OleDragDrop>,
    registry: Rc<FormatRegistry>,
    listener: SharedListener,
    target: ComObject<DropTarget>,
    owned: RefCell<Option<Owned>>,
    dragging: Cell<bool>,
}

impl ComDataManager {
    pub fn new(clipboard: Rc<dyn OleClipboard>, drag_drop: Rc<dyn OleDragDrop>) -> Self {
        let registry = Rc::new(FormatRegistry::new());
        let listener: SharedListener = Rc::new(RefCell::new(Box::new(RejectAll)));
        let target = ComObject::new(DropTarget::new(listener.clone(), registry.clone()));
        Self {
            clipboard,
            drag_drop,
            registry,
            listener,
            target,
            owned: RefCell::new(None),
            dragging: Cell::new(false),
        }
    }

    pub fn registry(&self) -> &Rc<FormatRegistry> {
        &self.registry
    }

    /// The target to hand to `RegisterDragDrop`.
    pub fn drop_target(&self) -> ComObject<DropTarget> {
        self.target.add_ref()
    }

    pub fn set_listener(&self, listener: Box<dyn DndListener>) {
        match self.listener.try_borrow_mut() {
            Ok(mut slot) => *slot = listener,
            Err(_) => tracing::warn!("cannot replace the listener from inside a callback"),
        }
    }

    /// Put `source` on the clipboard, or empty it with `None`.
    pub fn clipboard_set(&self, source: Option<Rc<dyn DataSource>>) -> bool {
        let Some(source) = source else {
            self.owned.borrow_mut().take();
            let hr = self.clipboard.set_clipboard(None);
            if hr.is_err() {
                tracing::warn!(%hr, "OleSetClipboard(NULL) failed");
            }
            return hr.is_ok();
        };

        let object = self.data_object(source.clone());
        let hr = self.clipboard.set_clipboard(Some(object.clone()));
        if hr.is_err() {
            tracing::warn!(%hr, "OleSetClipboard failed");
            return false;
        }
        tracing::debug!("clipboard claimed");
        *self.owned.borrow_mut() = Some(Owned { source, object });
        true
    }

    /// The current clipboard contents; our own source directly while we
    /// still own it.
    pub fn clipboard(&self) -> Option<Rc<dyn DataOffer>> {
        let local = {
            let mut owned = self.owned.borrow_mut();
            let current = owned
                .as_ref()
                .map(|o| (self.clipboard.is_current_clipboard(&o.object), o.source.clone()));
            match current {
                Some((true, source)) => Some(source),
                Some((false, _)) => {
                    tracing::debug!("clipboard ownership lost");
                    *owned = None;
                    None
                }
                None => None,
            }
        };
        if let Some(source) = local {
            return Some(Rc::new(LocalOffer::new(source)));
        }

        let object = match self.clipboard.get_clipboard() {
            Ok(object) => object,
            Err(hr) => {
                tracing::debug!(%hr, "OleGetClipboard failed");
                return None;
            }
        };
        let offer = ComOffer::new(object, self.registry.clone());
        if offer.format_list().is_empty() {
            return None;
        }
        Some(Rc::new(offer))
    }

    pub fn owns_clipboard(&self) -> bool {
        self.owned
            .borrow()
            .as_ref()
            .is_some_and(|o| self.clipboard.is_current_clipboard(&o.object))
    }

    /// Run a drag with `source`. `DoDragDrop` is modal, so the request is
    /// resolved by the time this returns.
    pub fn start_drag(&self, source: Rc<dyn DataSource>) -> AsyncRequest<DropOutcome> {
        if self.dragging.replace(true) {
            tracing::warn!("drag already in progress");
            return AsyncRequest::failed();
        }
        let object = self.data_object(source);
        let (hr, effect) = self.drag_drop.do_drag_drop(
            object,
            ComObject::new(DropSource::default()),
            DropEffect::COPY | DropEffect::MOVE,
        );
        self.dragging.set(false);

        let outcome = match hr {
            HResult::DRAGDROP_S_DROP if effect != DropEffect::NONE => {
                DropOutcome::Completed(effect.to_action())
            }
            HResult::DRAGDROP_S_DROP | HResult::DRAGDROP_S_CANCEL => DropOutcome::Cancelled,
            hr => {
                tracing::warn!(%hr, "DoDragDrop failed");
                DropOutcome::Cancelled
            }
        };
        tracing::debug!(?outcome, ?effect, "drag finished");
        AsyncRequest::ready(outcome)
    }

    /// Leave the clipboard contents behind for other applications.
    pub fn shutdown(&self) {
        let owned = self.owned.borrow_mut().take();
        if let Some(owned) = owned
            && self.clipboard.is_current_clipboard(&owned.object)
        {
            let hr = self.clipboard.flush_clipboard();
            if hr.is_err() {
                tracing::warn!(%hr, "OleFlushClipboard failed");
            }
        }
        self.target.drag_leave();
    }

    fn data_object(&self, source: Rc<dyn DataSource>) -> ComObject<dyn ComDataObject> {
        let object = Rc::new(DataObject::new(source, self.registry.clone()));
        ComObject::from_rc(object as Rc<dyn ComDataObject>)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixture::{Fixture, Recorder};
    use super::*;
    use crate::exchange::{DropAction, MemorySource};
    use crate::format::{DataFormat, ExchangeData};

    fn text(value: &str) -> Rc<dyn DataSource> {
        Rc::new(MemorySource::text(value))
    }

    // -- Clipboard --

    #[test]
    fn own_clipboard_reads_back_locally() {
        let fx = Fixture::new();
        assert!(fx.manager.clipboard_set(Some(text("mine"))));
        let offer = fx.manager.clipboard().unwrap();
        assert_eq!(
            offer.data(&DataFormat::text()).try_take().unwrap(),
            Some(ExchangeData::Text("mine".into()))
        );
        assert!(fx.clipboard.holds_object());
    }

    #[test]
    fn ownership_follows_the_clipboard() {
        let fx = Fixture::new();
        assert!(!fx.manager.owns_clipboard());
        assert!(fx.manager.clipboard_set(Some(text("x"))));
        assert!(fx.manager.owns_clipboard());
        let other = ComDataManager::new(fx.clipboard.clone(), fx.drag_drop.clone());
        assert!(other.clipboard_set(Some(text("y"))));
        assert!(!fx.manager.owns_clipboard());
    }

    #[test]
    fn foreign_clipboard_goes_through_get_data() {
        let fx = Fixture::new();
        let other = ComDataManager::new(fx.clipboard.clone(), fx.drag_drop.clone());
        assert!(other.clipboard_set(Some(text("theirs"))));

        let offer = fx.manager.clipboard().unwrap();
        assert_eq!(
            offer.formats().try_take().unwrap(),
            Some(vec![DataFormat::text()])
        );
        assert_eq!(
            offer.data(&DataFormat::text()).try_take().unwrap(),
            Some(ExchangeData::Text("theirs".into()))
        );
    }

    #[test]
    fn losing_ownership_is_noticed() {
        let fx = Fixture::new();
        assert!(fx.manager.clipboard_set(Some(text("first"))));
        let other = ComDataManager::new(fx.clipboard.clone(), fx.drag_drop.clone());
        assert!(other.clipboard_set(Some(text("second"))));
        let offer = fx.manager.clipboard().unwrap();
        assert_eq!(
            offer.data(&DataFormat::text()).try_take().unwrap(),
            Some(ExchangeData::Text("second".into()))
        );
    }

    #[test]
    fn empty_clipboard_has_no_offer() {
        let fx = Fixture::new();
        assert!(fx.manager.clipboard().is_none());
        assert!(fx.manager.clipboard_set(Some(text("x"))));
        assert!(fx.manager.clipboard_set(None));
        assert!(fx.manager.clipboard().is_none());
        assert!(!fx.clipboard.holds_object());
    }

    #[test]
    fn refused_clipboard_reports_failure() {
        let fx = Fixture::new();
        fx.clipboard.refuse.set(true);
        assert!(!fx.manager.clipboard_set(Some(text("x"))));
        assert!(fx.manager.clipboard().is_none());
    }

    #[test]
    fn shutdown_flushes_owned_clipboard() {
        let fx = Fixture::new();
        fx.manager.shutdown();
        assert!(!fx.clipboard.flushed.get());
        assert!(fx.manager.clipboard_set(Some(text("x"))));
        fx.manager.shutdown();
        assert!(fx.clipboard.flushed.get());
    }

    // -- Drag and drop --

    #[test]
    fn drag_onto_ourselves() {
        let fx = Fixture::new();
        let recorder = Recorder::accepting(DropAction::Move);
        fx.manager.set_listener(Box::new(recorder.clone()));
        fx.drag_drop.aim_at(fx.manager.drop_target());

        let outcome = fx.manager.start_drag(text("dragged"));
        assert_eq!(
            outcome.try_take().unwrap(),
            Some(DropOutcome::Completed(DropAction::Move))
        );
        assert_eq!(recorder.kinds(), vec!["enter", "move", "drop"]);
        let offer = recorder.take_dropped().unwrap();
        assert_eq!(
            offer.data(&DataFormat::text()).try_take().unwrap(),
            Some(ExchangeData::Text("dragged".into()))
        );
    }

    #[test]
    fn escape_cancels_the_drag() {
        let fx = Fixture::new();
        let recorder = Recorder::accepting(DropAction::Copy);
        fx.manager.set_listener(Box::new(recorder.clone()));
        fx.drag_drop.aim_at(fx.manager.drop_target());
        fx.drag_drop.escape.set(true);

        let outcome = fx.manager.start_drag(text("x"));
        assert_eq!(outcome.try_take().unwrap(), Some(DropOutcome::Cancelled));
        assert_eq!(recorder.kinds(), vec!["enter", "move", "leave"]);
    }

    #[test]
    fn rejected_drop_is_cancelled() {
        let fx = Fixture::new();
        fx.manager
            .set_listener(Box::new(Recorder::accepting(DropAction::None)));
        fx.drag_drop.aim_at(fx.manager.drop_target());
        let outcome = fx.manager.start_drag(text("x"));
        assert_eq!(outcome.try_take().unwrap(), Some(DropOutcome::Cancelled));
    }

    #[test]
    fn drag_without_target_is_cancelled() {
        let fx = Fixture::new();
        let outcome = fx.manager.start_drag(text("x"));
        assert_eq!(outcome.try_take().unwrap(), Some(DropOutcome::Cancelled));
    }
}
