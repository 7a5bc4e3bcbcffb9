//! `IDropTarget`: OLE drag notifications turned into [`DndEvent`]s.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::data_object::ComDataObject;
use super::object::{ComObject, Unknown};
use super::offer::ComOffer;
use super::types::{DropEffect, FormatRegistry, Guid, HResult, IID_IDROPTARGET, MK_CONTROL, MK_SHIFT};
use crate::exchange::{DataOffer, DndEvent, DndListener, DndReply, Position};

/// Listener slot shared between the manager and its drop target.
pub type SharedListener = Rc<RefCell<Box<dyn DndListener>>>;

struct Session {
    offer: Rc<dyn DataOffer>,
    valid: Rc<Cell<bool>>,
    reply: DndReply,
}

impl Session {
    fn end(self) -> Rc<dyn DataOffer> {
        self.valid.set(false);
        self.offer
    }
}

pub struct DropTarget {
    listener: SharedListener,
    registry: Rc<FormatRegistry>,
    session: RefCell<Option<Session>>,
}

impl DropTarget {
    pub fn new(listener: SharedListener, registry: Rc<FormatRegistry>) -> Self {
        Self {
            listener,
            registry,
            session: RefCell::new(None),
        }
    }

    fn notify(&self, event: DndEvent) -> DndReply {
        tracing::debug!(?event, "drop target event");
        match self.listener.try_borrow_mut() {
            Ok(mut listener) => listener.dnd_event(event),
            Err(_) => {
                tracing::warn!(kind = event.kind(), "listener busy, rejecting");
                DndReply::reject()
            }
        }
    }

    pub fn drag_enter(
        &self,
        data: ComObject<dyn ComDataObject>,
        key_state: u32,
        point: Position,
        allowed: DropEffect,
    ) -> Result<DropEffect, HResult> {
        // A DragEnter without the previous DragLeave ends that session.
        let stale = self.session.borrow_mut().take();
        if let Some(stale) = stale {
            self.notify(DndEvent::Leave {
                offer: stale.end(),
            });
        }

        let valid = Rc::new(Cell::new(true));
        let offer: Rc<dyn DataOffer> = Rc::new(ComOffer::with_validity(
            data,
            self.registry.clone(),
            valid.clone(),
        ));
        let reply = self.notify(DndEvent::Enter {
            position: point,
            offer: offer.clone(),
        });
        let effect = hover_effect(&reply, key_state, allowed);
        *self.session.borrow_mut() = Some(Session {
            offer,
            valid,
            reply,
        });
        Ok(effect)
    }

    pub fn drag_over(
        &self,
        key_state: u32,
        point: Position,
        allowed: DropEffect,
    ) -> Result<DropEffect, HResult> {
        let offer = match &*self.session.borrow() {
            Some(session) => session.offer.clone(),
            None => return Ok(DropEffect::NONE),
        };
        let reply = self.notify(DndEvent::Move {
            position: point,
            offer,
        });
        let effect = hover_effect(&reply, key_state, allowed);
        if let Some(session) = self.session.borrow_mut().as_mut() {
            session.reply = reply;
        }
        Ok(effect)
    }

    pub fn drag_leave(&self) -> HResult {
        let session = self.session.borrow_mut().take();
        if let Some(session) = session {
            self.notify(DndEvent::Leave {
                offer: session.end(),
            });
        }
        HResult::S_OK
    }

    /// `Drop`. A drop where the last answer was a rejection is reported as
    /// a leave and performs nothing.
    pub fn drop(
        &self,
        data: ComObject<dyn ComDataObject>,
        _key_state: u32,
        point: Position,
        allowed: DropEffect,
    ) -> Result<DropEffect, HResult> {
        let session = self.session.borrow_mut().take();
        if let Some(session) = session {
            let accepted = session.reply.accepts();
            let offer = session.end();
            if !accepted {
                self.notify(DndEvent::Leave { offer });
                return Ok(DropEffect::NONE);
            }
        }

        let offer = Box::new(ComOffer::new(data, self.registry.clone()));
        let reply = self.notify(DndEvent::Drop {
            position: point,
            offer,
        });
        Ok(performed_effect(&reply, allowed))
    }
}

impl Unknown for DropTarget {
    fn interfaces(&self) -> &'static [Guid] {
        &[IID_IDROPTARGET]
    }
}

/// Effect shown while hovering. Ctrl forces copy, Shift forces move,
/// both force link, when the source allows it.
pub fn hover_effect(reply: &DndReply, key_state: u32, allowed: DropEffect) -> DropEffect {
    if !reply.accepts() {
        return DropEffect::NONE;
    }
    let forced = match (key_state & MK_CONTROL != 0, key_state & MK_SHIFT != 0) {
        (true, true) => Some(DropEffect::LINK),
        (true, false) => Some(DropEffect::COPY),
        (false, true) => Some(DropEffect::MOVE),
        (false, false) => None,
    };
    if let Some(forced) = forced
        && allowed.contains(forced)
    {
        return forced;
    }
    performed_effect(reply, allowed)
}

/// The reply's action if allowed, else the first allowed effect.
pub fn performed_effect(reply: &DndReply, allowed: DropEffect) -> DropEffect {
    if !reply.accepts() {
        return DropEffect::NONE;
    }
    let wanted = DropEffect::from_action(reply.action);
    if allowed.contains(wanted) {
        return wanted;
    }
    [DropEffect::COPY, DropEffect::MOVE, DropEffect::LINK]
        .into_iter()
        .find(|effect| allowed.contains(*effect))
        .unwrap_or(DropEffect::NONE)
}
