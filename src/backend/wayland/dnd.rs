//! Data-device drag and drop, both directions.
//!
//! Target side: `enter` / `motion` / `leave` / `drop` on the device plus
//! the offer's `accept`, `set_actions` and `finish`. Source side: a
//! `wl_data_source` started with `start_drag` and its `target`, `action`,
//! `dnd_drop_performed`, `dnd_finished` and `cancelled` events.

use std::rc::Rc;

use super::device::{
    OfferRole, ReplyTo, SourceRole, SourceState, WaylandDataDevice, WaylandNotice,
};
use super::offer::{OfferKey, WaylandOffer};
use super::transport::{DndActions, OfferId, SourceId};
use crate::error::Result;
use crate::exchange::{
    DataOffer, DataSource, DndEvent, DndReply, DropAction, DropOutcome, Position, SourceSlot,
};
use crate::format::pick_raw;
use crate::request::{AsyncRequest, Completer, Outbox};

/// Surface-local fixed-point coordinates, rounded.
fn to_position(x: f64, y: f64) -> Position {
    Position::new(x.round() as i32, y.round() as i32)
}

// ---------------------------------------------------------------------------
// Target side
// ---------------------------------------------------------------------------

/// A drag some client is running over one of our surfaces.
pub(super) struct DndSession {
    pub(super) id: u64,
    /// `None` when the source offers no data at all.
    pub(super) offer: Option<OfferId>,
    serial: u32,
    handle: Rc<WaylandOffer>,
    position: Position,
    accepted: bool,
    dropped: bool,
    awaiting_reply: bool,
    released: bool,
    performed: DropAction,
    pub(super) outstanding: usize,
}

impl DndSession {
    fn shared_offer(&self) -> Rc<dyn DataOffer> {
        self.handle.clone()
    }

    fn finishable(&self) -> bool {
        self.dropped && self.released && !self.awaiting_reply && self.outstanding == 0
    }
}

impl WaylandDataDevice {
    pub(super) fn live_dnd(&self, id: u64) -> Option<&DndSession> {
        self.dnd.as_ref().filter(|s| s.id == id)
    }

    pub(super) fn live_dnd_mut(&mut self, id: u64) -> Option<&mut DndSession> {
        self.dnd.as_mut().filter(|s| s.id == id)
    }

    pub(super) fn dnd_enter(
        &mut self,
        serial: u32,
        x: f64,
        y: f64,
        offer: Option<OfferId>,
    ) -> Result<()> {
        self.abandon_dnd();
        let id = self.next_id();
        if let Some(offer) = offer {
            self.assign_role(offer, OfferRole::Dnd(id));
        }
        let handle = Rc::new(self.offer_handle(OfferKey::Drop(id), false));
        let position = to_position(x, y);
        tracing::debug!(
            serial,
            offer = offer.map(|o| o.0),
            formats = ?offer.and_then(|o| self.offers.get(&o)).map(|s| s.formats.raw().to_vec()),
            "drag entered"
        );
        let session = DndSession {
            id,
            offer,
            serial,
            handle,
            position,
            accepted: false,
            dropped: false,
            awaiting_reply: false,
            released: false,
            performed: DropAction::None,
            outstanding: 0,
        };
        let offer = session.shared_offer();
        self.dnd = Some(session);
        self.outbox.emit(WaylandNotice {
            event: DndEvent::Enter { position, offer },
            reply: ReplyTo::Position(id),
        });
        Ok(())
    }

    pub(super) fn dnd_motion(&mut self, x: f64, y: f64) {
        let Some(session) = self.dnd.as_mut().filter(|s| !s.dropped) else {
            tracing::debug!("motion outside a drag session");
            return;
        };
        session.position = to_position(x, y);
        let event = DndEvent::Move {
            position: session.position,
            offer: session.shared_offer(),
        };
        let id = session.id;
        self.outbox.emit(WaylandNotice {
            event,
            reply: ReplyTo::Position(id),
        });
    }

    /// Accept or refuse the offer at the current position.
    pub fn answer_position(&mut self, id: u64, reply: &DndReply) -> Result<()> {
        let has_actions = self.has_actions();
        let Some(session) = self.dnd.as_mut().filter(|s| s.id == id && !s.dropped) else {
            return Ok(());
        };
        let Some(offer) = session.offer else {
            return Ok(());
        };
        let offered = self
            .offers
            .get(&offer)
            .map(|state| state.formats.raw())
            .unwrap_or_default();
        let action = DndActions::from_action(reply.action);
        let mime_type = if reply.accepts() && !action.is_empty() {
            match &reply.format {
                Some(format) => pick_raw(format, offered),
                None => offered.first().map(String::as_str),
            }
            .map(str::to_string)
        } else {
            None
        };
        session.accepted = mime_type.is_some();
        let action = if session.accepted {
            action
        } else {
            DndActions::NONE
        };
        tracing::trace!(?mime_type, ?action, "answering drag position");
        self.transport
            .offer_accept(offer, session.serial, mime_type.as_deref())?;
        if has_actions {
            self.transport.offer_set_actions(offer, action, action)?;
        }
        self.transport.flush()
    }

    pub(super) fn dnd_leave(&mut self) {
        if self.dnd.as_ref().is_none_or(|s| s.dropped) {
            // The compositor also sends leave right after drop.
            return;
        }
        tracing::debug!("drag left");
        self.abandon_dnd();
    }

    pub(super) fn dnd_drop(&mut self) -> Result<()> {
        let Some(session) = self.dnd.as_mut().filter(|s| !s.dropped) else {
            tracing::debug!("drop outside a drag session");
            return Ok(());
        };
        session.dropped = true;
        let id = session.id;

        if !session.accepted {
            tracing::debug!("drop on a position we rejected");
            session.released = true;
            let offer = session.shared_offer();
            self.outbox.emit(WaylandNotice {
                event: DndEvent::Leave { offer },
                reply: ReplyTo::Nothing,
            });
            return self.maybe_finish_dnd(id);
        }

        session.awaiting_reply = true;
        let position = session.position;
        let offer: Box<dyn DataOffer> = Box::new(self.offer_handle(OfferKey::Drop(id), true));
        tracing::debug!(?position, "dropped");
        self.outbox.emit(WaylandNotice {
            event: DndEvent::Drop { position, offer },
            reply: ReplyTo::Drop(id),
        });
        Ok(())
    }

    /// Record the action the listener performed for a drop.
    pub fn answer_drop(&mut self, id: u64, reply: &DndReply) -> Result<()> {
        let has_actions = self.has_actions();
        let Some(session) = self.dnd.as_mut().filter(|s| s.id == id) else {
            return Ok(());
        };
        session.awaiting_reply = false;
        session.performed = reply.action;
        // An "ask" drop is settled by naming the chosen action.
        if has_actions
            && let Some(offer) = session.offer
            && self
                .offers
                .get(&offer)
                .is_some_and(|state| state.action.contains(DndActions::ASK))
            && matches!(reply.action, DropAction::Copy | DropAction::Move)
        {
            let chosen = DndActions::from_action(reply.action);
            self.transport.offer_set_actions(offer, chosen, chosen)?;
        }
        self.maybe_finish_dnd(id)
    }

    /// The owned drop offer was dropped by the application. Its reads
    /// have already been taken off the device.
    pub(super) fn release_drop(&mut self, id: u64) {
        let Some(session) = self.live_dnd_mut(id) else {
            return;
        };
        session.released = true;
        session.outstanding = 0;
        if let Err(e) = self.maybe_finish_dnd(id) {
            tracing::warn!(error = %e, "finishing drop failed");
        }
    }

    /// A read started through a drop offer resolved.
    pub(super) fn drop_request_done(&mut self, id: u64) {
        let Some(session) = self.live_dnd_mut(id) else {
            return;
        };
        session.outstanding = session.outstanding.saturating_sub(1);
        if let Err(e) = self.maybe_finish_dnd(id) {
            tracing::warn!(error = %e, "finishing drop failed");
        }
    }

    fn maybe_finish_dnd(&mut self, id: u64) -> Result<()> {
        if !self.live_dnd(id).is_some_and(DndSession::finishable) {
            return Ok(());
        }
        let Some(session) = self.dnd.take() else {
            return Ok(());
        };
        let Some(offer) = session.offer else {
            return Ok(());
        };
        // `finish` is a protocol error unless an action was accepted.
        if self.has_actions() && session.accepted && session.performed != DropAction::None {
            tracing::debug!(performed = ?session.performed, "finishing drop");
            self.transport.offer_finish(offer)?;
        }
        self.destroy_offer(offer);
        self.transport.flush()
    }

    /// Drop whatever session is open: reads fail, the listener hears
    /// `leave` if it has not seen the drop.
    fn abandon_dnd(&mut self) {
        let Some(session) = self.dnd.take() else {
            return;
        };
        if !session.dropped {
            self.outbox.emit(WaylandNotice {
                event: DndEvent::Leave {
                    offer: session.shared_offer(),
                },
                reply: ReplyTo::Nothing,
            });
        }
        if let Some(offer) = session.offer {
            self.destroy_offer(offer);
        }
    }
}

// ---------------------------------------------------------------------------
// Source side
// ---------------------------------------------------------------------------

/// A drag we started.
pub(super) struct DragState {
    source: SourceId,
    completer: Completer<DropOutcome>,
    /// Mime type the target currently accepts.
    target: Option<String>,
    action: DndActions,
    dropped: bool,
}

impl DragState {
    pub(super) fn cancel(self, outbox: &mut Outbox<WaylandNotice>) {
        outbox.complete(self.completer, DropOutcome::Cancelled);
    }
}

impl WaylandDataDevice {
    /// Start a drag offering `source` from the surface that saw the last
    /// input event. The request resolves once the target finishes or the
    /// drag is cancelled.
    pub fn start_drag(&mut self, source: Rc<dyn DataSource>) -> Result<AsyncRequest<DropOutcome>> {
        if let Some(previous) = self.drag.take() {
            tracing::debug!(source = previous.source.0, "new drag replaces the previous one");
            let id = previous.source;
            previous.cancel(&mut self.outbox);
            self.destroy_source(id);
        }

        let slot = SourceSlot::new(source);
        let id = self.create_source(&slot)?;
        if self.has_actions() {
            self.transport
                .source_set_actions(id, DndActions::COPY | DndActions::MOVE)?;
        }
        let serial = self.transport.input_serial();
        self.transport.start_drag(id, serial)?;
        self.transport.flush()?;
        tracing::debug!(source = id.0, formats = slot.formats().len(), "drag started");

        self.sources.insert(
            id,
            SourceState {
                slot,
                role: SourceRole::Drag,
            },
        );
        let (request, completer) = AsyncRequest::new();
        self.drag = Some(DragState {
            source: id,
            completer,
            target: None,
            action: DndActions::NONE,
            dropped: false,
        });
        Ok(request)
    }

    fn our_drag(&mut self, source: SourceId) -> Option<&mut DragState> {
        self.drag.as_mut().filter(|d| d.source == source)
    }

    pub(super) fn drag_target(&mut self, source: SourceId, mime_type: Option<String>) {
        if let Some(drag) = self.our_drag(source) {
            tracing::trace!(?mime_type, "drag target changed");
            drag.target = mime_type;
        }
    }

    pub(super) fn drag_action(&mut self, source: SourceId, action: DndActions) {
        if let Some(drag) = self.our_drag(source) {
            tracing::trace!(?action, "drag action changed");
            drag.action = action;
        }
    }

    pub(super) fn drag_dropped(&mut self, source: SourceId) {
        if let Some(drag) = self.our_drag(source) {
            tracing::debug!(target = ?drag.target, action = ?drag.action, "drag dropped");
            drag.dropped = true;
        }
    }

    pub(super) fn drag_finished(&mut self, source: SourceId) {
        let Some(drag) = self.drag.take_if(|d| d.source == source) else {
            return;
        };
        let action = match drag.action.to_action() {
            DropAction::None => DropAction::Copy,
            action => action,
        };
        tracing::debug!(?action, "drag finished");
        self.outbox
            .complete(drag.completer, DropOutcome::Completed(action));
        self.destroy_source(source);
    }

    /// `cancelled` for a drag source: refused, aborted or replaced.
    pub(super) fn drag_cancelled(&mut self, source: SourceId) {
        if let Some(drag) = self.drag.take_if(|d| d.source == source) {
            tracing::debug!(dropped = drag.dropped, "drag cancelled");
            drag.cancel(&mut self.outbox);
        }
    }
}
