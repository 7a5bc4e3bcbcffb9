//! Xdnd, both directions.
//!
//! As a target we answer every `XdndPosition` with an `XdndStatus` in the
//! same tick, hand the listener an owned offer on `XdndDrop`, and send
//! `XdndFinished` once that offer is released and every conversion it
//! started has resolved. As a source we own `XdndSelection`, send one
//! position at a time (later motion is coalesced until the status
//! arrives), and defer the drop until the last status is in.
//!
//! Client message layouts follow the Xdnd specification: data[0] is
//! always the sending window, the version sits in the high byte of the
//! enter message's data[1], positions pack root `x << 16 | y`.

use std::rc::Rc;

use x11rb::protocol::xproto::{Atom, Timestamp, Window};

use super::manager::{ReplyTo, X11DataManager, X11Notice};
use super::offer::{OfferKey, X11Offer};
use super::selection::{Conversion, OwnedSelection};
use super::transport::pack32;
use crate::config::XDND_MIN_VERSION;
use crate::error::Result;
use crate::exchange::{
    DataOffer, DataSource, DndEvent, DndReply, DropAction, DropOutcome, FormatCache, Position,
    SourceSlot,
};
use crate::request::{AsyncRequest, Completer, Outbox};

/// Set in `XdndEnter` data[1] when the types live in `XdndTypeList`.
const ENTER_TYPE_LIST: u32 = 1;
/// `XdndStatus` data[1]: the target accepts the drop.
const STATUS_ACCEPT: u32 = 1;
/// `XdndStatus` data[1]: keep sending positions inside the rectangle.
const STATUS_WANT_POSITIONS: u32 = 2;
/// `XdndFinished` data[1] (version 5): the drop was performed.
const FINISHED_SUCCESS: u32 = 1;

fn pack_position(position: Position) -> u32 {
    ((position.x as u32 & 0xffff) << 16) | (position.y as u32 & 0xffff)
}

fn unpack_position(packed: u32) -> Position {
    Position::new(
        i32::from((packed >> 16) as u16 as i16),
        i32::from((packed & 0xffff) as u16 as i16),
    )
}

// ---------------------------------------------------------------------------
// Target side
// ---------------------------------------------------------------------------

/// A drag some other client is running over our window.
pub(super) struct DropSession {
    pub(super) id: u64,
    source: Window,
    /// Our window the messages were addressed to.
    target: Window,
    version: u32,
    pub(super) formats: FormatCache,
    offer: Rc<X11Offer>,
    position: Position,
    entered: bool,
    accepted: bool,
    /// Timestamp of the last position, then of the drop.
    pub(super) time: Timestamp,
    dropped: bool,
    awaiting_reply: bool,
    released: bool,
    performed: DropAction,
    pub(super) outstanding: usize,
}

impl DropSession {
    fn shared_offer(&self) -> Rc<dyn DataOffer> {
        self.offer.clone()
    }

    fn finishable(&self) -> bool {
        self.dropped && self.released && !self.awaiting_reply && self.outstanding == 0
    }
}

impl X11DataManager {
    pub(super) fn live_drop(&self, id: u64) -> Option<&DropSession> {
        self.drop_session.as_ref().filter(|s| s.id == id)
    }

    pub(super) fn live_drop_mut(&mut self, id: u64) -> Option<&mut DropSession> {
        self.drop_session.as_mut().filter(|s| s.id == id)
    }

    /// Format-32 values of a property on a foreign window. A window that
    /// vanished reads as empty.
    fn read_u32s(&self, window: Window, property: Atom) -> Result<Vec<u32>> {
        match self.transport.get_property(window, property, false) {
            Ok(value) => Ok(value.map(|v| v.atoms()).unwrap_or_default()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::debug!(window, error = %e, "cannot read property");
                Ok(Vec::new())
            }
        }
    }

    pub(super) fn xdnd_enter(&mut self, window: Window, data: [u32; 5]) -> Result<()> {
        let source = data[0];
        let version = data[1] >> 24;
        if version < XDND_MIN_VERSION {
            tracing::debug!(source, version, "ignoring drag from an old Xdnd client");
            return Ok(());
        }
        self.abandon_drop()?;

        let types = if data[1] & ENTER_TYPE_LIST != 0 {
            self.read_u32s(source, self.atoms.XdndTypeList)?
        } else {
            data[2..].to_vec()
        };
        let names = self.names.names(&*self.transport, &types);
        let id = self.next_id();
        let offer = Rc::new(self.offer_handle(OfferKey::Drop(id), false));
        tracing::debug!(source, version, formats = ?names, "drag entered");

        self.drop_session = Some(DropSession {
            id,
            source,
            target: window,
            version: version.min(self.config.xdnd_version()),
            formats: FormatCache::from_raw(names),
            offer,
            position: Position::default(),
            entered: false,
            accepted: false,
            time: x11rb::CURRENT_TIME,
            dropped: false,
            awaiting_reply: false,
            released: false,
            performed: DropAction::None,
            outstanding: 0,
        });
        Ok(())
    }

    /// Raise enter (first position) or move; the reply comes back through
    /// [`answer_position`](Self::answer_position) before the next event.
    pub(super) fn xdnd_position(&mut self, data: [u32; 5]) -> Result<()> {
        let Some(session) = self
            .drop_session
            .as_mut()
            .filter(|s| s.source == data[0] && !s.dropped)
        else {
            tracing::debug!(source = data[0], "position outside a drag session");
            return Ok(());
        };
        session.position = unpack_position(data[2]);
        session.time = data[3];
        let offer = session.shared_offer();
        let position = session.position;
        let event = if session.entered {
            DndEvent::Move { position, offer }
        } else {
            session.entered = true;
            DndEvent::Enter { position, offer }
        };
        let id = session.id;
        self.outbox.emit(X11Notice {
            event,
            reply: ReplyTo::Position(id),
        });
        Ok(())
    }

    /// Send `XdndStatus` for the listener's answer to a position.
    pub fn answer_position(&mut self, id: u64, reply: &DndReply) -> Result<()> {
        let a = self.atoms;
        let Some(session) = self.live_drop_mut(id) else {
            return Ok(());
        };
        let accept = reply.accepts()
            && reply
                .format
                .as_ref()
                .is_none_or(|f| session.formats.offers(f));
        session.accepted = accept;
        let action = if accept { reply.action } else { DropAction::None };
        let flags = (if accept { STATUS_ACCEPT } else { 0 }) | STATUS_WANT_POSITIONS;
        let data = [session.target, flags, 0, 0, a.action_atom(action)];
        let source = session.source;
        tracing::trace!(accept, ?action, "sending XdndStatus");
        self.transport
            .send_client_message(source, source, a.XdndStatus, data)?;
        self.transport.flush()
    }

    pub(super) fn xdnd_leave(&mut self, data: [u32; 5]) -> Result<()> {
        let matches = self
            .drop_session
            .as_ref()
            .is_some_and(|s| s.source == data[0] && !s.dropped);
        if !matches {
            return Ok(());
        }
        let Some(session) = self.drop_session.take() else {
            return Ok(());
        };
        tracing::debug!(source = session.source, "drag left");
        self.withdraw_drop(&session);
        Ok(())
    }

    pub(super) fn xdnd_drop(&mut self, data: [u32; 5]) -> Result<()> {
        let Some(session) = self
            .drop_session
            .as_mut()
            .filter(|s| s.source == data[0] && !s.dropped)
        else {
            tracing::debug!(source = data[0], "drop outside a drag session");
            return Ok(());
        };
        session.dropped = true;
        session.time = data[2];
        let id = session.id;

        if !session.accepted {
            tracing::debug!("drop on a position we rejected");
            session.released = true;
            if session.entered {
                let offer = session.shared_offer();
                self.outbox.emit(X11Notice {
                    event: DndEvent::Leave { offer },
                    reply: ReplyTo::Nothing,
                });
            }
            return self.maybe_finish_drop(id);
        }

        session.awaiting_reply = true;
        let position = session.position;
        let offer: Box<dyn DataOffer> = Box::new(self.offer_handle(OfferKey::Drop(id), true));
        tracing::debug!(?position, "dropped");
        self.outbox.emit(X11Notice {
            event: DndEvent::Drop { position, offer },
            reply: ReplyTo::Drop(id),
        });
        Ok(())
    }

    /// Record the action the listener performed for a drop.
    pub fn answer_drop(&mut self, id: u64, reply: &DndReply) -> Result<()> {
        let Some(session) = self.live_drop_mut(id) else {
            return Ok(());
        };
        session.awaiting_reply = false;
        session.performed = reply.action;
        self.maybe_finish_drop(id)
    }

    /// The owned drop offer was dropped by the application. Reads still
    /// pending are abandoned; the caller drops them outside the borrow,
    /// which fails their requests.
    pub(super) fn release_drop(&mut self, id: u64) -> (Vec<Conversion>, Result<()>) {
        if self.live_drop(id).is_none() {
            return (Vec::new(), Ok(()));
        }
        let abandoned = self.take_conversions(OfferKey::Drop(id));
        if let Some(session) = self.live_drop_mut(id) {
            if session.outstanding > 0 {
                tracing::debug!(
                    pending = session.outstanding,
                    "drop offer released with reads pending"
                );
            }
            session.released = true;
            session.outstanding = 0;
        }
        (abandoned, self.maybe_finish_drop(id))
    }

    /// A conversion started through a drop offer resolved.
    pub(super) fn drop_request_done(&mut self, id: u64) {
        let Some(session) = self.live_drop_mut(id) else {
            return;
        };
        session.outstanding = session.outstanding.saturating_sub(1);
        if let Err(e) = self.maybe_finish_drop(id) {
            tracing::warn!(error = %e, "sending XdndFinished failed");
        }
    }

    fn maybe_finish_drop(&mut self, id: u64) -> Result<()> {
        if !self.live_drop(id).is_some_and(DropSession::finishable) {
            return Ok(());
        }
        let Some(session) = self.drop_session.take() else {
            return Ok(());
        };
        self.send_finished(&session, session.performed)
    }

    fn send_finished(&self, session: &DropSession, performed: DropAction) -> Result<()> {
        let a = self.atoms;
        let mut data = [session.target, 0, 0, 0, 0];
        if session.version >= 5 {
            data[1] = if performed == DropAction::None {
                0
            } else {
                FINISHED_SUCCESS
            };
            data[2] = a.action_atom(performed);
        }
        tracing::debug!(source = session.source, ?performed, "sending XdndFinished");
        self.transport
            .send_client_message(session.source, session.source, a.XdndFinished, data)?;
        self.transport.flush()
    }

    /// Fail a withdrawn session's conversions and tell the listener.
    fn withdraw_drop(&mut self, session: &DropSession) {
        for conversion in self.take_conversions(OfferKey::Drop(session.id)) {
            conversion.fail(&mut self.outbox);
        }
        if session.entered && !session.dropped {
            self.outbox.emit(X11Notice {
                event: DndEvent::Leave {
                    offer: session.shared_offer(),
                },
                reply: ReplyTo::Nothing,
            });
        }
    }

    /// A new drag supersedes whatever session is still open.
    fn abandon_drop(&mut self) -> Result<()> {
        let Some(session) = self.drop_session.take() else {
            return Ok(());
        };
        tracing::debug!(source = session.source, "abandoning previous drag session");
        self.withdraw_drop(&session);
        if session.dropped {
            self.send_finished(&session, DropAction::None)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Source side
// ---------------------------------------------------------------------------

/// The window we are currently dragging over.
struct DragTarget {
    window: Window,
    /// Where messages go: the window itself or its `XdndProxy`.
    dest: Window,
    version: u32,
    awaiting_status: bool,
    queued: Option<(Position, Timestamp)>,
    accepted: bool,
    action: DropAction,
    dropped: bool,
}

/// A drag we started.
pub(super) struct DragSession {
    type_atoms: Vec<Atom>,
    target: Option<DragTarget>,
    completer: Option<Completer<DropOutcome>>,
    release_time: Option<Timestamp>,
}

impl DragSession {
    /// Resolve the outcome as cancelled without any further messages.
    pub(super) fn cancel(self, outbox: &mut Outbox<X11Notice>) {
        if let Some(completer) = self.completer {
            outbox.complete(completer, DropOutcome::Cancelled);
        }
    }
}

enum ReleaseStep {
    Wait,
    Drop { dest: Window, window: Window },
    Reject,
    Cancel,
}

impl X11DataManager {
    /// Claim `XdndSelection` for `source` and start a drag session.
    /// Supersedes a drag still in progress.
    pub fn start_drag(&mut self, source: Rc<dyn DataSource>) -> Result<bool> {
        if self.drag.is_some() {
            self.cancel_drag()?;
        }
        let slot = SourceSlot::new(source);
        if slot.formats().is_empty() {
            tracing::warn!("refusing to drag a source without formats");
            return Ok(false);
        }

        let a = self.atoms;
        let mut type_atoms = Vec::new();
        for name in slot.raw_names() {
            type_atoms.push(self.names.atom(&*self.transport, &name)?);
        }
        self.transport
            .set_selection_owner(a.XdndSelection, x11rb::CURRENT_TIME)?;
        if type_atoms.len() > 3 {
            self.transport.change_property(
                self.our_window(),
                a.XdndTypeList,
                a.ATOM,
                32,
                &pack32(&type_atoms),
            )?;
        }
        self.owned.insert(
            a.XdndSelection,
            OwnedSelection {
                slot,
                time: x11rb::CURRENT_TIME,
            },
        );
        self.drag = Some(DragSession {
            type_atoms,
            target: None,
            completer: None,
            release_time: None,
        });
        tracing::debug!("drag started");
        self.transport.flush()?;
        Ok(true)
    }

    /// Pointer moved to `position` over `window` (the top-level under the
    /// pointer, if any).
    pub fn drag_motion(
        &mut self,
        window: Option<Window>,
        position: Position,
        time: Timestamp,
    ) -> Result<()> {
        let Some(drag) = self.drag.as_ref() else {
            return Ok(());
        };
        if drag.release_time.is_some() {
            return Ok(());
        }
        let current = drag.target.as_ref().map(|t| t.window);
        if current != window {
            self.leave_target()?;
            if let Some(window) = window {
                self.enter_target(window)?;
            }
        }
        self.send_position(position, time)?;
        self.transport.flush()
    }

    /// Button released. The request resolves when the target sends
    /// `XdndFinished`, or as cancelled if nothing accepts the drop.
    pub fn drag_release(&mut self, time: Timestamp) -> Result<AsyncRequest<DropOutcome>> {
        let Some(drag) = self.drag.as_mut() else {
            return Ok(AsyncRequest::failed());
        };
        if drag.release_time.is_some() {
            tracing::warn!("drag already released");
            return Ok(AsyncRequest::failed());
        }
        let (request, completer) = AsyncRequest::new();
        drag.completer = Some(completer);
        drag.release_time = Some(time);
        if let Some(target) = drag.target.as_mut() {
            target.queued = None;
        }
        self.try_release()?;
        self.transport.flush()?;
        Ok(request)
    }

    /// `(dest, version)` if `window` speaks Xdnd, following `XdndProxy`.
    fn probe_aware(&self, window: Window) -> Result<Option<(Window, u32)>> {
        let a = self.atoms;
        let dest = self
            .read_u32s(window, a.XdndProxy)?
            .first()
            .copied()
            .filter(|&w| w != x11rb::NONE)
            .unwrap_or(window);
        let version = self.read_u32s(dest, a.XdndAware)?.first().copied();
        Ok(version
            .filter(|&v| v >= XDND_MIN_VERSION)
            .map(|v| (dest, v)))
    }

    fn enter_target(&mut self, window: Window) -> Result<()> {
        let Some((dest, version)) = self.probe_aware(window)? else {
            tracing::trace!(window, "window is not Xdnd aware");
            return Ok(());
        };
        let version = version.min(self.config.xdnd_version());
        let our = self.our_window();
        let enter = self.atoms.XdndEnter;
        let Some(drag) = self.drag.as_mut() else {
            return Ok(());
        };

        let mut data = [our, version << 24, 0, 0, 0];
        if drag.type_atoms.len() > 3 {
            data[1] |= ENTER_TYPE_LIST;
        }
        for (slot, atom) in data[2..].iter_mut().zip(&drag.type_atoms) {
            *slot = *atom;
        }
        self.transport.send_client_message(dest, window, enter, data)?;
        tracing::debug!(window, dest, version, "drag entered window");
        drag.target = Some(DragTarget {
            window,
            dest,
            version,
            awaiting_status: false,
            queued: None,
            accepted: false,
            action: DropAction::None,
            dropped: false,
        });
        Ok(())
    }

    fn leave_target(&mut self) -> Result<()> {
        let our = self.our_window();
        let leave = self.atoms.XdndLeave;
        let Some(target) = self.drag.as_mut().and_then(|d| d.target.take()) else {
            return Ok(());
        };
        tracing::debug!(window = target.window, "drag left window");
        self.transport
            .send_client_message(target.dest, target.window, leave, [our, 0, 0, 0, 0])
    }

    /// Send a position, or hold it until the outstanding status arrives.
    fn send_position(&mut self, position: Position, time: Timestamp) -> Result<()> {
        let our = self.our_window();
        let a = self.atoms;
        let Some(target) = self.drag.as_mut().and_then(|d| d.target.as_mut()) else {
            return Ok(());
        };
        if target.awaiting_status {
            target.queued = Some((position, time));
            return Ok(());
        }
        target.awaiting_status = true;
        let data = [our, 0, pack_position(position), time, a.XdndActionCopy];
        self.transport
            .send_client_message(target.dest, target.window, a.XdndPosition, data)
    }

    pub(super) fn xdnd_status(&mut self, data: [u32; 5]) -> Result<()> {
        let a = self.atoms;
        let Some(drag) = self.drag.as_mut() else {
            return Ok(());
        };
        let Some(target) = drag.target.as_mut().filter(|t| t.window == data[0]) else {
            tracing::debug!(window = data[0], "status from a window we are not over");
            return Ok(());
        };
        target.awaiting_status = false;
        target.accepted = data[1] & STATUS_ACCEPT != 0;
        target.action = match (target.accepted, a.action_from_atom(data[4])) {
            (false, _) => DropAction::None,
            // Pre-v2 targets and some lazy ones leave the action empty.
            (true, DropAction::None) => DropAction::Copy,
            (true, action) => action,
        };
        let queued = target.queued.take();
        let released = drag.release_time.is_some();

        if let Some((position, time)) = queued {
            return self.send_position(position, time);
        }
        if released {
            return self.try_release();
        }
        Ok(())
    }

    /// Drop if the target accepted, leave if it did not, wait if a
    /// status is still outstanding.
    fn try_release(&mut self) -> Result<()> {
        let our = self.our_window();
        let a = self.atoms;
        let Some(drag) = self.drag.as_mut() else {
            return Ok(());
        };
        let Some(time) = drag.release_time else {
            return Ok(());
        };
        let step = match drag.target.as_mut() {
            None => ReleaseStep::Cancel,
            Some(t) if t.dropped || t.awaiting_status => ReleaseStep::Wait,
            Some(t) if t.accepted => {
                t.dropped = true;
                ReleaseStep::Drop {
                    dest: t.dest,
                    window: t.window,
                }
            }
            Some(_) => ReleaseStep::Reject,
        };
        match step {
            ReleaseStep::Wait => Ok(()),
            ReleaseStep::Drop { dest, window } => {
                tracing::debug!(window, "sending XdndDrop");
                self.transport
                    .send_client_message(dest, window, a.XdndDrop, [our, 0, time, 0, 0])
            }
            ReleaseStep::Reject => {
                self.leave_target()?;
                self.end_drag(DropOutcome::Cancelled)
            }
            ReleaseStep::Cancel => self.end_drag(DropOutcome::Cancelled),
        }
    }

    pub(super) fn xdnd_finished(&mut self, data: [u32; 5]) -> Result<()> {
        let a = self.atoms;
        let Some(target) = self
            .drag
            .as_ref()
            .and_then(|d| d.target.as_ref())
            .filter(|t| t.window == data[0] && t.dropped)
        else {
            tracing::debug!(window = data[0], "unexpected XdndFinished");
            return Ok(());
        };
        let outcome = if target.version < 5 {
            DropOutcome::Completed(target.action)
        } else if data[1] & FINISHED_SUCCESS == 0 {
            DropOutcome::Cancelled
        } else {
            match a.action_from_atom(data[2]) {
                DropAction::None => DropOutcome::Completed(target.action),
                action => DropOutcome::Completed(action),
            }
        };
        self.end_drag(outcome)
    }

    /// Leave the current target (if not yet dropped on) and resolve the
    /// outcome as cancelled.
    pub(super) fn cancel_drag(&mut self) -> Result<()> {
        let dropped = self
            .drag
            .as_ref()
            .and_then(|d| d.target.as_ref())
            .is_some_and(|t| t.dropped);
        if !dropped {
            self.leave_target()?;
        }
        self.end_drag(DropOutcome::Cancelled)
    }

    fn end_drag(&mut self, outcome: DropOutcome) -> Result<()> {
        let Some(drag) = self.drag.take() else {
            return Ok(());
        };
        tracing::debug!(?outcome, "drag ended");
        let a = self.atoms;
        let many_types = drag.type_atoms.len() > 3;
        if let Some(completer) = drag.completer {
            self.outbox.complete(completer, outcome);
        }
        self.owned.remove(&a.XdndSelection);
        self.transport
            .clear_selection_owner(a.XdndSelection, x11rb::CURRENT_TIME)?;
        if many_types {
            self.transport
                .delete_property(self.our_window(), a.XdndTypeList)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::super::fixture::{Fixture, Recorder, deliver};
    use super::super::transport::testing::{OUR_WINDOW, Sent};
    use super::super::transport::{X11Event, X11Transport};
    use super::*;
    use crate::exchange::MemorySource;
    use crate::format::{DataFormat, ExchangeData, encode_uri_list};
    use crate::request::RequestState;

    const PEER: Window = 0x300;

    fn client(fx: &Fixture, type_: &str, data: [u32; 5]) -> X11Event {
        X11Event::ClientMessage {
            window: OUR_WINDOW,
            type_: fx.atom(type_),
            data,
        }
    }

    fn enter(fx: &Fixture, types: &[&str]) -> X11Event {
        let mut data = [PEER, 5 << 24, 0, 0, 0];
        for (slot, name) in data[2..].iter_mut().zip(types) {
            *slot = fx.atom(name);
        }
        client(fx, "XdndEnter", data)
    }

    fn position(fx: &Fixture, x: i32, y: i32) -> X11Event {
        let packed = pack_position(Position::new(x, y));
        client(fx, "XdndPosition", [PEER, 0, packed, 10, fx.atom("XdndActionCopy")])
    }

    fn sent_names(fx: &Fixture) -> Vec<String> {
        let names = fx
            .transport
            .client_messages()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        fx.transport.take_sent();
        names
    }

    #[test]
    fn position_packing_keeps_sign() {
        let p = Position::new(-5, 1200);
        assert_eq!(unpack_position(pack_position(p)), p);
    }

    // -- Target --

    #[test]
    fn target_answers_every_position_in_order() {
        let fx = Fixture::new();
        let recorder = Recorder::accepting(DropAction::Copy);
        fx.backend.set_listener(Box::new(recorder.clone()));

        deliver(&fx, enter(&fx, &["text/uri-list"]));
        assert!(recorder.kinds().is_empty());
        deliver(&fx, position(&fx, 10, 20));
        deliver(&fx, position(&fx, 11, 21));

        assert_eq!(recorder.kinds(), vec!["enter", "move"]);
        let statuses = fx.transport.client_messages();
        assert_eq!(statuses.len(), 2);
        let (name, data) = &statuses[0];
        assert_eq!(name, "XdndStatus");
        assert_eq!(data[0], OUR_WINDOW);
        assert_eq!(data[1] & STATUS_ACCEPT, STATUS_ACCEPT);
        assert_eq!(data[4], fx.atom("XdndActionCopy"));
        assert_eq!(recorder.positions(), vec![Position::new(10, 20), Position::new(11, 21)]);
    }

    #[test]
    fn rejecting_listener_sends_negative_status() {
        let fx = Fixture::new();
        deliver(&fx, enter(&fx, &["text/plain"]));
        deliver(&fx, position(&fx, 1, 1));
        let (name, data) = fx.transport.client_messages().remove(0);
        assert_eq!(name, "XdndStatus");
        assert_eq!(data[1] & STATUS_ACCEPT, 0);
        assert_eq!(data[4], x11rb::NONE);
    }

    #[test]
    fn drop_hands_over_owned_offer_and_finishes_after_reads() {
        let fx = Fixture::new();
        let recorder = Recorder::accepting(DropAction::Copy);
        fx.backend.set_listener(Box::new(recorder.clone()));

        deliver(&fx, enter(&fx, &["text/uri-list", "text/plain"]));
        deliver(&fx, position(&fx, 5, 5));
        fx.transport.take_sent();
        deliver(&fx, client(&fx, "XdndDrop", [PEER, 0, 77, 0, 0]));

        // Nothing is converted until the listener asks.
        assert!(fx.transport.take_sent().is_empty());
        let offer = recorder.take_dropped().unwrap();
        assert!(offer.is_valid());
        assert_eq!(
            offer.formats().try_take(),
            Ok(Some(vec![DataFormat::uri_list(), DataFormat::text()]))
        );

        let request = offer.data(&DataFormat::uri_list());
        let sent = fx.transport.take_sent();
        assert_eq!(
            sent,
            vec![Sent::Convert {
                selection: fx.atom("XdndSelection"),
                target: fx.atom("text/uri-list"),
                property: fx.atom("XdndSelection"),
                time: 77,
            }]
        );

        let selection = fx.atom("XdndSelection");
        fx.transport.set_property(
            OUR_WINDOW,
            selection,
            fx.atom("text/uri-list"),
            8,
            encode_uri_list(&["file:///tmp/a"]).into_bytes(),
        );
        deliver(
            &fx,
            X11Event::SelectionNotify {
                time: 77,
                requestor: OUR_WINDOW,
                selection,
                target: fx.atom("text/uri-list"),
                property: selection,
            },
        );
        assert_eq!(
            request.try_take(),
            Ok(Some(ExchangeData::UriList(vec!["file:///tmp/a".into()])))
        );
        // Still held by the application: not finished yet.
        assert!(fx.transport.client_messages().is_empty());

        drop(offer);
        let finished = fx.transport.client_messages();
        assert_eq!(finished.len(), 1);
        let (name, data) = &finished[0];
        assert_eq!(name, "XdndFinished");
        assert_eq!(data[1] & FINISHED_SUCCESS, FINISHED_SUCCESS);
        assert_eq!(data[2], fx.atom("XdndActionCopy"));
    }

    #[test]
    fn releasing_drop_offer_fails_pending_reads() {
        let fx = Fixture::new();
        let recorder = Recorder::accepting(DropAction::Copy);
        fx.backend.set_listener(Box::new(recorder.clone()));

        deliver(&fx, enter(&fx, &["text/uri-list", "text/plain"]));
        deliver(&fx, position(&fx, 5, 5));
        deliver(&fx, client(&fx, "XdndDrop", [PEER, 0, 77, 0, 0]));
        let offer = recorder.take_dropped().unwrap();

        // One conversion in flight, one queued behind it.
        let uris = offer.data(&DataFormat::uri_list());
        let text = offer.data(&DataFormat::text());
        assert_eq!(uris.state(), RequestState::Pending);
        assert_eq!(text.state(), RequestState::Pending);
        fx.transport.take_sent();

        drop(offer);
        assert_eq!(uris.try_take(), Ok(Some(ExchangeData::Empty)));
        assert_eq!(text.try_take(), Ok(Some(ExchangeData::Empty)));
        let finished = fx.transport.client_messages();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].0, "XdndFinished");
        fx.transport.take_sent();

        // The source answering late changes nothing.
        let selection = fx.atom("XdndSelection");
        fx.transport.set_property(
            OUR_WINDOW,
            selection,
            fx.atom("text/uri-list"),
            8,
            b"file:///tmp/a\r\n".to_vec(),
        );
        deliver(
            &fx,
            X11Event::SelectionNotify {
                time: 77,
                requestor: OUR_WINDOW,
                selection,
                target: fx.atom("text/uri-list"),
                property: selection,
            },
        );
        assert!(fx.transport.take_sent().is_empty());
    }

    #[test]
    fn leave_withdraws_offer() {
        let fx = Fixture::new();
        let recorder = Recorder::accepting(DropAction::Copy);
        fx.backend.set_listener(Box::new(recorder.clone()));
        deliver(&fx, enter(&fx, &["text/plain"]));
        deliver(&fx, position(&fx, 0, 0));
        let offer = recorder.last_offer().unwrap();
        assert!(offer.is_valid());

        deliver(&fx, client(&fx, "XdndLeave", [PEER, 0, 0, 0, 0]));
        assert_eq!(recorder.kinds(), vec!["enter", "leave"]);
        assert!(!offer.is_valid());
        assert_eq!(
            offer.data(&DataFormat::text()).try_take(),
            Ok(Some(ExchangeData::Empty))
        );
    }

    #[test]
    fn type_list_overflow_is_read_from_property() {
        let fx = Fixture::new();
        let recorder = Recorder::accepting(DropAction::Copy);
        fx.backend.set_listener(Box::new(recorder.clone()));
        let types = ["a/1", "b/2", "c/3", "text/uri-list"].map(|n| fx.atom(n));
        fx.transport.set_property(
            PEER,
            fx.atom("XdndTypeList"),
            fx.atom("ATOM"),
            32,
            pack32(&types),
        );
        deliver(&fx, client(&fx, "XdndEnter", [PEER, (5 << 24) | ENTER_TYPE_LIST, 0, 0, 0]));
        deliver(&fx, position(&fx, 0, 0));
        let offer = recorder.last_offer().unwrap();
        let formats = offer.formats().try_take().unwrap().unwrap();
        assert_eq!(formats.len(), 4);
        assert!(formats.contains(&DataFormat::uri_list()));
    }

    #[test]
    fn new_enter_supersedes_unfinished_session() {
        let fx = Fixture::new();
        let recorder = Recorder::accepting(DropAction::Copy);
        fx.backend.set_listener(Box::new(recorder.clone()));
        deliver(&fx, enter(&fx, &["text/plain"]));
        deliver(&fx, position(&fx, 0, 0));
        deliver(&fx, client(&fx, "XdndDrop", [PEER, 0, 5, 0, 0]));
        let first = recorder.take_dropped().unwrap();
        let pending = first.data(&DataFormat::text());
        fx.transport.take_sent();

        deliver(&fx, enter(&fx, &["text/plain"]));
        assert_eq!(pending.try_take(), Ok(Some(ExchangeData::Empty)));
        assert!(!first.is_valid());
        // The abandoned source is told the drop failed.
        let finished = fx.transport.client_messages();
        assert_eq!(finished[0].0, "XdndFinished");
        assert_eq!(finished[0].1[1] & FINISHED_SUCCESS, 0);
    }

    #[test]
    fn old_protocol_versions_are_ignored() {
        let fx = Fixture::new();
        deliver(&fx, client(&fx, "XdndEnter", [PEER, 2 << 24, 0, 0, 0]));
        assert!(fx.manager.borrow().drop_session.is_none());
    }

    // -- Source --

    fn aware_peer(fx: &Fixture) {
        fx.transport
            .set_property(PEER, fx.atom("XdndAware"), fx.atom("ATOM"), 32, pack32(&[5]));
    }

    fn status(fx: &Fixture, accept: bool) -> X11Event {
        let action = if accept { fx.atom("XdndActionCopy") } else { 0 };
        client(fx, "XdndStatus", [PEER, u32::from(accept), 0, 0, action])
    }

    #[test]
    fn source_coalesces_positions_and_defers_drop() {
        let fx = Fixture::new();
        aware_peer(&fx);
        assert!(fx.backend.start_drag(Rc::new(MemorySource::text("drag me"))));
        fx.transport.take_sent();

        fx.backend.drag_motion(Some(PEER), Position::new(1, 1), 1);
        fx.backend.drag_motion(Some(PEER), Position::new(2, 2), 2);
        fx.backend.drag_motion(Some(PEER), Position::new(3, 3), 3);
        assert_eq!(sent_names(&fx), vec!["XdndEnter", "XdndPosition"]);

        deliver(&fx, status(&fx, true));
        let positions = fx.transport.client_messages();
        assert_eq!(positions.len(), 1);
        assert_eq!(unpack_position(positions[0].1[2]), Position::new(3, 3));
        fx.transport.take_sent();

        // Released while a status is outstanding: the drop waits for it.
        let outcome = fx.backend.drag_release(4);
        assert!(fx.transport.client_messages().is_empty());
        deliver(&fx, status(&fx, true));
        assert_eq!(sent_names(&fx), vec!["XdndDrop"]);
        assert_eq!(outcome.state(), RequestState::Pending);

        deliver(
            &fx,
            client(&fx, "XdndFinished", [PEER, 1, fx.atom("XdndActionCopy"), 0, 0]),
        );
        assert_eq!(
            outcome.try_take(),
            Ok(Some(DropOutcome::Completed(DropAction::Copy)))
        );
        assert!(!fx.manager.borrow().owned.contains_key(&fx.atom("XdndSelection")));
    }

    #[test]
    fn rejected_release_sends_leave_and_cancels() {
        let fx = Fixture::new();
        aware_peer(&fx);
        fx.backend.start_drag(Rc::new(MemorySource::text("x")));
        fx.backend.drag_motion(Some(PEER), Position::new(1, 1), 1);
        deliver(&fx, status(&fx, false));
        fx.transport.take_sent();

        let outcome = fx.backend.drag_release(2);
        assert_eq!(sent_names(&fx), vec!["XdndLeave"]);
        assert_eq!(outcome.try_take(), Ok(Some(DropOutcome::Cancelled)));
    }

    #[test]
    fn unaware_windows_get_no_messages() {
        let fx = Fixture::new();
        fx.backend.start_drag(Rc::new(MemorySource::text("x")));
        fx.transport.take_sent();
        fx.backend.drag_motion(Some(PEER), Position::new(1, 1), 1);
        assert!(fx.transport.client_messages().is_empty());
        let outcome = fx.backend.drag_release(2);
        assert_eq!(outcome.try_take(), Ok(Some(DropOutcome::Cancelled)));
    }

    #[test]
    fn proxy_receives_messages_for_its_window() {
        let fx = Fixture::new();
        const PROXY: Window = 0x400;
        fx.transport
            .set_property(PEER, fx.atom("XdndProxy"), fx.atom("WINDOW"), 32, pack32(&[PROXY]));
        fx.transport
            .set_property(PROXY, fx.atom("XdndAware"), fx.atom("ATOM"), 32, pack32(&[4]));
        fx.backend.start_drag(Rc::new(MemorySource::text("x")));
        fx.transport.take_sent();
        fx.backend.drag_motion(Some(PEER), Position::new(1, 1), 1);
        let destinations: Vec<Window> = fx
            .transport
            .take_sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Client { destination, data, .. } => {
                    assert_eq!(data[0], OUR_WINDOW);
                    Some(destination)
                }
                _ => None,
            })
            .collect();
        assert_eq!(destinations, vec![PROXY, PROXY]);
    }

    #[test]
    fn many_types_go_through_type_list() {
        let fx = Fixture::new();
        aware_peer(&fx);
        // Text alone has five raw names.
        fx.backend.start_drag(Rc::new(MemorySource::text("x")));
        let list = fx
            .transport
            .property(OUR_WINDOW, fx.atom("XdndTypeList"))
            .unwrap();
        assert_eq!(list.atoms().len(), 5);
        fx.transport.take_sent();
        fx.backend.drag_motion(Some(PEER), Position::new(0, 0), 0);
        let (name, data) = fx.transport.client_messages().remove(0);
        assert_eq!(name, "XdndEnter");
        assert_eq!(data[1] >> 24, 5);
        assert_eq!(data[1] & ENTER_TYPE_LIST, ENTER_TYPE_LIST);
    }

    #[test]
    fn new_drag_cancels_previous_outcome() {
        let fx = Fixture::new();
        aware_peer(&fx);
        fx.backend.start_drag(Rc::new(MemorySource::text("one")));
        fx.backend.drag_motion(Some(PEER), Position::new(0, 0), 0);
        let first = fx.backend.drag_release(1);
        assert_eq!(first.state(), RequestState::Pending);

        fx.backend.start_drag(Rc::new(MemorySource::text("two")));
        assert_eq!(first.try_take(), Ok(Some(DropOutcome::Cancelled)));
    }

    // -- Both ends in one process --

    /// Deliver everything we sent to our own window back to ourselves,
    /// the way the server would, and record the Xdnd message names.
    fn loopback(fx: &Fixture, log: &RefCell<Vec<String>>) {
        loop {
            let sent = fx.transport.take_sent();
            if sent.is_empty() {
                return;
            }
            for item in sent {
                match item {
                    Sent::Client {
                        destination: OUR_WINDOW,
                        type_,
                        data,
                    } => {
                        log.borrow_mut()
                            .push(fx.transport.atom_name(type_).unwrap());
                        deliver(
                            fx,
                            X11Event::ClientMessage {
                                window: OUR_WINDOW,
                                type_,
                                data,
                            },
                        );
                    }
                    Sent::Convert {
                        selection,
                        target,
                        property,
                        time,
                    } => {
                        log.borrow_mut().push("convert".into());
                        deliver(
                            fx,
                            X11Event::SelectionRequest {
                                time,
                                owner: OUR_WINDOW,
                                requestor: OUR_WINDOW,
                                selection,
                                target,
                                property,
                            },
                        );
                    }
                    Sent::Notify {
                        requestor,
                        selection,
                        target,
                        property,
                    } => deliver(
                        fx,
                        X11Event::SelectionNotify {
                            time: 0,
                            requestor,
                            selection,
                            target,
                            property,
                        },
                    ),
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn drag_onto_ourselves_follows_xdnd_order() {
        let fx = Fixture::new();
        let recorder = Recorder::accepting(DropAction::Copy);
        fx.backend.set_listener(Box::new(recorder.clone()));
        let log = RefCell::new(Vec::new());

        fx.backend.start_drag(Rc::new(MemorySource::text("round trip")));
        fx.backend.drag_motion(Some(OUR_WINDOW), Position::new(1, 1), 1);
        loopback(&fx, &log);
        fx.backend.drag_motion(Some(OUR_WINDOW), Position::new(2, 2), 2);
        loopback(&fx, &log);
        let outcome = fx.backend.drag_release(3);
        loopback(&fx, &log);

        // The target fetches only after the drop.
        let offer = recorder.take_dropped().unwrap();
        let data = offer.data(&DataFormat::text());
        drop(offer);
        loopback(&fx, &log);

        assert_eq!(
            *log.borrow(),
            vec![
                "XdndEnter",
                "XdndPosition",
                "XdndStatus",
                "XdndPosition",
                "XdndStatus",
                "XdndDrop",
                "convert",
                "XdndFinished",
            ]
        );
        assert_eq!(
            data.try_take(),
            Ok(Some(ExchangeData::Text("round trip".into())))
        );
        assert_eq!(
            outcome.try_take(),
            Ok(Some(DropOutcome::Completed(DropAction::Copy)))
        );
    }
}
