//! `X11DataManager`: selection ownership, conversions and both Xdnd
//! state machines behind one event dispatch table.
//!
//! The manager never calls out while it is borrowed. Completions and
//! listener notices are queued in its [`Outbox`] and delivered by the
//! driver ([`X11Backend`](super::X11Backend)) afterwards.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use x11rb::protocol::xproto::{Atom, Window};

use super::atoms::{AtomNames, Atoms};
use super::offer::{OfferKey, X11Offer};
use super::selection::{Conversion, IncrSend, OwnedSelection, SelectionReader, Want};
use super::transport::{X11Event, X11Transport};
use super::xdnd::{DragSession, DropSession};
use crate::config::ExchangeConfig;
use crate::error::Result;
use crate::exchange::{DataOffer, DataSource, DndEvent, FormatCache, LocalOffer, SourceSlot};
use crate::format::{DataFormat, ExchangeData};
use crate::request::{AsyncRequest, Outbox};

/// A listener notice plus where its reply goes.
pub struct X11Notice {
    pub event: DndEvent,
    pub reply: ReplyTo,
}

/// Which state machine consumes the listener's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTo {
    Nothing,
    /// Answer with `XdndStatus` for this drop session.
    Position(u64),
    /// Record the performed action for this drop session.
    Drop(u64),
}

/// Consumer-side state of a clipboard/primary offer.
#[derive(Debug)]
pub(super) struct SelectionOfferState {
    pub(super) selection: Atom,
    /// Owner window when the offer was made.
    pub(super) owner: Window,
    /// Set once that owner lost the selection.
    pub(super) stale: bool,
    /// Known once a `TARGETS` conversion has answered.
    pub(super) targets: Option<FormatCache>,
}

pub struct X11DataManager {
    pub(super) transport: Rc<dyn X11Transport>,
    pub(super) atoms: Atoms,
    pub(super) names: AtomNames,
    pub(super) config: ExchangeConfig,
    pub(super) owned: HashMap<Atom, OwnedSelection>,
    pub(super) incr_sends: Vec<IncrSend>,
    pub(super) readers: HashMap<Atom, SelectionReader>,
    pub(super) offers: HashMap<u64, SelectionOfferState>,
    pub(super) drop_session: Option<DropSession>,
    pub(super) drag: Option<DragSession>,
    pub(super) outbox: Outbox<X11Notice>,
    next_id: u64,
    this: Weak<RefCell<X11DataManager>>,
}

impl X11DataManager {
    /// Intern the atom set and build a manager shared by its offers.
    pub fn new(
        transport: Rc<dyn X11Transport>,
        config: ExchangeConfig,
    ) -> Result<Rc<RefCell<Self>>> {
        let atoms = Atoms::intern(&*transport)?;
        Ok(Rc::new_cyclic(|this| {
            RefCell::new(Self {
                transport,
                atoms,
                names: AtomNames::default(),
                config,
                owned: HashMap::new(),
                incr_sends: Vec::new(),
                readers: HashMap::new(),
                offers: HashMap::new(),
                drop_session: None,
                drag: None,
                outbox: Outbox::default(),
                next_id: 1,
                this: this.clone(),
            })
        }))
    }

    pub(super) fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(super) fn offer_handle(&self, key: OfferKey, owned: bool) -> X11Offer {
        X11Offer::new(self.this.clone(), key, owned)
    }

    pub(super) fn our_window(&self) -> Window {
        self.transport.window()
    }

    // -- Dispatch --

    /// Feed one event through the transition table.
    pub fn process_event(&mut self, event: X11Event) -> Result<()> {
        tracing::trace!(?event, "x11 event");
        match event {
            X11Event::SelectionRequest {
                time,
                requestor,
                selection,
                target,
                property,
                ..
            } => self.serve_request(requestor, selection, target, property, time)?,
            X11Event::SelectionNotify {
                selection,
                target,
                property,
                ..
            } => self.conversion_notified(selection, target, property)?,
            X11Event::SelectionClear { selection, .. } => self.selection_cleared(selection)?,
            X11Event::PropertyNotify {
                window,
                atom,
                deleted: true,
                ..
            } => self.incr_send_next(window, atom)?,
            X11Event::PropertyNotify {
                window,
                atom,
                deleted: false,
                ..
            } if window == self.our_window() => self.incr_chunk_arrived(atom)?,
            X11Event::PropertyNotify { .. } => {}
            X11Event::ClientMessage {
                window,
                type_,
                data,
            } => self.client_message(window, type_, data)?,
        }
        self.transport.flush()
    }

    fn client_message(&mut self, window: Window, type_: Atom, data: [u32; 5]) -> Result<()> {
        let a = self.atoms;
        if type_ == a.XdndEnter {
            self.xdnd_enter(window, data)
        } else if type_ == a.XdndPosition {
            self.xdnd_position(data)
        } else if type_ == a.XdndLeave {
            self.xdnd_leave(data)
        } else if type_ == a.XdndDrop {
            self.xdnd_drop(data)
        } else if type_ == a.XdndStatus {
            self.xdnd_status(data)
        } else if type_ == a.XdndFinished {
            self.xdnd_finished(data)
        } else {
            tracing::trace!(type_, "ignoring client message");
            Ok(())
        }
    }

    // -- Inward entry points --

    /// Claim `selection` for `source`, or give it up with `None`.
    ///
    /// Returns whether the server made us the owner.
    pub fn set_selection(
        &mut self,
        selection: Atom,
        source: Option<Rc<dyn DataSource>>,
    ) -> Result<bool> {
        let Some(source) = source else {
            if self.owned.remove(&selection).is_some() {
                self.transport
                    .clear_selection_owner(selection, x11rb::CURRENT_TIME)?;
                self.transport.flush()?;
            }
            return Ok(true);
        };

        self.transport
            .set_selection_owner(selection, x11rb::CURRENT_TIME)?;
        self.transport.flush()?;
        let owner = self.transport.selection_owner(selection)?;
        if owner != self.our_window() {
            tracing::warn!(selection, owner, "selection ownership was not granted");
            self.owned.remove(&selection);
            return Ok(false);
        }

        let slot = SourceSlot::new(source);
        tracing::debug!(selection, formats = slot.formats().len(), "selection claimed");
        self.owned.insert(
            selection,
            OwnedSelection {
                slot,
                time: x11rb::CURRENT_TIME,
            },
        );
        Ok(true)
    }

    /// An offer over whatever currently owns `selection`, if anything.
    pub fn selection_offer(&mut self, selection: Atom) -> Result<Option<Rc<dyn DataOffer>>> {
        if let Some(owned) = self.owned.get(&selection) {
            return Ok(Some(Rc::new(LocalOffer::new(owned.slot.source().clone()))));
        }
        let owner = self.transport.selection_owner(selection)?;
        if owner == x11rb::NONE {
            return Ok(None);
        }
        let id = self.next_id();
        self.offers.insert(
            id,
            SelectionOfferState {
                selection,
                owner,
                stale: false,
                targets: None,
            },
        );
        Ok(Some(Rc::new(self.offer_handle(OfferKey::Selection(id), false))))
    }

    // -- Offer operations --

    /// Whether the window that owned the selection when offer `id` was
    /// made still owns it.
    fn selection_offer_current(&self, id: u64) -> Result<bool> {
        let Some(state) = self.offers.get(&id).filter(|s| !s.stale) else {
            return Ok(false);
        };
        Ok(self.transport.selection_owner(state.selection)? == state.owner)
    }

    /// Re-check the owner behind offer `id`. Once it has changed the offer
    /// stays stale and its queued and in-flight conversions fail.
    fn check_selection_offer(&mut self, id: u64) -> Result<bool> {
        if self.selection_offer_current(id)? {
            return Ok(true);
        }
        let newly_stale = match self.offers.get_mut(&id) {
            Some(state) if !state.stale => {
                tracing::debug!(
                    selection = state.selection,
                    owner = state.owner,
                    "selection owner changed"
                );
                state.stale = true;
                true
            }
            _ => false,
        };
        if newly_stale {
            for conversion in self.take_conversions(OfferKey::Selection(id)) {
                conversion.fail(&mut self.outbox);
            }
        }
        Ok(false)
    }

    pub(super) fn offer_formats(&mut self, key: OfferKey) -> Result<AsyncRequest<Vec<DataFormat>>> {
        match key {
            OfferKey::Selection(id) => {
                if !self.check_selection_offer(id)? {
                    return Ok(AsyncRequest::failed());
                }
                let Some(state) = self.offers.get(&id) else {
                    return Ok(AsyncRequest::failed());
                };
                if let Some(targets) = &state.targets {
                    return Ok(AsyncRequest::ready(targets.formats()));
                }
                let selection = state.selection;
                let (request, completer) = AsyncRequest::new();
                self.enqueue(
                    selection,
                    Conversion {
                        key,
                        want: Want::Targets(Some(completer)),
                        time: x11rb::CURRENT_TIME,
                    },
                )?;
                Ok(request)
            }
            OfferKey::Drop(id) => Ok(match self.live_drop(id) {
                Some(session) => AsyncRequest::ready(session.formats.formats()),
                None => AsyncRequest::failed(),
            }),
        }
    }

    pub(super) fn offer_data(
        &mut self,
        key: OfferKey,
        format: &DataFormat,
    ) -> Result<AsyncRequest<ExchangeData>> {
        if !format.is_valid() {
            return Ok(AsyncRequest::failed());
        }
        match key {
            OfferKey::Selection(id) => {
                if !self.check_selection_offer(id)? {
                    return Ok(AsyncRequest::failed());
                }
                let Some(state) = self.offers.get(&id) else {
                    return Ok(AsyncRequest::failed());
                };
                let selection = state.selection;
                let offered = state.targets.as_ref().map(|t| t.offers(format));
                match offered {
                    Some(false) => {
                        tracing::debug!(format = %format, "format not offered by selection owner");
                        return Ok(AsyncRequest::failed());
                    }
                    Some(true) => {}
                    None => {
                        if !self.targets_queued(selection, key) {
                            self.enqueue(
                                selection,
                                Conversion {
                                    key,
                                    want: Want::Targets(None),
                                    time: x11rb::CURRENT_TIME,
                                },
                            )?;
                        }
                    }
                }
                let (request, completer) = AsyncRequest::new();
                self.enqueue(
                    selection,
                    Conversion {
                        key,
                        want: Want::Data(format.clone(), Some(completer)),
                        time: x11rb::CURRENT_TIME,
                    },
                )?;
                Ok(request)
            }
            OfferKey::Drop(id) => {
                let selection = self.atoms.XdndSelection;
                let Some(session) = self.live_drop_mut(id) else {
                    return Ok(AsyncRequest::failed());
                };
                if !session.formats.offers(format) {
                    tracing::debug!(format = %format, "format not offered by drag source");
                    return Ok(AsyncRequest::failed());
                }
                session.outstanding += 1;
                let time = session.time;
                let (request, completer) = AsyncRequest::new();
                self.enqueue(
                    selection,
                    Conversion {
                        key,
                        want: Want::Data(format.clone(), Some(completer)),
                        time,
                    },
                )?;
                Ok(request)
            }
        }
    }

    pub(super) fn offer_is_valid(&self, key: OfferKey) -> bool {
        match key {
            OfferKey::Selection(id) => self.selection_offer_current(id).unwrap_or(false),
            OfferKey::Drop(id) => self.live_drop(id).is_some(),
        }
    }

    /// The application let go of an offer. Returns the conversions it
    /// still had pending; the caller drops them once the manager borrow
    /// is released, which fails their requests.
    pub(super) fn release_offer(&mut self, key: OfferKey, owned: bool) -> Vec<Conversion> {
        match key {
            OfferKey::Selection(id) => {
                self.offers.remove(&id);
                self.take_conversions(key)
            }
            OfferKey::Drop(id) if owned => {
                let (abandoned, finished) = self.release_drop(id);
                if let Err(e) = finished {
                    tracing::warn!(error = %e, "finishing drop failed");
                }
                abandoned
            }
            OfferKey::Drop(_) => Vec::new(),
        }
    }

    /// Tear down every session after the connection died.
    pub fn shutdown(&mut self) {
        tracing::debug!("tearing down X11 sessions");
        for (_, reader) in self.readers.drain() {
            for conversion in reader.into_conversions() {
                conversion.fail(&mut self.outbox);
            }
        }
        self.offers.clear();
        self.drop_session = None;
        if let Some(drag) = self.drag.take() {
            drag.cancel(&mut self.outbox);
        }
        self.owned.clear();
        self.incr_sends.clear();
    }
}
