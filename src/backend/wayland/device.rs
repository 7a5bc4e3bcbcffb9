//! `WaylandDataDevice`: offers, the selection, our sources and the pipe
//! transfers behind them.
//!
//! Like the X11 manager it never calls out while borrowed; completions
//! and listener notices go through its [`Outbox`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use bytes::Bytes;

use super::dnd::{DndSession, DragState};
use super::offer::{OfferKey, WaylandOffer};
use super::pipe::{PipeReader, PipeWriter, ReadStatus, pipe};
use super::transport::{DndActions, OfferId, SourceId, WaylandEvent, WaylandTransport};
use crate::config::ExchangeConfig;
use crate::error::Result;
use crate::exchange::{DataOffer, DataSource, DndEvent, FormatCache, LocalOffer, SourceSlot};
use crate::format::{DataFormat, ExchangeData, pick_raw, wrap};
use crate::request::{AsyncRequest, Completer, Outbox};

/// A listener notice plus where its reply goes.
pub struct WaylandNotice {
    pub event: DndEvent,
    pub reply: ReplyTo,
}

/// Which state machine consumes the listener's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTo {
    Nothing,
    /// Answer with `accept` / `set_actions` for this drag session.
    Position(u64),
    /// Record the performed action for this drag session.
    Drop(u64),
}

/// What an introduced offer turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum OfferRole {
    /// Announced, not yet used by `selection` or `enter`.
    Pending,
    Selection,
    Dnd(u64),
}

#[derive(Debug)]
pub(super) struct OfferState {
    pub(super) formats: FormatCache,
    pub(super) source_actions: DndActions,
    pub(super) action: DndActions,
    pub(super) role: OfferRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SourceRole {
    Clipboard,
    Drag,
}

pub(super) struct SourceState {
    pub(super) slot: SourceSlot,
    pub(super) role: SourceRole,
}

/// A `receive` in flight.
pub(super) struct PendingRead {
    /// The offer handle that asked; releasing it fails the read.
    handle: u64,
    offer: OfferId,
    /// Drag session the read counts against.
    session: Option<u64>,
    format: DataFormat,
    reader: PipeReader,
    completer: Completer<ExchangeData>,
}

impl PendingRead {
    pub(super) fn fail(self, outbox: &mut Outbox<WaylandNotice>) {
        outbox.fail(self.completer);
    }
}

/// Which way a polled fd transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeInterest {
    Read,
    Write,
}

pub struct WaylandDataDevice {
    pub(super) transport: Rc<dyn WaylandTransport>,
    pub(super) config: ExchangeConfig,
    pub(super) offers: HashMap<OfferId, OfferState>,
    pub(super) selection: Option<OfferId>,
    pub(super) dnd: Option<DndSession>,
    pub(super) sources: HashMap<SourceId, SourceState>,
    pub(super) clipboard_source: Option<SourceId>,
    pub(super) drag: Option<DragState>,
    reads: Vec<PendingRead>,
    writes: Vec<PipeWriter>,
    pub(super) outbox: Outbox<WaylandNotice>,
    next_id: u64,
    this: Weak<RefCell<WaylandDataDevice>>,
}

impl WaylandDataDevice {
    pub fn new(transport: Rc<dyn WaylandTransport>, config: ExchangeConfig) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                transport,
                config,
                offers: HashMap::new(),
                selection: None,
                dnd: None,
                sources: HashMap::new(),
                clipboard_source: None,
                drag: None,
                reads: Vec::new(),
                writes: Vec::new(),
                outbox: Outbox::default(),
                next_id: 1,
                this: this.clone(),
            })
        })
    }

    pub(super) fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(super) fn offer_handle(&mut self, key: OfferKey, owned: bool) -> WaylandOffer {
        let handle = self.next_id();
        WaylandOffer::new(self.this.clone(), key, handle, owned)
    }

    /// Drag actions exist from version 3 on.
    pub(super) fn has_actions(&self) -> bool {
        self.transport.version() >= 3
    }

    // -- Dispatch --

    /// Feed one event through the transition table.
    pub fn process_event(&mut self, event: WaylandEvent) -> Result<()> {
        tracing::trace!(?event, "wayland data event");
        match event {
            WaylandEvent::DataOffer { offer } => self.introduce_offer(offer),
            WaylandEvent::Offer { offer, mime_type } => {
                if let Some(state) = self.offers.get_mut(&offer) {
                    state.formats.announce(mime_type);
                }
            }
            WaylandEvent::SourceActions { offer, actions } => {
                if let Some(state) = self.offers.get_mut(&offer) {
                    state.source_actions = actions;
                }
            }
            WaylandEvent::Action { offer, action } => {
                if let Some(state) = self.offers.get_mut(&offer) {
                    state.action = action;
                }
            }
            WaylandEvent::Selection { offer } => self.selection_changed(offer),
            WaylandEvent::Enter {
                serial,
                x,
                y,
                offer,
            } => self.dnd_enter(serial, x, y, offer)?,
            WaylandEvent::Motion { x, y, .. } => self.dnd_motion(x, y),
            WaylandEvent::Leave => self.dnd_leave(),
            WaylandEvent::Drop => self.dnd_drop()?,
            WaylandEvent::Send {
                source,
                mime_type,
                fd,
            } => self.source_send(source, &mime_type, fd)?,
            WaylandEvent::Cancelled { source } => self.source_cancelled(source),
            WaylandEvent::Target { source, mime_type } => self.drag_target(source, mime_type),
            WaylandEvent::SourceAction { source, action } => self.drag_action(source, action),
            WaylandEvent::DndDropPerformed { source } => self.drag_dropped(source),
            WaylandEvent::DndFinished { source } => self.drag_finished(source),
        }
        self.transport.flush()
    }

    fn introduce_offer(&mut self, offer: OfferId) {
        self.offers.insert(
            offer,
            OfferState {
                formats: FormatCache::new(),
                source_actions: DndActions::NONE,
                action: DndActions::NONE,
                role: OfferRole::Pending,
            },
        );
    }

    /// Give `offer` its role and destroy offers that were announced but
    /// never used.
    pub(super) fn assign_role(&mut self, offer: OfferId, role: OfferRole) {
        let unused: Vec<OfferId> = self
            .offers
            .iter()
            .filter(|(id, state)| **id != offer && state.role == OfferRole::Pending)
            .map(|(id, _)| *id)
            .collect();
        for id in unused {
            self.destroy_offer(id);
        }
        if let Some(state) = self.offers.get_mut(&offer) {
            state.role = role;
        }
    }

    /// Forget an offer: its reads fail and the proxy is destroyed.
    pub(super) fn destroy_offer(&mut self, offer: OfferId) {
        if self.offers.remove(&offer).is_none() {
            return;
        }
        let (failed, kept): (Vec<PendingRead>, Vec<PendingRead>) = std::mem::take(&mut self.reads)
            .into_iter()
            .partition(|read| read.offer == offer);
        self.reads = kept;
        for read in failed {
            read.fail(&mut self.outbox);
        }
        self.transport.offer_destroy(offer);
    }

    // -- Selection --

    fn selection_changed(&mut self, offer: Option<OfferId>) {
        if let Some(previous) = self.selection.take()
            && Some(previous) != offer
        {
            tracing::debug!(offer = previous.0, "selection offer replaced");
            self.destroy_offer(previous);
        }
        if let Some(offer) = offer {
            self.assign_role(offer, OfferRole::Selection);
        }
        self.selection = offer;
    }

    /// Offer over the current clipboard contents, if any.
    pub fn clipboard(&mut self) -> Option<Rc<dyn DataOffer>> {
        if let Some(id) = self.clipboard_source
            && let Some(source) = self.sources.get(&id)
        {
            return Some(Rc::new(LocalOffer::new(source.slot.source().clone())));
        }
        let offer = self.selection?;
        Some(Rc::new(self.offer_handle(OfferKey::Selection(offer), false)))
    }

    /// Set the selection to `source`, or clear it with `None`.
    pub fn set_clipboard(&mut self, source: Option<Rc<dyn DataSource>>) -> Result<bool> {
        let serial = self.transport.input_serial();
        let previous = self.clipboard_source.take();
        match source {
            Some(source) => {
                let slot = SourceSlot::new(source);
                let id = self.create_source(&slot)?;
                self.transport.set_selection(Some(id), serial)?;
                tracing::debug!(source = id.0, formats = slot.formats().len(), "selection set");
                self.sources.insert(
                    id,
                    SourceState {
                        slot,
                        role: SourceRole::Clipboard,
                    },
                );
                self.clipboard_source = Some(id);
            }
            None => {
                if previous.is_some() {
                    self.transport.set_selection(None, serial)?;
                }
            }
        }
        if let Some(previous) = previous {
            self.destroy_source(previous);
        }
        self.transport.flush()?;
        Ok(true)
    }

    // -- Sources --

    /// Create a source advertising every raw name of `slot`.
    pub(super) fn create_source(&mut self, slot: &SourceSlot) -> Result<SourceId> {
        let id = self.transport.create_source()?;
        for mime_type in slot.raw_names() {
            self.transport.source_offer(id, &mime_type)?;
        }
        Ok(id)
    }

    pub(super) fn destroy_source(&mut self, id: SourceId) {
        if self.sources.remove(&id).is_some() {
            self.transport.source_destroy(id);
        }
    }

    fn source_send(&mut self, source: SourceId, mime_type: &str, fd: OwnedFd) -> Result<()> {
        let Some(state) = self.sources.get(&source) else {
            tracing::debug!(source = source.0, "send for an unknown source");
            return Ok(());
        };
        let Some(bytes) = state.slot.bytes_for(mime_type) else {
            tracing::debug!(mime_type, "no data for requested type");
            // Closing the fd tells the reader there is nothing.
            return Ok(());
        };
        tracing::debug!(mime_type, len = bytes.len(), "serving transfer");
        let mut writer = PipeWriter::new(fd, Bytes::from(bytes))?;
        if !writer.write_available() {
            self.writes.push(writer);
        }
        Ok(())
    }

    fn source_cancelled(&mut self, source: SourceId) {
        let Some(state) = self.sources.get(&source) else {
            return;
        };
        match state.role {
            SourceRole::Clipboard => {
                tracing::debug!(source = source.0, "selection taken by another client");
                if self.clipboard_source == Some(source) {
                    self.clipboard_source = None;
                }
            }
            SourceRole::Drag => self.drag_cancelled(source),
        }
        self.destroy_source(source);
    }

    // -- Offer operations --

    /// The offer state behind a key, if it is still live.
    fn live_offer(&self, key: OfferKey) -> Option<(OfferId, &OfferState)> {
        let id = match key {
            OfferKey::Selection(id) => (self.selection == Some(id)).then_some(id)?,
            OfferKey::Drop(session) => self.live_dnd(session)?.offer?,
        };
        Some((id, self.offers.get(&id)?))
    }

    pub(super) fn offer_formats(&self, key: OfferKey) -> AsyncRequest<Vec<DataFormat>> {
        match (key, self.live_offer(key)) {
            (_, Some((_, state))) => AsyncRequest::ready(state.formats.formats()),
            // A drag without data still has an (empty) offer.
            (OfferKey::Drop(session), None) if self.live_dnd(session).is_some() => {
                AsyncRequest::ready(Vec::new())
            }
            _ => AsyncRequest::failed(),
        }
    }

    pub(super) fn offer_data(
        &mut self,
        key: OfferKey,
        handle: u64,
        format: &DataFormat,
    ) -> Result<AsyncRequest<ExchangeData>> {
        let Some((offer, state)) = self.live_offer(key) else {
            return Ok(AsyncRequest::failed());
        };
        let Some(mime_type) = pick_raw(format, state.formats.raw()).map(str::to_string) else {
            tracing::debug!(format = %format, "format not offered");
            return Ok(AsyncRequest::failed());
        };

        let (read, write) = pipe()?;
        self.transport.offer_receive(offer, &mime_type, write.as_fd())?;
        // Our copy of the write end must go or EOF never arrives.
        drop(write);
        self.transport.flush()?;

        let session = match key {
            OfferKey::Drop(session) => {
                if let Some(dnd) = self.dnd.as_mut() {
                    dnd.outstanding += 1;
                }
                Some(session)
            }
            OfferKey::Selection(_) => None,
        };
        tracing::debug!(mime_type, offer = offer.0, "receiving");
        let (request, completer) = AsyncRequest::new();
        self.reads.push(PendingRead {
            handle,
            offer,
            session,
            format: format.clone(),
            reader: PipeReader::new(read, self.config.max_transfer_bytes),
            completer,
        });
        Ok(request)
    }

    pub(super) fn offer_is_valid(&self, key: OfferKey) -> bool {
        match key {
            OfferKey::Selection(_) => self.live_offer(key).is_some(),
            OfferKey::Drop(session) => self.live_dnd(session).is_some(),
        }
    }

    /// The application let go of an offer handle. Returns the reads it
    /// still had pending; the caller drops them once the device borrow is
    /// released, which fails their requests. Releasing the owned drop
    /// offer abandons every read of that drop and finishes it.
    pub(super) fn release_offer(
        &mut self,
        key: OfferKey,
        handle: u64,
        owned: bool,
    ) -> Vec<Completer<ExchangeData>> {
        match key {
            OfferKey::Selection(_) => self.take_reads(|read| read.handle == handle),
            OfferKey::Drop(session) if owned => {
                let orphaned = self.take_reads(|read| read.session == Some(session));
                self.release_drop(session);
                orphaned
            }
            OfferKey::Drop(_) => Vec::new(),
        }
    }

    fn take_reads(&mut self, pick: impl Fn(&PendingRead) -> bool) -> Vec<Completer<ExchangeData>> {
        let (orphaned, kept): (Vec<PendingRead>, Vec<PendingRead>) =
            std::mem::take(&mut self.reads).into_iter().partition(pick);
        self.reads = kept;
        orphaned.into_iter().map(|read| read.completer).collect()
    }

    // -- Pipes --

    /// Fds the event loop should poll for pending transfers.
    pub fn poll_fds(&self) -> Vec<(RawFd, PipeInterest)> {
        self.reads
            .iter()
            .map(|read| (read.reader.raw_fd(), PipeInterest::Read))
            .chain(
                self.writes
                    .iter()
                    .map(|write| (write.raw_fd(), PipeInterest::Write)),
            )
            .collect()
    }

    pub fn has_transfers(&self) -> bool {
        !self.reads.is_empty() || !self.writes.is_empty()
    }

    /// Make progress on every transfer without blocking.
    pub fn service_pipes(&mut self) {
        let mut finished_sessions = Vec::new();
        let mut pending = Vec::with_capacity(self.reads.len());
        for mut read in std::mem::take(&mut self.reads) {
            let session = read.session;
            let status = match read.reader.read_available() {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(error = %e, "pipe read failed");
                    ReadStatus::Overflow
                }
            };
            match status {
                ReadStatus::Pending => {
                    pending.push(read);
                    continue;
                }
                ReadStatus::Eof => {
                    let PendingRead {
                        format,
                        reader,
                        completer,
                        ..
                    } = read;
                    let bytes = reader.into_bytes();
                    tracing::debug!(format = %format, len = bytes.len(), "transfer complete");
                    self.outbox.complete(completer, wrap(&bytes, &format));
                    finished_sessions.extend(session);
                }
                ReadStatus::Overflow => {
                    tracing::warn!(
                        limit = self.config.max_transfer_bytes,
                        "transfer failed or exceeded size limit"
                    );
                    read.fail(&mut self.outbox);
                    finished_sessions.extend(session);
                }
            }
        }
        self.reads = pending;
        self.writes.retain_mut(|writer| !writer.write_available());
        for session in finished_sessions {
            self.drop_request_done(session);
        }
        if let Err(e) = self.transport.flush() {
            tracing::warn!(error = %e, "flushing after transfers failed");
        }
    }

    /// Tear down every session after the connection died.
    pub fn shutdown(&mut self) {
        tracing::debug!("tearing down Wayland sessions");
        for read in std::mem::take(&mut self.reads) {
            read.fail(&mut self.outbox);
        }
        self.writes.clear();
        self.dnd = None;
        if let Some(drag) = self.drag.take() {
            drag.cancel(&mut self.outbox);
        }
        self.offers.clear();
        self.selection = None;
        self.sources.clear();
        self.clipboard_source = None;
    }
}
