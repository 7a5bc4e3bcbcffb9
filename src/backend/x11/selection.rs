//! ICCCM selections: serving conversions of what we own, and reading
//! what other clients own.
//!
//! Reads are queued per selection with one conversion in flight at a
//! time. The reply lands in a property named after the selection on our
//! window, so CLIPBOARD, PRIMARY and XdndSelection transfers never step
//! on each other.

use std::collections::VecDeque;

use x11rb::protocol::xproto::{Atom, Timestamp, Window};

use super::manager::{X11DataManager, X11Notice};
use super::offer::OfferKey;
use super::transport::{PropertyValue, pack32};
use crate::error::Result;
use crate::exchange::{FormatCache, SourceSlot};
use crate::format::{DataFormat, ExchangeData, pick_raw, wrap};
use crate::request::{Completer, Outbox};

/// A selection we own.
pub(super) struct OwnedSelection {
    pub(super) slot: SourceSlot,
    pub(super) time: Timestamp,
}

/// An outgoing INCR transfer, advanced each time the requestor deletes
/// the property.
#[derive(Debug)]
pub(super) struct IncrSend {
    requestor: Window,
    property: Atom,
    type_: Atom,
    data: Vec<u8>,
    offset: usize,
}

/// What a conversion is for.
pub(super) enum Want {
    /// The owner's `TARGETS`. No completer when queued internally ahead
    /// of a data conversion.
    Targets(Option<Completer<Vec<DataFormat>>>),
    Data(DataFormat, Option<Completer<ExchangeData>>),
}

/// One queued read.
pub(super) struct Conversion {
    pub(super) key: OfferKey,
    pub(super) want: Want,
    pub(super) time: Timestamp,
}

impl Conversion {
    fn is_targets(&self) -> bool {
        matches!(self.want, Want::Targets(_))
    }

    /// Queue the failure value for whoever is waiting.
    pub(super) fn fail(self, outbox: &mut Outbox<X11Notice>) {
        match self.want {
            Want::Targets(Some(completer)) => outbox.fail(completer),
            Want::Data(_, Some(completer)) => outbox.fail(completer),
            Want::Targets(None) | Want::Data(_, None) => {}
        }
    }

    /// Split off the consumer side. The conversion itself stays in
    /// flight so the reply is still consumed in order.
    fn detach(&mut self) -> Conversion {
        let want = match &mut self.want {
            Want::Targets(completer) => Want::Targets(completer.take()),
            Want::Data(format, completer) => Want::Data(format.clone(), completer.take()),
        };
        Conversion {
            key: self.key,
            want,
            time: self.time,
        }
    }
}

pub(super) struct InFlight {
    conversion: Conversion,
    target: Atom,
    /// Set once the owner answered with INCR; chunks accumulate here.
    incr: Option<PropertyValue>,
}

/// Conversion queue for one selection.
#[derive(Default)]
pub(super) struct SelectionReader {
    queue: VecDeque<Conversion>,
    in_flight: Option<InFlight>,
}

impl SelectionReader {
    pub(super) fn into_conversions(self) -> Vec<Conversion> {
        self.in_flight
            .map(|f| f.conversion)
            .into_iter()
            .chain(self.queue)
            .collect()
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }
}

/// Turn a non-fatal serving error into a refusal.
fn absorb(result: Result<bool>) -> Result<bool> {
    match result {
        Ok(served) => Ok(served),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::warn!(error = %e, "refusing conversion");
            Ok(false)
        }
    }
}

/// Latin-1 for a `STRING` reply; characters outside it become `?`.
fn utf8_to_latin1(bytes: &[u8]) -> Vec<u8> {
    String::from_utf8_lossy(bytes)
        .chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

fn latin1_to_utf8(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .map(|&b| char::from(b))
        .collect::<String>()
        .into_bytes()
}

impl X11DataManager {
    // -- Serving --

    pub(super) fn serve_request(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<()> {
        // Obsolete clients pass no property; ICCCM says use the target.
        let property = if property == x11rb::NONE {
            target
        } else {
            property
        };

        let served = if !self.owned.contains_key(&selection) {
            tracing::debug!(selection, "conversion request for a selection we do not own");
            false
        } else if target == self.atoms.MULTIPLE {
            absorb(self.serve_multiple(requestor, selection, property))?
        } else {
            absorb(self.serve_single(requestor, selection, target, property))?
        };

        let reply = if served { property } else { x11rb::NONE };
        self.transport
            .send_selection_notify(requestor, selection, target, reply, time)
    }

    fn serve_single(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    ) -> Result<bool> {
        let a = self.atoms;
        let Some(owned) = self.owned.get(&selection) else {
            return Ok(false);
        };

        if target == a.TARGETS {
            let names = owned.slot.raw_names();
            let mut targets = vec![a.TARGETS, a.TIMESTAMP, a.MULTIPLE];
            for name in &names {
                targets.push(self.names.atom(&*self.transport, name)?);
            }
            self.transport
                .change_property(requestor, property, a.ATOM, 32, &pack32(&targets))?;
            return Ok(true);
        }
        if target == a.TIMESTAMP {
            let time = owned.time;
            self.transport
                .change_property(requestor, property, a.INTEGER, 32, &pack32(&[time]))?;
            return Ok(true);
        }

        let name = self.names.name(&*self.transport, target)?;
        let Some(bytes) = self
            .owned
            .get(&selection)
            .and_then(|owned| owned.slot.bytes_for(&name))
        else {
            tracing::debug!(target = %name, "no data for requested target");
            return Ok(false);
        };

        // ICCCM: STRING is Latin-1; TEXT answers with a concrete type.
        let (type_, bytes) = if target == a.STRING {
            (target, utf8_to_latin1(&bytes))
        } else if target == a.TEXT {
            (a.UTF8_STRING, bytes)
        } else {
            (target, bytes)
        };
        if bytes.len() > self.config.incr_chunk_bytes {
            self.start_incr(requestor, property, type_, bytes)?;
        } else {
            self.transport
                .change_property(requestor, property, type_, 8, &bytes)?;
        }
        tracing::debug!(target = %name, requestor, "served conversion");
        Ok(true)
    }

    /// ICCCM `MULTIPLE`: the property holds (target, property) pairs;
    /// targets we cannot convert are replaced with `None`.
    fn serve_multiple(&mut self, requestor: Window, selection: Atom, property: Atom) -> Result<bool> {
        let Some(value) = self.transport.get_property(requestor, property, false)? else {
            return Ok(false);
        };
        let mut pairs = value.atoms();
        for pair in pairs.chunks_exact_mut(2) {
            let (target, prop) = (pair[0], pair[1]);
            let served = if prop == x11rb::NONE || target == self.atoms.MULTIPLE {
                false
            } else {
                absorb(self.serve_single(requestor, selection, target, prop))?
            };
            if !served {
                pair[0] = x11rb::NONE;
            }
        }
        self.transport
            .change_property(requestor, property, self.atoms.ATOM_PAIR, 32, &pack32(&pairs))?;
        Ok(true)
    }

    fn start_incr(&mut self, requestor: Window, property: Atom, type_: Atom, data: Vec<u8>) -> Result<()> {
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        self.transport.watch_properties(requestor)?;
        self.transport
            .change_property(requestor, property, self.atoms.INCR, 32, &pack32(&[len]))?;
        self.incr_sends
            .retain(|s| !(s.requestor == requestor && s.property == property));
        tracing::debug!(requestor, bytes = data.len(), "starting INCR transfer");
        self.incr_sends.push(IncrSend {
            requestor,
            property,
            type_,
            data,
            offset: 0,
        });
        Ok(())
    }

    /// The requestor consumed a property; send the next chunk. A
    /// zero-length chunk ends the transfer.
    pub(super) fn incr_send_next(&mut self, window: Window, atom: Atom) -> Result<()> {
        let Some(idx) = self
            .incr_sends
            .iter()
            .position(|s| s.requestor == window && s.property == atom)
        else {
            return Ok(());
        };
        let chunk_size = self.config.incr_chunk_bytes.max(1);
        let send = &mut self.incr_sends[idx];
        let end = (send.offset + chunk_size).min(send.data.len());
        let chunk = &send.data[send.offset..end];
        let done = chunk.is_empty();
        self.transport
            .change_property(send.requestor, send.property, send.type_, 8, chunk)?;
        send.offset = end;
        if done {
            tracing::debug!(requestor = window, "INCR transfer complete");
            self.incr_sends.remove(idx);
        }
        Ok(())
    }

    pub(super) fn selection_cleared(&mut self, selection: Atom) -> Result<()> {
        if self.owned.remove(&selection).is_some() {
            tracing::debug!(selection, "lost selection ownership");
        }
        if selection == self.atoms.XdndSelection && self.drag.is_some() {
            self.cancel_drag()?;
        }
        Ok(())
    }

    // -- Reading --

    pub(super) fn enqueue(&mut self, selection: Atom, conversion: Conversion) -> Result<()> {
        self.readers
            .entry(selection)
            .or_default()
            .queue
            .push_back(conversion);
        self.start_next(selection)
    }

    pub(super) fn targets_queued(&self, selection: Atom, key: OfferKey) -> bool {
        self.readers.get(&selection).is_some_and(|reader| {
            reader
                .in_flight
                .iter()
                .map(|f| &f.conversion)
                .chain(reader.queue.iter())
                .any(|c| c.key == key && c.is_targets())
        })
    }

    /// Issue the next queued conversion if nothing is in flight.
    fn start_next(&mut self, selection: Atom) -> Result<()> {
        loop {
            let Some(reader) = self.readers.get_mut(&selection) else {
                return Ok(());
            };
            if reader.in_flight.is_some() {
                return Ok(());
            }
            let Some(conversion) = reader.queue.pop_front() else {
                if reader.is_idle() {
                    self.readers.remove(&selection);
                }
                return Ok(());
            };

            let target = match self.conversion_target(&conversion) {
                Ok(Some(target)) => target,
                Ok(None) => {
                    tracing::debug!("format not among the owner's targets");
                    self.finish_conversion(conversion, None);
                    continue;
                }
                Err(e) => {
                    conversion.fail(&mut self.outbox);
                    return Err(e);
                }
            };
            if let Err(e) =
                self.transport
                    .convert_selection(selection, target, selection, conversion.time)
            {
                conversion.fail(&mut self.outbox);
                return Err(e);
            }
            self.readers.entry(selection).or_default().in_flight = Some(InFlight {
                conversion,
                target,
                incr: None,
            });
            return Ok(());
        }
    }

    /// The target atom to ask for, or `None` if the owner cannot supply
    /// the format.
    fn conversion_target(&mut self, conversion: &Conversion) -> Result<Option<Atom>> {
        let format = match &conversion.want {
            Want::Targets(_) => return Ok(Some(self.atoms.TARGETS)),
            Want::Data(format, _) => format,
        };
        let announced = match conversion.key {
            OfferKey::Selection(id) => self
                .offers
                .get(&id)
                .and_then(|s| s.targets.as_ref())
                .map(|t| t.raw().to_vec()),
            OfferKey::Drop(id) => self.live_drop(id).map(|s| s.formats.raw().to_vec()),
        };
        let name = match &announced {
            Some(raw) => match pick_raw(format, raw) {
                Some(name) => name.to_string(),
                None => return Ok(None),
            },
            // TARGETS was refused; ask for the format by name.
            None => format.name().to_string(),
        };
        Ok(Some(self.names.atom(&*self.transport, &name)?))
    }

    fn take_in_flight(&mut self, selection: Atom) -> Option<InFlight> {
        self.readers.get_mut(&selection)?.in_flight.take()
    }

    fn in_flight(&self, selection: Atom) -> Option<&InFlight> {
        self.readers.get(&selection)?.in_flight.as_ref()
    }

    pub(super) fn conversion_notified(
        &mut self,
        selection: Atom,
        target: Atom,
        property: Atom,
    ) -> Result<()> {
        let expected = self
            .in_flight(selection)
            .is_some_and(|f| f.target == target && f.incr.is_none());
        if !expected {
            tracing::debug!(selection, target, "unexpected SelectionNotify");
            return Ok(());
        }

        if property == x11rb::NONE {
            tracing::debug!(selection, target, "conversion refused");
            if let Some(flight) = self.take_in_flight(selection) {
                self.finish_conversion(flight.conversion, None);
            }
            return self.start_next(selection);
        }

        let value = match self.transport.get_property(self.our_window(), property, true) {
            Ok(value) => value,
            Err(e) => {
                if let Some(flight) = self.take_in_flight(selection) {
                    flight.conversion.fail(&mut self.outbox);
                }
                self.start_next(selection)?;
                return Err(e);
            }
        };

        match value {
            Some(value) if value.type_ == self.atoms.INCR => {
                tracing::debug!(selection, "receiving INCR transfer");
                // Deleting the INCR property (done by the read) starts it.
                if let Some(reader) = self.readers.get_mut(&selection)
                    && let Some(flight) = reader.in_flight.as_mut()
                {
                    flight.incr = Some(PropertyValue {
                        type_: x11rb::NONE,
                        format: 8,
                        data: Vec::new(),
                    });
                }
                Ok(())
            }
            value => {
                if let Some(flight) = self.take_in_flight(selection) {
                    self.finish_conversion(flight.conversion, value);
                }
                self.start_next(selection)
            }
        }
    }

    /// A chunk of an incoming INCR transfer was written to our window.
    pub(super) fn incr_chunk_arrived(&mut self, property: Atom) -> Result<()> {
        let receiving = self
            .in_flight(property)
            .is_some_and(|f| f.incr.is_some());
        if !receiving {
            return Ok(());
        }
        let Some(chunk) = self
            .transport
            .get_property(self.our_window(), property, true)?
        else {
            return Ok(());
        };

        let max = self.config.max_transfer_bytes;
        let Some(acc) = self
            .readers
            .get_mut(&property)
            .and_then(|r| r.in_flight.as_mut())
            .and_then(|f| f.incr.as_mut())
        else {
            return Ok(());
        };

        if !chunk.data.is_empty() {
            acc.type_ = chunk.type_;
            acc.format = chunk.format;
            acc.data.extend_from_slice(&chunk.data);
            if acc.data.len() <= max {
                return Ok(());
            }
            tracing::warn!(limit = max, "INCR transfer exceeds the size limit");
            if let Some(flight) = self.take_in_flight(property) {
                self.finish_conversion(flight.conversion, None);
            }
            return self.start_next(property);
        }

        if let Some(flight) = self.take_in_flight(property) {
            tracing::debug!(bytes = flight.incr.as_ref().map_or(0, |v| v.data.len()), "INCR transfer received");
            self.finish_conversion(flight.conversion, flight.incr);
        }
        self.start_next(property)
    }

    /// Resolve a conversion with what the owner sent (`None` on refusal).
    fn finish_conversion(&mut self, conversion: Conversion, value: Option<PropertyValue>) {
        let Conversion { key, want, .. } = conversion;
        match want {
            Want::Targets(completer) => {
                let cache = value.map(|v| {
                    let atoms: Vec<Atom> = v
                        .atoms()
                        .into_iter()
                        .filter(|&a| !self.atoms.is_meta_target(a))
                        .collect();
                    FormatCache::from_raw(self.names.names(&*self.transport, &atoms))
                });
                if let OfferKey::Selection(id) = key
                    && let Some(state) = self.offers.get_mut(&id)
                    && cache.is_some()
                {
                    state.targets = cache.clone();
                }
                if let Some(completer) = completer {
                    match cache {
                        Some(cache) => self.outbox.complete(completer, cache.formats()),
                        None => self.outbox.fail(completer),
                    }
                }
            }
            Want::Data(format, completer) => {
                let data = value
                    .map(|v| {
                        if v.type_ == self.atoms.STRING {
                            wrap(&latin1_to_utf8(&v.data), &format)
                        } else {
                            wrap(&v.data, &format)
                        }
                    })
                    .unwrap_or_default();
                if data.is_empty() {
                    tracing::debug!(format = %format, "conversion produced no data");
                }
                if let Some(completer) = completer {
                    self.outbox.complete(completer, data);
                }
                if let OfferKey::Drop(id) = key {
                    self.drop_request_done(id);
                }
            }
        }
    }

    /// Pull every conversion belonging to `key` out of the queues. An
    /// in-flight one is detached rather than removed.
    pub(super) fn take_conversions(&mut self, key: OfferKey) -> Vec<Conversion> {
        let mut taken = Vec::new();
        for reader in self.readers.values_mut() {
            let (mine, rest): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut reader.queue)
                .into_iter()
                .partition(|c| c.key == key);
            reader.queue = rest;
            taken.extend(mine);
            if let Some(flight) = reader.in_flight.as_mut()
                && flight.conversion.key == key
            {
                taken.push(flight.conversion.detach());
            }
        }
        taken
    }
}
