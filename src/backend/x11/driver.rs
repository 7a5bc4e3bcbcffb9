//! Drives an [`X11DataManager`]: feeds it events, runs the completions it
//! queued, and delivers its notices to the window layer's listener.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use x11rb::protocol::xproto::{Atom, Timestamp, Window};

use super::atoms::Atoms;
use super::manager::{ReplyTo, X11DataManager, X11Notice};
use super::transport::{X11Connection, X11Event, X11Transport};
use crate::config::ExchangeConfig;
use crate::error::Result;
use crate::exchange::{DataOffer, DataSource, DndListener, DndReply, DropOutcome, Position, RejectAll};
use crate::request::{AsyncRequest, Deferred, EventPump};

/// Poll timeout for one pump tick, in milliseconds.
const PUMP_POLL_MS: u16 = 100;

pub struct X11Backend {
    manager: Rc<RefCell<X11DataManager>>,
    listener: RefCell<Box<dyn DndListener>>,
    /// Notices waiting for the listener (it is busy while it waits).
    parked: RefCell<VecDeque<X11Notice>>,
}

impl X11Backend {
    pub fn new(transport: Rc<dyn X11Transport>, config: ExchangeConfig) -> Result<Self> {
        Ok(Self {
            manager: X11DataManager::new(transport, config)?,
            listener: RefCell::new(Box::new(RejectAll)),
            parked: RefCell::new(VecDeque::new()),
        })
    }

    #[cfg(test)]
    pub(super) fn manager(&self) -> &Rc<RefCell<X11DataManager>> {
        &self.manager
    }

    fn atoms(&self) -> Atoms {
        self.manager.borrow().atoms
    }

    pub fn set_listener(&self, listener: Box<dyn DndListener>) {
        match self.listener.try_borrow_mut() {
            Ok(mut slot) => *slot = listener,
            Err(_) => tracing::warn!("cannot replace the listener from inside a callback"),
        }
    }

    /// Process one event and everything it triggered. Only a lost
    /// connection is returned as an error.
    pub fn handle_event(&self, event: X11Event) -> Result<()> {
        let result = self.manager.borrow_mut().process_event(event);
        self.flush();
        match result {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "X11 event handling failed");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Run queued completions and deliver queued notices until the
    /// manager has nothing left.
    pub fn flush(&self) {
        loop {
            let items = match self.manager.try_borrow_mut() {
                Ok(mut manager) => manager.outbox.take(),
                Err(_) => return,
            };
            if items.is_empty() {
                if self.deliver_parked() {
                    continue;
                }
                return;
            }
            for item in items {
                match item {
                    Deferred::Complete(complete) => complete(),
                    Deferred::Emit(notice) => {
                        self.parked.borrow_mut().push_back(notice);
                        self.deliver_parked();
                    }
                }
            }
        }
    }

    /// Hand parked notices to the listener in order. Returns whether any
    /// was delivered.
    fn deliver_parked(&self) -> bool {
        let mut delivered = false;
        loop {
            let Ok(mut listener) = self.listener.try_borrow_mut() else {
                return delivered;
            };
            let Some(X11Notice { event, reply }) = self.parked.borrow_mut().pop_front() else {
                return delivered;
            };
            tracing::trace!(?event, "delivering drag-and-drop event");
            let answer = listener.dnd_event(event);
            drop(listener);
            delivered = true;
            self.answer(reply, &answer);
        }
    }

    fn answer(&self, to: ReplyTo, reply: &DndReply) {
        let result = match to {
            ReplyTo::Nothing => return,
            ReplyTo::Position(id) => self.manager.borrow_mut().answer_position(id, reply),
            ReplyTo::Drop(id) => self.manager.borrow_mut().answer_drop(id, reply),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "answering drag source failed");
        }
    }

    /// Tear every session down; outstanding requests resolve as failed.
    pub fn shutdown(&self) {
        self.manager.borrow_mut().shutdown();
        self.parked.borrow_mut().clear();
        self.flush();
    }

    fn set_selection(&self, selection: Atom, source: Option<Rc<dyn DataSource>>) -> bool {
        let result = self.manager.borrow_mut().set_selection(selection, source);
        self.flush();
        result.unwrap_or_else(|e| {
            tracing::warn!(selection, error = %e, "setting selection failed");
            false
        })
    }

    fn selection(&self, selection: Atom) -> Option<Rc<dyn DataOffer>> {
        let result = self.manager.borrow_mut().selection_offer(selection);
        result.unwrap_or_else(|e| {
            tracing::warn!(selection, error = %e, "querying selection owner failed");
            None
        })
    }

    /// Claim CLIPBOARD for `source`, or release it with `None`.
    pub fn clipboard_set(&self, source: Option<Rc<dyn DataSource>>) -> bool {
        self.set_selection(self.atoms().CLIPBOARD, source)
    }

    pub fn clipboard(&self) -> Option<Rc<dyn DataOffer>> {
        self.selection(self.atoms().CLIPBOARD)
    }

    pub fn primary_set(&self, source: Option<Rc<dyn DataSource>>) -> bool {
        self.set_selection(self.atoms().PRIMARY, source)
    }

    pub fn primary(&self) -> Option<Rc<dyn DataOffer>> {
        self.selection(self.atoms().PRIMARY)
    }

    /// Whether we still own `selection` (no `SelectionClear` yet).
    pub fn owns_selection(&self, selection: Atom) -> bool {
        self.manager.borrow().owned.contains_key(&selection)
    }

    pub fn owns_clipboard(&self) -> bool {
        self.owns_selection(self.atoms().CLIPBOARD)
    }

    pub fn owns_primary(&self) -> bool {
        self.owns_selection(self.atoms().PRIMARY)
    }

    pub fn start_drag(&self, source: Rc<dyn DataSource>) -> bool {
        let result = self.manager.borrow_mut().start_drag(source);
        self.flush();
        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "starting drag failed");
            false
        })
    }

    /// Pointer motion during our drag. `window` is the top-level under
    /// the pointer.
    pub fn drag_motion(&self, window: Option<Window>, position: Position, time: Timestamp) {
        let result = self.manager.borrow_mut().drag_motion(window, position, time);
        self.flush();
        if let Err(e) = result {
            tracing::warn!(error = %e, "drag motion failed");
        }
    }

    pub fn drag_release(&self, time: Timestamp) -> AsyncRequest<DropOutcome> {
        let result = self.manager.borrow_mut().drag_release(time);
        self.flush();
        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "drag release failed");
            AsyncRequest::failed()
        })
    }
}

/// [`EventPump`] over a live display connection.
pub struct X11EventPump {
    conn: Rc<X11Connection>,
    backend: Rc<X11Backend>,
}

impl X11EventPump {
    pub fn new(conn: Rc<X11Connection>, backend: Rc<X11Backend>) -> Self {
        Self { conn, backend }
    }

    /// Handle everything already queued. Returns how many events were seen.
    fn drain(&self) -> Result<usize> {
        let mut seen = 0;
        while let Some(event) = self.conn.poll_event()? {
            seen += 1;
            if let Some(event) = X11Event::from_wire(event) {
                self.backend.handle_event(event)?;
            }
        }
        Ok(seen)
    }

    fn dispatch(&self) -> Result<()> {
        if self.drain()? > 0 {
            return Ok(());
        }
        if self.conn.wait_readable(PUMP_POLL_MS)? {
            self.drain()?;
        }
        Ok(())
    }
}

impl EventPump for X11EventPump {
    fn pump(&self) -> Result<()> {
        self.backend.flush();
        let result = self.dispatch();
        if let Err(e) = &result
            && e.is_fatal()
        {
            tracing::error!(error = %e, "X11 connection lost");
            self.backend.shutdown();
        }
        result
    }
}
