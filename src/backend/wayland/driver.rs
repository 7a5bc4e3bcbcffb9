//! Drives a [`WaylandDataDevice`]: feeds it events, pumps its pipes,
//! runs the completions it queued and delivers notices to the listener.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::Rc;

use super::device::{PipeInterest, ReplyTo, WaylandDataDevice, WaylandNotice};
use super::transport::{WaylandEvent, WaylandTransport};
use crate::config::ExchangeConfig;
use crate::error::Result;
use crate::exchange::{DataOffer, DataSource, DndListener, DndReply, DropOutcome, RejectAll};
use crate::request::{AsyncRequest, Deferred};

pub struct WaylandBackend {
    device: Rc<RefCell<WaylandDataDevice>>,
    listener: RefCell<Box<dyn DndListener>>,
    parked: RefCell<VecDeque<WaylandNotice>>,
}

impl WaylandBackend {
    pub fn new(transport: Rc<dyn WaylandTransport>, config: ExchangeConfig) -> Self {
        Self {
            device: WaylandDataDevice::new(transport, config),
            listener: RefCell::new(Box::new(RejectAll)),
            parked: RefCell::new(VecDeque::new()),
        }
    }

    #[cfg(test)]
    pub(super) fn device(&self) -> &Rc<RefCell<WaylandDataDevice>> {
        &self.device
    }

    pub fn set_listener(&self, listener: Box<dyn DndListener>) {
        match self.listener.try_borrow_mut() {
            Ok(mut slot) => *slot = listener,
            Err(_) => tracing::warn!("cannot replace the listener from inside a callback"),
        }
    }

    /// Process one event and everything it triggered. Only a lost
    /// connection is returned as an error.
    pub fn handle_event(&self, event: WaylandEvent) -> Result<()> {
        let result = self.device.borrow_mut().process_event(event);
        self.flush();
        match result {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Wayland event handling failed");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Pipe fds with transfers in flight.
    pub fn poll_fds(&self) -> Vec<(RawFd, PipeInterest)> {
        self.device.borrow().poll_fds()
    }

    /// Move every pending transfer forward.
    pub fn service_pipes(&self) {
        self.device.borrow_mut().service_pipes();
        self.flush();
    }

    pub fn flush(&self) {
        loop {
            let items = match self.device.try_borrow_mut() {
                Ok(mut device) => device.outbox.take(),
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

    fn deliver_parked(&self) -> bool {
        let mut delivered = false;
        loop {
            let Ok(mut listener) = self.listener.try_borrow_mut() else {
                return delivered;
            };
            let Some(WaylandNotice { event, reply }) = self.parked.borrow_mut().pop_front() else {
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
            ReplyTo::Position(id) => self.device.borrow_mut().answer_position(id, reply),
            ReplyTo::Drop(id) => self.device.borrow_mut().answer_drop(id, reply),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "answering drag source failed");
        }
    }

    pub fn shutdown(&self) {
        self.device.borrow_mut().shutdown();
        self.parked.borrow_mut().clear();
        self.flush();
    }

    /// Set the selection to `source`, or clear it with `None`.
    pub fn clipboard_set(&self, source: Option<Rc<dyn DataSource>>) -> bool {
        let result = self.device.borrow_mut().set_clipboard(source);
        self.flush();
        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "setting selection failed");
            false
        })
    }

    pub fn clipboard(&self) -> Option<Rc<dyn DataOffer>> {
        self.device.borrow_mut().clipboard()
    }

    /// Whether our source is still the selection.
    pub fn owns_clipboard(&self) -> bool {
        self.device.borrow().clipboard_source.is_some()
    }

    pub fn start_drag(&self, source: Rc<dyn DataSource>) -> AsyncRequest<DropOutcome> {
        let result = self.device.borrow_mut().start_drag(source);
        self.flush();
        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "starting drag failed");
            AsyncRequest::failed()
        })
    }
}
