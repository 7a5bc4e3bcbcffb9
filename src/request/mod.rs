//! Cooperative completion: single-producer, single-consumer requests
//! resolved by the event loop.
//!
//! An [`AsyncRequest`] is handed to the consumer; the matching
//! [`Completer`] stays with whichever backend will eventually produce the
//! value. The consumer either registers a continuation
//! ([`AsyncRequest::on_ready`]) or blocks cooperatively in
//! [`AsyncRequest::wait`], which re-enters the event loop through
//! [`LoopControl`] until the request resolves.
//!
//! Dropping a `Completer` without completing it force-completes the
//! request with `R::default()`, the failure value. Tearing down a session
//! therefore resolves every outstanding request instead of leaving it to
//! hang.
//!
//! Everything here is single-threaded (`Rc`/`RefCell`): all transitions
//! happen on the thread that owns the event loop.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::error::{ExchangeError, WaitError};

/// Observable state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Ready,
    Consumed,
}

type Continuation<R> = Box<dyn FnOnce(R)>;

enum Slot<R> {
    Pending(Option<Continuation<R>>),
    Ready(R),
    Consumed,
}

impl<R> Slot<R> {
    fn state(&self) -> RequestState {
        match self {
            Slot::Pending(_) => RequestState::Pending,
            Slot::Ready(_) => RequestState::Ready,
            Slot::Consumed => RequestState::Consumed,
        }
    }
}

/// Resolve a slot. The continuation, if any, runs after the borrow is
/// released so it may freely touch other requests.
fn resolve<R>(slot: &RefCell<Slot<R>>, value: R) {
    let continuation = {
        let mut slot = slot.borrow_mut();
        match &mut *slot {
            Slot::Pending(continuation) => match continuation.take() {
                Some(f) => {
                    *slot = Slot::Consumed;
                    Some(f)
                }
                None => {
                    *slot = Slot::Ready(value);
                    return;
                }
            },
            // Already force-completed (connection loss during wait).
            Slot::Ready(_) | Slot::Consumed => return,
        }
    };
    if let Some(f) = continuation {
        f(value);
    }
}

/// Consumer side of a pending value.
pub struct AsyncRequest<R> {
    slot: Rc<RefCell<Slot<R>>>,
}

/// Producer side of an [`AsyncRequest`]. Completes it exactly once.
pub struct Completer<R: Default> {
    slot: Option<Rc<RefCell<Slot<R>>>>,
}

impl<R> AsyncRequest<R> {
    /// Create a pending request and its completer.
    pub fn new() -> (AsyncRequest<R>, Completer<R>)
    where
        R: Default,
    {
        let slot = Rc::new(RefCell::new(Slot::Pending(None)));
        (
            AsyncRequest {
                slot: Rc::clone(&slot),
            },
            Completer { slot: Some(slot) },
        )
    }

    /// A request that is already resolved.
    pub fn ready(value: R) -> Self {
        AsyncRequest {
            slot: Rc::new(RefCell::new(Slot::Ready(value))),
        }
    }

    /// A request already resolved with the failure value.
    pub fn failed() -> Self
    where
        R: Default,
    {
        Self::ready(R::default())
    }

    pub fn state(&self) -> RequestState {
        self.slot.borrow().state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == RequestState::Ready
    }

    fn has_continuation(&self) -> bool {
        matches!(&*self.slot.borrow(), Slot::Pending(Some(_)))
    }

    /// Take the value if it is ready.
    ///
    /// Returns `Ok(None)` while pending and `Err(WaitError::Consumed)` once
    /// the value has been taken by any consumption path.
    pub fn try_take(&self) -> Result<Option<R>, WaitError> {
        let mut slot = self.slot.borrow_mut();
        match &*slot {
            Slot::Pending(Some(_)) => Err(WaitError::Consumed),
            Slot::Pending(None) => Ok(None),
            Slot::Consumed => Err(WaitError::Consumed),
            Slot::Ready(_) => match std::mem::replace(&mut *slot, Slot::Consumed) {
                Slot::Ready(value) => Ok(Some(value)),
                _ => unreachable!("slot was checked to be ready"),
            },
        }
    }

    /// Register a continuation. Runs immediately if the value is ready.
    ///
    /// Registering on an already consumed request, or registering twice,
    /// is a contract violation; the continuation is dropped with a warning.
    pub fn on_ready(self, f: impl FnOnce(R) + 'static) {
        let ready = {
            let mut slot = self.slot.borrow_mut();
            match &mut *slot {
                Slot::Pending(continuation @ None) => {
                    *continuation = Some(Box::new(f));
                    return;
                }
                Slot::Pending(Some(_)) | Slot::Consumed => {
                    tracing::warn!("continuation registered on an already consumed request");
                    return;
                }
                Slot::Ready(_) => match std::mem::replace(&mut *slot, Slot::Consumed) {
                    Slot::Ready(value) => value,
                    _ => unreachable!("slot was checked to be ready"),
                },
            }
        };
        f(ready);
    }

    /// Resolve as failed from the consumer side (connection loss).
    fn force_fail(&self) {
        *self.slot.borrow_mut() = Slot::Consumed;
    }

    /// Block cooperatively until the request resolves.
    ///
    /// Re-enters the event loop through `control` until the value is
    /// ready, `cancel` (or [`LoopControl::stop`]) interrupts the wait, or
    /// the pump reports the connection died. In the last case the request
    /// is force-completed and `WaitError::ConnectionLost` is returned.
    ///
    /// Unrelated callbacks run during the wait. Nested waits on the same
    /// request are not supported.
    pub fn wait(
        &self,
        control: &LoopControl,
        cancel: Option<&CancelHandle>,
    ) -> Result<R, WaitError> {
        if let Some(value) = self.try_take()? {
            return Ok(value);
        }
        if self.has_continuation() {
            return Err(WaitError::Consumed);
        }

        match control.run_until(|| self.state() != RequestState::Pending, cancel) {
            Ok(LoopExit::Done) => self.try_take()?.ok_or(WaitError::Consumed),
            Ok(LoopExit::Stopped) | Ok(LoopExit::Cancelled) => Err(WaitError::Cancelled),
            Err(e) => {
                self.force_fail();
                Err(WaitError::ConnectionLost(e.to_string()))
            }
        }
    }
}

impl<R> fmt::Debug for AsyncRequest<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRequest")
            .field("state", &self.state())
            .finish()
    }
}

impl<R: Default> Completer<R> {
    /// Resolve the request. Runs the consumer's continuation, if any.
    pub fn complete(mut self, value: R) {
        if let Some(slot) = self.slot.take() {
            resolve(&slot, value);
        }
    }

    /// Resolve with the failure value.
    pub fn fail(self) {
        self.complete(R::default());
    }

    /// Whether the consumer still holds the request.
    pub fn is_wanted(&self) -> bool {
        self.slot
            .as_ref()
            .is_some_and(|slot| Rc::strong_count(slot) > 1)
    }
}

impl<R: Default> Drop for Completer<R> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            tracing::trace!("completer dropped, force-completing request");
            resolve(&slot, R::default());
        }
    }
}

impl<R: Default> fmt::Debug for Completer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("done", &self.slot.is_none())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Loop control
// ---------------------------------------------------------------------------

/// The one primitive borrowed from the surrounding event loop: dispatch
/// a batch of events, blocking until at least one arrives.
///
/// Returning `Err(ExchangeError::Connection(_))` means the connection is
/// gone; implementations must have torn down every live session before
/// returning it.
pub trait EventPump {
    fn pump(&self) -> Result<(), ExchangeError>;
}

/// Why [`LoopControl::run_until`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The predicate became true.
    Done,
    /// [`LoopControl::stop`] was called.
    Stopped,
    /// The supplied [`CancelHandle`] fired.
    Cancelled,
}

/// A cloneable flag that interrupts a nested loop.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Rc<Cell<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.get()
    }

    /// Re-arm the handle for another wait.
    pub fn reset(&self) {
        self.flag.set(false);
    }
}

/// Handle onto the cooperative event loop.
///
/// Cheap to clone; every clone drives the same pump and shares the same
/// stop flag.
#[derive(Clone)]
pub struct LoopControl {
    pump: Rc<dyn EventPump>,
    stop: CancelHandle,
}

impl LoopControl {
    pub fn new(pump: Rc<dyn EventPump>) -> Self {
        Self {
            pump,
            stop: CancelHandle::new(),
        }
    }

    /// Dispatch one batch of events.
    pub fn pump_once(&self) -> Result<(), ExchangeError> {
        self.pump.pump()
    }

    /// Stop the innermost running [`run_until`](Self::run_until).
    /// Callable from any continuation.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// A fresh handle for cancelling one particular wait.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new()
    }

    /// Run the loop until `done` returns true, the loop is stopped, or
    /// `cancel` fires.
    ///
    /// Non-fatal pump errors are logged and the loop keeps going; a
    /// connection error is returned.
    pub fn run_until(
        &self,
        mut done: impl FnMut() -> bool,
        cancel: Option<&CancelHandle>,
    ) -> Result<LoopExit, ExchangeError> {
        loop {
            if done() {
                return Ok(LoopExit::Done);
            }
            if self.stop.is_cancelled() {
                self.stop.reset();
                return Ok(LoopExit::Stopped);
            }
            if cancel.is_some_and(CancelHandle::is_cancelled) {
                return Ok(LoopExit::Cancelled);
            }
            match self.pump.pump() {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "event loop lost its connection");
                    return Err(e);
                }
                Err(e) => tracing::warn!(error = %e, "event dispatch failed"),
            }
        }
    }
}

impl fmt::Debug for LoopControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopControl")
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// A deferred side effect queued by a manager while it is borrowed.
pub enum Deferred<E> {
    /// Resolve a request (runs its continuation).
    Complete(Box<dyn FnOnce()>),
    /// Deliver a backend notice to the listener.
    Emit(E),
}

/// Ordered queue of completions and outward notices.
///
/// Managers live behind `RefCell`. Running a continuation or calling the
/// listener while the manager is borrowed would make any re-entrant call
/// (starting a drag from a drop handler, say) panic, so managers push
/// here instead and the backend driver flushes the queue after releasing
/// the borrow.
pub struct Outbox<E> {
    items: Vec<Deferred<E>>,
}

impl<E> Default for Outbox<E> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<E> Outbox<E> {
    pub fn complete<R: Default + 'static>(&mut self, completer: Completer<R>, value: R) {
        self.items
            .push(Deferred::Complete(Box::new(move || completer.complete(value))));
    }

    pub fn fail<R: Default + 'static>(&mut self, completer: Completer<R>) {
        self.items
            .push(Deferred::Complete(Box::new(move || completer.fail())));
    }

    pub fn emit(&mut self, notice: E) {
        self.items.push(Deferred::Emit(notice));
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Move everything queued so far out, leaving the outbox empty.
    pub fn take(&mut self) -> Vec<Deferred<E>> {
        std::mem::take(&mut self.items)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptPump;
    use super::*;
    use crate::format::ExchangeData;

    fn control() -> (Rc<ScriptPump>, LoopControl) {
        let pump = Rc::new(ScriptPump::default());
        let control = LoopControl::new(pump.clone());
        (pump, control)
    }

    #[test]
    fn ready_request_returns_without_pumping() {
        let (pump, control) = control();
        let request = AsyncRequest::ready(7u32);
        assert_eq!(request.wait(&control, None), Ok(7));
        assert_eq!(pump.pumped.get(), 0);
    }

    #[test]
    fn wait_pumps_until_completed() {
        let (pump, control) = control();
        let (request, completer) = AsyncRequest::<ExchangeData>::new();
        pump.push(|| Ok(()));
        pump.push(move || {
            completer.complete(ExchangeData::Text("hi".into()));
            Ok(())
        });
        assert_eq!(
            request.wait(&control, None),
            Ok(ExchangeData::Text("hi".into()))
        );
        assert_eq!(pump.pumped.get(), 2);
    }

    #[test]
    fn second_read_is_a_contract_violation() {
        let request = AsyncRequest::ready(1u8);
        assert_eq!(request.try_take(), Ok(Some(1)));
        assert_eq!(request.try_take(), Err(WaitError::Consumed));
        assert_eq!(request.state(), RequestState::Consumed);

        let (_, control) = control();
        assert_eq!(request.wait(&control, None), Err(WaitError::Consumed));
    }

    #[test]
    fn continuation_runs_on_complete() {
        let seen = Rc::new(Cell::new(0u32));
        let (request, completer) = AsyncRequest::<u32>::new();
        let sink = seen.clone();
        request.on_ready(move |v| sink.set(v));
        assert_eq!(seen.get(), 0);
        completer.complete(42);
        assert_eq!(seen.get(), 42);
    }

    #[test]
    fn continuation_on_ready_request_runs_immediately() {
        let seen = Rc::new(Cell::new(0u32));
        let sink = seen.clone();
        AsyncRequest::ready(5u32).on_ready(move |v| sink.set(v));
        assert_eq!(seen.get(), 5);
    }

    #[test]
    fn both_consumption_paths_are_rejected() {
        let (request, _completer) = AsyncRequest::<u32>::new();
        let shared = AsyncRequest {
            slot: Rc::clone(&request.slot),
        };
        shared.on_ready(|_| {});
        let (_, control) = control();
        assert_eq!(request.wait(&control, None), Err(WaitError::Consumed));
    }

    #[test]
    fn dropped_completer_force_completes_with_failure() {
        let (request, completer) = AsyncRequest::<ExchangeData>::new();
        drop(completer);
        assert_eq!(request.try_take(), Ok(Some(ExchangeData::Empty)));
    }

    #[test]
    fn connection_loss_force_completes() {
        let (_, control) = control();
        let (request, completer) = AsyncRequest::<ExchangeData>::new();
        let result = request.wait(&control, None);
        assert!(matches!(result, Err(WaitError::ConnectionLost(_))));
        assert_eq!(request.state(), RequestState::Consumed);
        // A late completion is ignored.
        completer.complete(ExchangeData::Text("late".into()));
        assert_eq!(request.state(), RequestState::Consumed);
    }

    #[test]
    fn cancel_leaves_request_pending() {
        let (pump, control) = control();
        let cancel = control.cancel_handle();
        let (request, completer) = AsyncRequest::<u32>::new();

        let c = cancel.clone();
        pump.push(move || {
            c.cancel();
            Ok(())
        });
        assert_eq!(request.wait(&control, Some(&cancel)), Err(WaitError::Cancelled));
        assert_eq!(request.state(), RequestState::Pending);

        cancel.reset();
        pump.push(move || {
            completer.complete(3);
            Ok(())
        });
        assert_eq!(request.wait(&control, Some(&cancel)), Ok(3));
    }

    #[test]
    fn stop_interrupts_run_until() {
        let (pump, control) = control();
        let stopper = control.clone();
        pump.push(move || {
            stopper.stop();
            Ok(())
        });
        assert_eq!(control.run_until(|| false, None).unwrap(), LoopExit::Stopped);
        // The stop flag is consumed by the loop it stopped.
        pump.push(|| Ok(()));
        let mut n = 0;
        assert_eq!(
            control
                .run_until(
                    || {
                        n += 1;
                        n > 1
                    },
                    None
                )
                .unwrap(),
            LoopExit::Done
        );
    }

    #[test]
    fn nested_waits_on_different_requests() {
        let (pump, control) = control();
        let (outer, outer_done) = AsyncRequest::<u32>::new();
        let (inner, inner_done) = AsyncRequest::<u32>::new();

        let nested_control = control.clone();
        let result = Rc::new(Cell::new(0));
        let sink = result.clone();
        pump.push(move || {
            // A callback that itself waits on another request.
            sink.set(inner.wait(&nested_control, None).unwrap());
            outer_done.complete(1);
            Ok(())
        });
        pump.push(move || {
            inner_done.complete(2);
            Ok(())
        });
        assert_eq!(outer.wait(&control, None), Ok(1));
        assert_eq!(result.get(), 2);
    }

    #[test]
    fn outbox_defers_completion() {
        let (request, completer) = AsyncRequest::<u32>::new();
        let mut outbox: Outbox<()> = Outbox::default();
        outbox.complete(completer, 9);
        assert_eq!(request.state(), RequestState::Pending);
        for item in outbox.take() {
            if let Deferred::Complete(f) = item {
                f();
            }
        }
        assert_eq!(request.try_take(), Ok(Some(9)));
        assert!(outbox.is_empty());
    }

    #[test]
    fn completer_tracks_consumer_interest() {
        let (request, completer) = AsyncRequest::<u32>::new();
        assert!(completer.is_wanted());
        drop(request);
        assert!(!completer.is_wanted());
    }
}
