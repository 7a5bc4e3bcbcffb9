//! The [`DataOffer`] handed out for the selection and for drops.

use std::cell::RefCell;
use std::rc::Weak;

use super::device::WaylandDataDevice;
use super::transport::OfferId;
use crate::exchange::DataOffer;
use crate::format::{DataFormat, ExchangeData};
use crate::request::AsyncRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum OfferKey {
    /// The selection offer, valid while it stays the selection.
    Selection(OfferId),
    /// The drag session with this id.
    Drop(u64),
}

/// Handle onto an offer the device keeps. Each handle has its own id so
/// dropping it fails only the reads it started.
pub struct WaylandOffer {
    device: Weak<RefCell<WaylandDataDevice>>,
    key: OfferKey,
    handle: u64,
    owned: bool,
}

impl WaylandOffer {
    pub(super) fn new(
        device: Weak<RefCell<WaylandDataDevice>>,
        key: OfferKey,
        handle: u64,
        owned: bool,
    ) -> Self {
        Self {
            device,
            key,
            handle,
            owned,
        }
    }

    fn with_device<T>(&self, fallback: T, f: impl FnOnce(&mut WaylandDataDevice) -> T) -> T {
        let Some(device) = self.device.upgrade() else {
            return fallback;
        };
        let Ok(mut device) = device.try_borrow_mut() else {
            tracing::warn!(key = ?self.key, "offer used while the backend is busy");
            return fallback;
        };
        f(&mut device)
    }
}

impl DataOffer for WaylandOffer {
    fn formats(&self) -> AsyncRequest<Vec<DataFormat>> {
        self.with_device(AsyncRequest::failed(), |d| d.offer_formats(self.key))
    }

    fn data(&self, format: &DataFormat) -> AsyncRequest<ExchangeData> {
        if !format.is_valid() {
            return AsyncRequest::failed();
        }
        self.with_device(AsyncRequest::failed(), |d| {
            d.offer_data(self.key, self.handle, format)
                .unwrap_or_else(|e| {
                    tracing::warn!(format = %format, error = %e, "data request failed");
                    AsyncRequest::failed()
                })
        })
    }

    fn is_valid(&self) -> bool {
        self.with_device(false, |d| d.offer_is_valid(self.key))
    }
}

impl Drop for WaylandOffer {
    fn drop(&mut self) {
        // The session's own shared handle goes away with the session.
        if matches!(self.key, OfferKey::Drop(_)) && !self.owned {
            return;
        }
        let Some(device) = self.device.upgrade() else {
            return;
        };
        let orphaned = match device.try_borrow_mut() {
            Ok(mut device) => device.release_offer(self.key, self.handle, self.owned),
            Err(_) => {
                tracing::warn!(key = ?self.key, "offer released while the backend is busy");
                return;
            }
        };
        drop(orphaned);
    }
}
