//! The [`DataOffer`] handed out for X11 selections and drops.

use std::cell::RefCell;
use std::rc::Weak;

use super::manager::X11DataManager;
use crate::exchange::DataOffer;
use crate::format::{DataFormat, ExchangeData};
use crate::request::AsyncRequest;

/// Registry key of the session behind an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum OfferKey {
    /// A clipboard or primary offer.
    Selection(u64),
    /// The drop session with this id.
    Drop(u64),
}

/// Handle onto a session the manager keeps. Only holds a weak reference,
/// so an offer outliving the backend just reports itself invalid.
pub struct X11Offer {
    manager: Weak<RefCell<X11DataManager>>,
    key: OfferKey,
    /// The drop handler's copy; releasing it lets the drop finish.
    owned: bool,
}

impl X11Offer {
    pub(super) fn new(manager: Weak<RefCell<X11DataManager>>, key: OfferKey, owned: bool) -> Self {
        Self {
            manager,
            key,
            owned,
        }
    }

    fn with_manager<T>(&self, fallback: T, f: impl FnOnce(&mut X11DataManager) -> T) -> T {
        let Some(manager) = self.manager.upgrade() else {
            return fallback;
        };
        let Ok(mut manager) = manager.try_borrow_mut() else {
            tracing::warn!(key = ?self.key, "offer used while the backend is busy");
            return fallback;
        };
        f(&mut manager)
    }
}

impl DataOffer for X11Offer {
    fn formats(&self) -> AsyncRequest<Vec<DataFormat>> {
        self.with_manager(AsyncRequest::failed(), |m| {
            m.offer_formats(self.key).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "formats request failed");
                AsyncRequest::failed()
            })
        })
    }

    fn data(&self, format: &DataFormat) -> AsyncRequest<ExchangeData> {
        self.with_manager(AsyncRequest::failed(), |m| {
            m.offer_data(self.key, format).unwrap_or_else(|e| {
                tracing::warn!(format = %format, error = %e, "data request failed");
                AsyncRequest::failed()
            })
        })
    }

    fn is_valid(&self) -> bool {
        self.with_manager(false, |m| m.offer_is_valid(self.key))
    }
}

impl Drop for X11Offer {
    fn drop(&mut self) {
        if matches!(self.key, OfferKey::Drop(_)) && !self.owned {
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let orphaned = match manager.try_borrow_mut() {
            Ok(mut manager) => manager.release_offer(self.key, self.owned),
            Err(_) => {
                tracing::warn!(key = ?self.key, "offer released while the backend is busy");
                return;
            }
        };
        // Dropped here, outside the borrow: their requests fail now.
        drop(orphaned);
    }
}
