//! Shared ownership for COM objects.
//!
//! A [`ComObject`] is an `Rc` whose strong count plays the role of the
//! COM reference count: cloning is `AddRef`, dropping is `Release`, and
//! the object is freed when the last handle goes. The explicit
//! [`ComObject::add_ref`] / [`ComObject::release`] calls exist only for
//! the adapter boundary, where a native caller reports counts.

use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use super::types::{Guid, HResult, IID_IUNKNOWN};

/// Interfaces an object answers `QueryInterface` for. `IUnknown` is
/// implied.
pub trait Unknown {
    fn interfaces(&self) -> &'static [Guid];
}

pub struct ComObject<T: ?Sized>(Rc<T>);

impl<T> ComObject<T> {
    pub fn new(value: T) -> Self {
        Self(Rc::new(value))
    }
}

impl<T: ?Sized> ComObject<T> {
    pub fn from_rc(inner: Rc<T>) -> Self {
        Self(inner)
    }

    /// `AddRef`: a new handle onto the same object.
    pub fn add_ref(&self) -> Self {
        Self(Rc::clone(&self.0))
    }

    /// `Release`: gives up this handle and returns the count left.
    pub fn release(self) -> usize {
        let remaining = Rc::strong_count(&self.0) - 1;
        drop(self);
        remaining
    }

    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Whether both handles point at the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn as_rc(&self) -> &Rc<T> {
        &self.0
    }
}

impl<T: ?Sized + Unknown> ComObject<T> {
    /// `QueryInterface`: another handle if the object implements `iid`.
    pub fn query_interface(&self, iid: &Guid) -> Result<Self, HResult> {
        if *iid == IID_IUNKNOWN || self.0.interfaces().contains(iid) {
            Ok(self.add_ref())
        } else {
            Err(HResult::E_NOINTERFACE)
        }
    }
}

impl<T: ?Sized> Clone for ComObject<T> {
    fn clone(&self) -> Self {
        self.add_ref()
    }
}

impl<T: ?Sized> Deref for ComObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> fmt::Debug for ComObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComObject")
            .field("refs", &self.ref_count())
            .finish_non_exhaustive()
    }
}
