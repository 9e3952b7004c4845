//! Lightweight handle types for shared ownership and weak back references.
//!
//! Provide two complementary handle types:
//! - [Handle<T>] owns a strong reference to an object using [alloc::sync::Arc]. A device is kept
//!   alive by the single [Handle<T>] stored in its parent's child list (or in the context for the
//!   root); handles obtained from lookups are temporary.
//! - [HandleRef<T>] stores a weak reference ([alloc::sync::Weak]) and is used for parent links and
//!   uclass membership, which must not keep the target alive.
//!
//! Call [HandleRef::get_handle] to upgrade; it returns [None] once the owner dropped the object.
use alloc::{sync::Arc, sync::Weak};
use core::{fmt, ops::Deref};

/// Strong owning handle backed by [Arc<T>].
///
/// Two handles are equal when they point at the same object.
pub struct Handle<T> {
    inner: Arc<T>,
}

impl<T> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> From<T> for Handle<T> {
    fn from(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for Handle<T> {}

impl<T: fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl<T> Handle<T> {
    /// Create a non-owning [HandleRef<T>] that refers to the same underlying object.
    pub fn create_ref(&self) -> HandleRef<T> {
        HandleRef {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether `other` refers to this object.
    pub fn is(&self, other: &HandleRef<T>) -> bool {
        core::ptr::eq(Arc::as_ptr(&self.inner), other.inner.as_ptr())
    }
}

/// Weak (non-owning) handle backed by [Weak<T>].
pub struct HandleRef<T> {
    inner: Weak<T>,
}

impl<T> Clone for HandleRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for HandleRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleRef({:p})", self.inner.as_ptr())
    }
}

impl<T> HandleRef<T> {
    /// Attempt to upgrade the weak reference into a strong [Handle<T>].
    ///
    /// Return `Some(Handle<T>)` if the target is still alive, otherwise return `None`.
    pub fn get_handle(&self) -> Option<Handle<T>> {
        Weak::upgrade(&self.inner).map(|inner| Handle { inner })
    }
}
