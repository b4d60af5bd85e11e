use allocator_api2::alloc::Allocator;
use std::{
    cell::OnceCell,
    fmt::{ self, Debug }
};
use crate::{
    deleter::Deleter,
    shared_ptr::SharedPtr,
    weak_ptr::WeakPtr
};

// std::enable_shared_from_this
/// Embedded in a payload so its methods can hand out strong handles to themselves, joining the
/// existing ownership group instead of starting a second one.
///
/// The slot starts empty. It's filled by the observed entry points
/// ([`SharedPtr::from_box_observed`], [`make_shared_observed`](crate::make_shared_observed) and
/// friends) the first time an owning handle is created for the object. Until then
/// [`shared_from_this`](Self::shared_from_this) gives an empty handle.
pub struct EnableSharedFromThis<T> {
    weak: OnceCell<WeakPtr<T>>
}

impl<T> EnableSharedFromThis<T> {
    pub const fn new() -> Self {
        Self { weak: OnceCell::new() }
    }

    pub fn shared_from_this(&self) -> SharedPtr<T> {
        self.weak.get().map(WeakPtr::lock).unwrap_or_default()
    }

    pub fn weak_from_this(&self) -> WeakPtr<T> {
        self.weak.get().cloned().unwrap_or_default()
    }

    // first owner wins, a later adoption of the same object keeps the original group
    fn link(&self, weak: WeakPtr<T>) {
        let _ = self.weak.set(weak);
    }
}

impl<T> Default for EnableSharedFromThis<T> {
    fn default() -> Self { Self::new() }
}

// A copied payload is a new object, it must not alias the original's group
impl<T> Clone for EnableSharedFromThis<T> {
    fn clone(&self) -> Self { Self::new() }
}

impl<T> Debug for EnableSharedFromThis<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.weak.get() {
            Some(weak) => write!(f, "EnableSharedFromThis({:?})", weak),
            None => write!(f, "EnableSharedFromThis(unlinked)")
        }
    }
}

/// Opt-in for self-observation: point at the embedded [`EnableSharedFromThis`].
pub trait SharedFromThis: Sized {
    fn enable_shared(&self) -> &EnableSharedFromThis<Self>;

    fn shared_from_this(&self) -> SharedPtr<Self> {
        self.enable_shared().shared_from_this()
    }

    fn weak_from_this(&self) -> WeakPtr<Self> {
        self.enable_shared().weak_from_this()
    }
}

impl<T> SharedPtr<T>
where T: SharedFromThis
{
    // hand the payload a weak handle to its own group
    pub(crate) fn observe(self) -> Self {
        if let Some(value) = self.get() {
            value.enable_shared().link(self.downgrade());
        }
        self
    }

    /// [`from_box`](Self::from_box), then links the payload's [`EnableSharedFromThis`].
    pub fn from_box_observed(value: Box<T>) -> Self {
        Self::from_box(value).observe()
    }

    /// # Safety
    ///
    /// Same as [`from_raw`](Self::from_raw).
    pub unsafe fn from_raw_observed(ptr: *mut T) -> Self {
        unsafe { Self::from_raw(ptr) }.observe()
    }

    /// # Safety
    ///
    /// Same as [`from_raw_with_deleter`](Self::from_raw_with_deleter).
    pub unsafe fn from_raw_with_deleter_observed<D>(ptr: *mut T, deleter: D) -> Self
    where D: Deleter<T> + 'static
    {
        unsafe { Self::from_raw_with_deleter(ptr, deleter) }.observe()
    }

    /// [`reset_with`](Self::reset_with), with the new payload's [`EnableSharedFromThis`] linked
    /// to the fresh group.
    pub fn reset_with_observed(&mut self, value: Box<T>) {
        Self::from_box_observed(value).swap(self)
    }

    /// # Safety
    ///
    /// Same as [`from_raw`](Self::from_raw).
    pub unsafe fn reset_raw_observed(&mut self, ptr: *mut T) {
        unsafe { Self::from_raw_observed(ptr) }.swap(self)
    }

    /// [`from_raw_with_deleter_in`](Self::from_raw_with_deleter_in), then links the payload's
    /// [`EnableSharedFromThis`].
    ///
    /// # Safety
    ///
    /// Same as [`from_raw_with_deleter`](Self::from_raw_with_deleter).
    pub unsafe fn from_raw_with_deleter_in_observed<D, A>(ptr: *mut T, deleter: D, alloc: A) -> Self
    where D: Deleter<T> + 'static,
          A: Allocator + 'static
    {
        unsafe { Self::from_raw_with_deleter_in(ptr, deleter, alloc) }.observe()
    }
}
