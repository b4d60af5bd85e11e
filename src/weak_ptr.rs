use std::{
    fmt::{ self, Debug },
    mem::{ self, ManuallyDrop },
    ptr::NonNull
};
use crate::{
    control_block::{ self, BlockHeader },
    shared_ptr::SharedPtr,
    RawCast
};

// std::weak_ptr
/// Non-owning observer of a [`SharedPtr`]'s payload. It never keeps the payload alive, but its
/// block stays allocated until the last weak handle is gone, so [`expired`](Self::expired) and
/// [`lock`](Self::lock) are always safe to call.
pub struct WeakPtr<T>
where T: ?Sized
{
    _ptr: Option<NonNull<T>>,
    _rep: Option<NonNull<BlockHeader>>
}

impl<T> WeakPtr<T>
where T: ?Sized
{
    pub const fn new() -> Self {
        Self { _ptr: None, _rep: None }
    }

    /// Wraps a block whose weak unit the caller hands over.
    pub(crate) unsafe fn from_parts(ptr: Option<NonNull<T>>, rep: Option<NonNull<BlockHeader>>) -> Self {
        Self { _ptr: ptr, _rep: rep }
    }

    pub(crate) fn parts(&self) -> (Option<NonNull<T>>, Option<NonNull<BlockHeader>>) {
        (self._ptr, self._rep)
    }

    fn get_rep(&self) -> Option<&BlockHeader> {
        self._rep.map(|rep| unsafe { rep.as_ref() })
    }

    /// Number of strong owners, not of weak observers.
    pub fn use_count(&self) -> usize { self.get_rep().map_or(0, BlockHeader::uses) }
    pub fn weak_count(&self) -> usize { self.get_rep().map_or(0, BlockHeader::weaks) }

    /// Point-in-time answer: true if there's no block or no strong owner is left.
    pub fn expired(&self) -> bool { self.use_count() == 0 }

    /// Promotes to a strong handle, or gives an empty one if the payload is already gone.
    pub fn lock(&self) -> SharedPtr<T> {
        match self.expired() {
            true => SharedPtr::new(),
            false => SharedPtr::from_weak(self)
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool { self._rep == other._rep }

    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(&mut self._ptr, &mut other._ptr);
        mem::swap(&mut self._rep, &mut other._rep);
    }

    pub fn reset(&mut self) {
        Self::new().swap(self)
    }

    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// Re-types the payload pointer, keeping the weak unit.
    ///
    /// # Safety
    ///
    /// `f` must not dereference its argument (the payload may be gone), and the pointer it
    /// returns must be valid for as long as the payload is.
    pub unsafe fn cast_raw<U, F>(this: Self, f: F) -> WeakPtr<U>
    where U: ?Sized,
          F: FnOnce(NonNull<T>) -> NonNull<U>
    {
        let this = ManuallyDrop::new(this);
        WeakPtr { _ptr: this._ptr.map(f), _rep: this._rep }
    }
}

impl<T> RawCast for WeakPtr<T>
where T: ?Sized
{
    type Pointee = T;
    type Output<U: ?Sized> = WeakPtr<U>;

    unsafe fn cast_raw<U, F>(self, f: F) -> WeakPtr<U>
    where U: ?Sized,
          F: FnOnce(NonNull<T>) -> NonNull<U>
    {
        unsafe { WeakPtr::cast_raw(self, f) }
    }
}

impl<T> From<&SharedPtr<T>> for WeakPtr<T>
where T: ?Sized
{
    fn from(value: &SharedPtr<T>) -> Self { value.downgrade() }
}

impl<T> Default for WeakPtr<T>
where T: ?Sized
{
    fn default() -> Self { Self::new() }
}

impl<T> Clone for WeakPtr<T>
where T: ?Sized
{
    fn clone(&self) -> Self {
        if let Some(rep) = self.get_rep() {
            rep.inc_weaks();
        }
        Self { _ptr: self._ptr, _rep: self._rep }
    }

    fn clone_from(&mut self, source: &Self) {
        let mut copy = source.clone();
        self.swap(&mut copy);
    }
}

impl<T> Drop for WeakPtr<T>
where T: ?Sized
{
    fn drop(&mut self) {
        if let Some(rep) = self._rep {
            unsafe { control_block::release_weak(rep) }
        }
    }
}

impl<T> Debug for WeakPtr<T>
where T: ?Sized
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakPtr {{ strong: {}, weak: {} }}", self.use_count(), self.weak_count())
    }
}
