use allocator_api2::alloc::{ Allocator, Global };
use std::{
    fmt::{ self, Debug, Display, Pointer },
    marker::PhantomData,
    mem::{ self, ManuallyDrop },
    ops::Deref,
    ptr::NonNull
};
use crate::{
    control_block::{ self, BlockHeader, SeparateBlock },
    deleter::{ DefaultDelete, Deleter },
    error::SharedError,
    weak_ptr::WeakPtr,
    RawCast
};

// std::shared_ptr
/// Owning handle. The payload stays alive while any `SharedPtr` of its ownership group exists.
///
/// The handle is a (payload pointer, control block) pair. Handles of one group may point at
/// different payload types (see [`SharedPtr::map`] and [`upcast!`](crate::upcast)), since
/// the block keeps its own record of what to release.
pub struct SharedPtr<T>
where T: ?Sized
{
    _ptr: Option<NonNull<T>>,
    _rep: Option<NonNull<BlockHeader>>,
    _owns: PhantomData<T>
}

impl<T> SharedPtr<T>
where T: ?Sized
{
    /// An empty handle: no block, no payload, `use_count() == 0`.
    pub const fn new() -> Self {
        Self { _ptr: None, _rep: None, _owns: PhantomData }
    }

    /// Wraps a block whose strong unit the caller hands over.
    pub(crate) unsafe fn from_parts(ptr: NonNull<T>, rep: NonNull<BlockHeader>) -> Self {
        Self { _ptr: Some(ptr), _rep: Some(rep), _owns: PhantomData }
    }

    /// Promotion from a weak handle. The caller must have checked that the payload is alive.
    pub(crate) fn from_weak(weak: &WeakPtr<T>) -> Self {
        let (ptr, rep) = weak.parts();
        if let Some(rep) = rep {
            unsafe { rep.as_ref() }.inc_uses();
        }
        Self { _ptr: ptr, _rep: rep, _owns: PhantomData }
    }

    fn get_rep(&self) -> Option<&BlockHeader> {
        self._rep.map(|rep| unsafe { rep.as_ref() })
    }

    /// Takes ownership of a boxed payload, allocating a separate control block for it.
    pub fn from_box(value: Box<T>) -> Self {
        unsafe { Self::from_raw(Box::into_raw(value)) }
    }

    /// Adopts a pointer obtained from `Box::into_raw`. Leaves an embedded
    /// [`EnableSharedFromThis`](crate::EnableSharedFromThis) unlinked, see `from_raw_observed`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Box<T>` and must not be owned by anything else.
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        unsafe { Self::from_raw_with_deleter(ptr, DefaultDelete) }
    }

    /// Adopts `ptr`, releasing it through `deleter` instead of as a `Box`.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid until `deleter` runs, and `deleter` must be a correct way to
    /// release it.
    pub unsafe fn from_raw_with_deleter<D>(ptr: *mut T, deleter: D) -> Self
    where D: Deleter<T> + 'static
    {
        unsafe { Self::from_raw_with_deleter_in(ptr, deleter, Global) }
    }

    /// Like [`from_raw_with_deleter`](Self::from_raw_with_deleter), with the control block
    /// allocated through `alloc`.
    ///
    /// # Safety
    ///
    /// Same as [`from_raw_with_deleter`](Self::from_raw_with_deleter).
    pub unsafe fn from_raw_with_deleter_in<D, A>(ptr: *mut T, deleter: D, alloc: A) -> Self
    where D: Deleter<T> + 'static,
          A: Allocator + 'static
    {
        match unsafe { Self::try_from_raw_with_deleter_in(ptr, deleter, alloc) } {
            Ok(shared) => shared,
            Err(e) => e.handle()
        }
    }

    /// Fallible form of [`from_raw_with_deleter_in`](Self::from_raw_with_deleter_in). If the
    /// block can't be allocated, `deleter` has already released `ptr` when the error comes back.
    ///
    /// A null `ptr` gives an empty handle and `deleter` is dropped without being called.
    ///
    /// # Safety
    ///
    /// Same as [`from_raw_with_deleter`](Self::from_raw_with_deleter).
    pub unsafe fn try_from_raw_with_deleter_in<D, A>(ptr: *mut T, deleter: D, alloc: A)
        -> Result<Self, SharedError>
    where D: Deleter<T> + 'static,
          A: Allocator + 'static
    {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(Self::new());
        };
        let rep = unsafe { SeparateBlock::try_new(ptr, deleter, alloc)? };
        Ok(unsafe { Self::from_parts(ptr, rep) })
    }

    pub fn use_count(&self) -> usize { self.get_rep().map_or(0, BlockHeader::uses) }
    pub fn weak_count(&self) -> usize { self.get_rep().map_or(0, BlockHeader::weaks) }
    pub fn unique(&self) -> bool { self.use_count() == 1 }
    pub fn is_empty(&self) -> bool { self._rep.is_none() }

    pub fn get(&self) -> Option<&T> {
        self._ptr.map(|ptr| unsafe { ptr.as_ref() })
    }

    pub fn as_ptr(&self) -> Option<NonNull<T>> { self._ptr }

    /// Mutable access, only while this is the sole handle of any kind to the block.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self.use_count() == 1 && self.weak_count() == 0 {
            true => self._ptr.map(|mut ptr| unsafe { ptr.as_mut() }),
            false => None
        }
    }

    /// True if both handles belong to the same ownership group, whatever they point at.
    pub fn ptr_eq(&self, other: &Self) -> bool { self._rep == other._rep }

    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(&mut self._ptr, &mut other._ptr);
        mem::swap(&mut self._rep, &mut other._rep);
    }

    /// Releases this handle's ownership and leaves it empty.
    pub fn reset(&mut self) {
        Self::new().swap(self)
    }

    /// Moves ownership out, leaving this handle empty. Counts are untouched.
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// Replaces the payload with a newly adopted box. The old group is released as in `drop`.
    /// Self-observing payloads go through `reset_with_observed` instead.
    pub fn reset_with(&mut self, value: Box<T>) {
        Self::from_box(value).swap(self)
    }

    /// # Safety
    ///
    /// Same as [`from_raw`](Self::from_raw).
    pub unsafe fn reset_raw(&mut self, ptr: *mut T) {
        unsafe { Self::from_raw(ptr) }.swap(self)
    }

    pub fn downgrade(&self) -> WeakPtr<T> {
        if let Some(rep) = self.get_rep() {
            rep.inc_weaks();
        }
        unsafe { WeakPtr::from_parts(self._ptr, self._rep) }
    }

    /// Turns this handle into one pointing at a part of the payload (a field, or the payload
    /// viewed as a trait object). Both handles share one block.
    pub fn map<U, F>(this: Self, f: F) -> SharedPtr<U>
    where U: ?Sized,
          F: FnOnce(&T) -> &U
    {
        let mapped = match this.get() {
            Some(value) => NonNull::from(f(value)),
            None => return SharedPtr::new()
        };
        let this = ManuallyDrop::new(this);
        match this._rep {
            Some(rep) => unsafe { SharedPtr::from_parts(mapped, rep) },
            None => SharedPtr::new()
        }
    }

    /// Re-types the payload pointer, keeping the strong unit.
    ///
    /// # Safety
    ///
    /// The pointer returned by `f` must be valid for as long as the payload is.
    pub unsafe fn cast_raw<U, F>(this: Self, f: F) -> SharedPtr<U>
    where U: ?Sized,
          F: FnOnce(NonNull<T>) -> NonNull<U>
    {
        let this = ManuallyDrop::new(this);
        SharedPtr { _ptr: this._ptr.map(f), _rep: this._rep, _owns: PhantomData }
    }
}

impl<T> RawCast for SharedPtr<T>
where T: ?Sized
{
    type Pointee = T;
    type Output<U: ?Sized> = SharedPtr<U>;

    unsafe fn cast_raw<U, F>(self, f: F) -> SharedPtr<U>
    where U: ?Sized,
          F: FnOnce(NonNull<T>) -> NonNull<U>
    {
        unsafe { SharedPtr::cast_raw(self, f) }
    }
}

impl<T> Default for SharedPtr<T>
where T: ?Sized
{
    fn default() -> Self { Self::new() }
}

impl<T> From<Box<T>> for SharedPtr<T>
where T: ?Sized
{
    fn from(value: Box<T>) -> Self { Self::from_box(value) }
}

impl<T> Clone for SharedPtr<T>
where T: ?Sized
{
    fn clone(&self) -> Self {
        if let Some(rep) = self.get_rep() {
            rep.inc_uses();
        }
        Self { _ptr: self._ptr, _rep: self._rep, _owns: PhantomData }
    }

    // copy first, then swap: the old group is only released once the new one is held
    fn clone_from(&mut self, source: &Self) {
        let mut copy = source.clone();
        self.swap(&mut copy);
    }
}

impl<T> Drop for SharedPtr<T>
where T: ?Sized
{
    fn drop(&mut self) {
        if let Some(rep) = self._rep {
            unsafe { control_block::release_strong(rep) }
        }
    }
}

impl<T> Deref for SharedPtr<T>
where T: ?Sized
{
    type Target = T;
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => panic!("dereferenced an empty SharedPtr")
        }
    }
}

impl<T> Debug for SharedPtr<T>
where T: Debug + ?Sized
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(v) => write!(f, "SharedPtr {{ data: {:?}, strong: {}, weak: {} }}",
                v, self.use_count(), self.weak_count()),
            None => write!(f, "SharedPtr(empty)")
        }
    }
}

impl<T> Display for SharedPtr<T>
where T: Display + ?Sized
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(v) => write!(f, "{}", v),
            None => write!(f, "None")
        }
    }
}

impl<T> Pointer for SharedPtr<T>
where T: ?Sized
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ptr = self._ptr.map_or(std::ptr::null(), |p| p.as_ptr().cast::<u8>() as *const u8);
        Pointer::fmt(&ptr, f)
    }
}

#[cfg(test)]
pub mod tests {
    use super::SharedPtr;
    use crate::{
        error::SharedError,
        test_util::{ init_logger, CountingAlloc, DropSentinel, DropToken }
    };
    use std::{
        cell::{ Cell, RefCell },
        error::Error,
        ptr::NonNull,
        rc::Rc
    };
    type TestReturn = Result<(), Box<dyn Error>>;

    fn check_use_count(get: usize, expect: usize) {
        assert!(get == expect, "Strong count should be {} instead of {}", expect, get);
    }

    #[test]
    fn empty_handle() -> TestReturn {
        let mut empty: SharedPtr<i32> = SharedPtr::new();
        check_use_count(empty.use_count(), 0);
        assert!(empty.get().is_none(), "Empty handle should have no payload");
        assert!(empty.is_empty(), "Empty handle should report empty");
        empty.reset();
        let copy = empty.clone();
        check_use_count(copy.use_count(), 0);
        assert!(format!("{:?}", copy) == "SharedPtr(empty)", "Unexpected Debug output for empty handle");
        Ok(())
    }

    #[test]
    #[should_panic(expected = "dereferenced an empty SharedPtr")]
    fn deref_empty_panics() {
        let empty: SharedPtr<i32> = SharedPtr::default();
        let _value: i32 = *empty;
    }

    #[test]
    fn adopt_copy_release_scenario() -> TestReturn {
        init_logger();
        let sentinel = DropSentinel::new();
        let s = SharedPtr::from_box(Box::new(sentinel.token()));
        check_use_count(s.use_count(), 1);
        let s2 = s.clone();
        check_use_count(s.use_count(), 2);
        check_use_count(s2.use_count(), 2);
        drop(s);
        check_use_count(s2.use_count(), 1);
        assert!(sentinel.drops() == 0, "Payload must stay alive while a strong handle exists");
        drop(s2);
        assert!(sentinel.drops() == 1, "Payload should be destroyed with the last strong handle");
        Ok(())
    }

    #[test]
    fn counts_follow_live_handles() -> TestReturn {
        let sentinel = DropSentinel::new();
        let mut handles = vec![SharedPtr::from_box(Box::new(sentinel.token()))];
        for expect in 2..=6 {
            handles.push(handles[0].clone());
            check_use_count(handles[0].use_count(), expect);
        }
        let mut moved = handles.pop().unwrap_or_default();
        let taken = moved.take();
        assert!(moved.is_empty(), "Taken-from handle should be empty");
        check_use_count(taken.use_count(), 6);
        while handles.len() > 1 {
            handles.pop();
            check_use_count(taken.use_count(), handles.len() + 1);
        }
        drop(handles);
        assert!(sentinel.drops() == 0, "Payload must not be destroyed early");
        check_use_count(taken.use_count(), 1);
        drop(taken);
        assert!(sentinel.drops() == 1, "Payload should be destroyed exactly once");
        Ok(())
    }

    #[test]
    fn custom_deleter_runs_instead_of_drop() -> TestReturn {
        let pool: Rc<RefCell<Vec<Box<u32>>>> = Rc::default();
        let returned = pool.clone();
        let raw = Box::into_raw(Box::new(42u32));
        let to_pool = move |ptr: NonNull<u32>| {
            returned.borrow_mut().push(unsafe { Box::from_raw(ptr.as_ptr()) })
        };
        let shared = unsafe { SharedPtr::from_raw_with_deleter(raw, to_pool) };
        assert!(*shared == 42, "Payload should be readable through the handle");
        let copy = shared.clone();
        drop(shared);
        assert!(pool.borrow().is_empty(), "Deleter must not run while a strong handle exists");
        drop(copy);
        assert!(pool.borrow().len() == 1 && *pool.borrow()[0] == 42, "Deleter should hand the payload back to the pool");
        Ok(())
    }

    #[test]
    fn custom_allocator_holds_only_the_block() -> TestReturn {
        let sentinel = DropSentinel::new();
        let alloc = CountingAlloc::new();
        let raw = Box::into_raw(Box::new(sentinel.token()));
        let release = |ptr: NonNull<DropToken>| drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        let shared = unsafe { SharedPtr::try_from_raw_with_deleter_in(raw, release, alloc.clone())? };
        assert!(alloc.allocations() == 1, "Allocator should only provide the control block");
        let weak = shared.downgrade();
        drop(shared);
        assert!(sentinel.drops() == 1, "Payload should be destroyed by the deleter");
        assert!(alloc.live() == 1, "Block must survive while a weak handle exists");
        drop(weak);
        assert!(alloc.live() == 0 && alloc.deallocations() == 1, "Block should be freed exactly once");
        Ok(())
    }

    #[test]
    fn failed_adoption_releases_payload() -> TestReturn {
        let sentinel = DropSentinel::new();
        let raw = Box::into_raw(Box::new(sentinel.token()));
        let res = unsafe {
            SharedPtr::try_from_raw_with_deleter_in(raw, crate::DefaultDelete, CountingAlloc::failing())
        };
        assert!(matches!(res, Err(SharedError::Alloc { .. })), "Allocation failure should be returned");
        assert!(sentinel.drops() == 1, "Payload should be released when adoption fails");
        Ok(())
    }

    #[test]
    fn adopting_null_gives_empty_handle() -> TestReturn {
        let called = Rc::new(Cell::new(false));
        let flag = called.clone();
        let shared = unsafe {
            SharedPtr::<u8>::from_raw_with_deleter(std::ptr::null_mut(), move |_: NonNull<u8>| flag.set(true))
        };
        assert!(shared.is_empty(), "Null adoption should yield an empty handle");
        drop(shared);
        assert!(!called.get(), "Deleter must not run for a null pointer");
        Ok(())
    }

    #[test]
    fn assignment_and_self_assignment() -> TestReturn {
        let first = DropSentinel::new();
        let second = DropSentinel::new();
        let mut a = SharedPtr::from_box(Box::new(first.token()));
        let b = SharedPtr::from_box(Box::new(second.token()));
        let alias = a.clone();
        a.clone_from(&alias);
        check_use_count(a.use_count(), 2);
        assert!(first.drops() == 0, "Self-assignment must not release the payload");
        a.clone_from(&b);
        check_use_count(b.use_count(), 2);
        check_use_count(alias.use_count(), 1);
        drop(alias);
        assert!(first.drops() == 1, "Old payload should go when its last owner is reassigned away");
        assert!(a.ptr_eq(&b), "Assigned handle should share the source's block");
        drop((a, b));
        assert!(second.drops() == 1, "Second payload should be destroyed exactly once");
        Ok(())
    }

    #[test]
    fn reset_to_new_pointer() -> TestReturn {
        let old = DropSentinel::new();
        let new = DropSentinel::new();
        let mut shared = SharedPtr::from_box(Box::new(old.token()));
        let keep = shared.clone();
        shared.reset_with(Box::new(new.token()));
        check_use_count(shared.use_count(), 1);
        check_use_count(keep.use_count(), 1);
        assert!(old.drops() == 0, "Old payload is still owned by another handle");
        drop(keep);
        assert!(old.drops() == 1, "Old payload should go with its last owner");
        shared.reset();
        assert!(new.drops() == 1 && shared.is_empty(), "reset should release and empty the handle");
        Ok(())
    }

    #[test]
    fn reset_raw_and_adopt_in_allocator() -> TestReturn {
        let old = DropSentinel::new();
        let new = DropSentinel::new();
        let alloc = CountingAlloc::new();
        let raw = Box::into_raw(Box::new(old.token()));
        let release = |ptr: NonNull<DropToken>| drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        let mut shared = unsafe { SharedPtr::from_raw_with_deleter_in(raw, release, alloc.clone()) };
        assert!(shared.unique() && alloc.allocations() == 1, "Adoption should allocate one block through the allocator");
        let copy = shared.clone();
        assert!(!shared.unique(), "A second owner means the handle is no longer unique");
        drop(copy);
        unsafe { shared.reset_raw(Box::into_raw(Box::new(new.token()))) };
        assert!(old.drops() == 1, "Old payload should be released by the reset");
        assert!(alloc.live() == 0, "Old block should be returned to its allocator");
        assert!(shared.unique() && new.drops() == 0, "Handle should solely own the new payload");
        drop(shared);
        assert!(new.drops() == 1, "New payload should be destroyed with its handle");
        Ok(())
    }

    #[test]
    fn swap_exchanges_groups() -> TestReturn {
        let mut a = SharedPtr::from_box(Box::new(1));
        let mut b = SharedPtr::from_box(Box::new(2));
        let b2 = b.clone();
        a.swap(&mut b);
        assert!(*a == 2 && *b == 1, "Payloads should be exchanged");
        check_use_count(a.use_count(), 2);
        check_use_count(b.use_count(), 1);
        assert!(a.ptr_eq(&b2), "Block should travel with the payload");
        Ok(())
    }

    #[test]
    fn map_to_field_shares_block() -> TestReturn {
        struct Pair { left: u32, right: String }
        let pair = SharedPtr::from_box(Box::new(Pair { left: 3, right: "right".into() }));
        let right = SharedPtr::map(pair.clone(), |p| &p.right);
        check_use_count(pair.use_count(), 2);
        assert!(pair.left == 3 && *right == "right", "Mapped handle should see the field");
        drop(pair);
        assert!(right.as_str() == "right", "Field must stay alive through the mapped handle");
        check_use_count(right.use_count(), 1);
        Ok(())
    }

    #[test]
    fn get_mut_requires_sole_ownership() -> TestReturn {
        let mut shared = SharedPtr::from_box(Box::new(String::from("a")));
        if let Some(s) = shared.get_mut() {
            s.push('b');
        }
        assert!(shared.as_str() == "ab", "get_mut should allow mutation on a unique handle");
        let copy = shared.clone();
        assert!(shared.get_mut().is_none(), "get_mut must refuse while other owners exist");
        drop(copy);
        let weak = shared.downgrade();
        assert!(shared.get_mut().is_none(), "get_mut must refuse while weak observers exist");
        drop(weak);
        assert!(shared.get_mut().is_some(), "get_mut should work again once alone");
        Ok(())
    }

    #[test]
    fn formatting() -> TestReturn {
        let shared = SharedPtr::from_box(Box::new(5));
        let _weak = shared.downgrade();
        assert!(format!("{}", shared) == "5", "Display should forward to the payload");
        assert!(format!("{:?}", shared) == "SharedPtr { data: 5, strong: 1, weak: 1 }",
            "Unexpected Debug output: {:?}", shared);
        assert!(format!("{:p}", shared) != format!("{:p}", std::ptr::null::<u8>()), "Pointer should not be null");
        Ok(())
    }
}
