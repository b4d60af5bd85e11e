use allocator_api2::alloc::Allocator;
use log::trace;
use std::{
    alloc::Layout,
    cell::Cell,
    mem::{ self, ManuallyDrop, MaybeUninit },
    ptr::{ self, NonNull }
};
use crate::{
    deleter::Deleter,
    error::SharedError
};

// Type-erased entry points of a concrete block. Every block starts with a BlockHeader that points
// at one of these, so handles never need to know the block's payload, deleter or allocator types.
pub(crate) struct BlockVTable {
    pub(crate) destroy: unsafe fn(NonNull<BlockHeader>),
    pub(crate) deallocate: unsafe fn(NonNull<BlockHeader>),
    pub(crate) name: &'static str
}

/// Bookkeeping shared by every handle of one ownership group.
#[repr(C)]
pub(crate) struct BlockHeader {
    vtable: &'static BlockVTable,
    uses: Cell<usize>,
    weaks: Cell<usize>
}

impl BlockHeader {
    // a freshly created block is owned by exactly one strong handle
    fn new<B: ControlBlock>() -> Self {
        Self {
            vtable: B::VTABLE,
            uses: Cell::new(1),
            weaks: Cell::new(0)
        }
    }

    pub(crate) fn uses(&self) -> usize { self.uses.get() }
    pub(crate) fn weaks(&self) -> usize { self.weaks.get() }

    pub(crate) fn inc_uses(&self) { increment(&self.uses) }
    pub(crate) fn inc_weaks(&self) { increment(&self.weaks) }

    fn dec_uses(&self) -> usize {
        let n = self.uses.get() - 1;
        self.uses.set(n);
        n
    }

    fn dec_weaks(&self) -> usize {
        let n = self.weaks.get() - 1;
        self.weaks.set(n);
        n
    }
}

fn increment(count: &Cell<usize>) {
    let n = count.get().wrapping_add(1);
    count.set(n);
    // a wrapped counter would free the payload under live handles
    if n == 0 {
        std::process::abort();
    }
}

/// Drops one strong unit. The last strong unit destroys the payload, and the block itself goes
/// too when no weak unit is left.
///
/// # Safety
///
/// `block` must be a live block and the caller must own one of its strong units.
pub(crate) unsafe fn release_strong(block: NonNull<BlockHeader>) {
    let header = unsafe { block.as_ref() };
    if header.dec_uses() != 0 {
        return;
    }
    // The payload may own weak handles into this block (EnableSharedFromThis does). Hold a weak
    // unit across destroy so those drops can't free the block under us.
    header.inc_weaks();
    let destroy = header.vtable.destroy;
    trace!("destroying payload of {} block at {:p}", header.vtable.name, block);
    unsafe {
        destroy(block);
        release_weak(block);
    }
}

/// Drops one weak unit, freeing the block once both counts are zero.
///
/// # Safety
///
/// `block` must be a live block and the caller must own one of its weak units.
pub(crate) unsafe fn release_weak(block: NonNull<BlockHeader>) {
    let header = unsafe { block.as_ref() };
    if header.dec_weaks() == 0 && header.uses() == 0 {
        let deallocate = header.vtable.deallocate;
        trace!("deallocating {} block at {:p}", header.vtable.name, block);
        unsafe { deallocate(block) }
    }
}

/// The two capabilities every block variant provides.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with a [`BlockHeader`] as their first field, so a pointer
/// to the header is also a pointer to the block.
pub(crate) unsafe trait ControlBlock: Sized {
    const NAME: &'static str;

    const VTABLE: &'static BlockVTable = &BlockVTable {
        destroy: erased_destroy::<Self>,
        deallocate: erased_deallocate::<Self>,
        name: Self::NAME
    };

    /// Runs the payload's cleanup. Called exactly once, when the strong count reaches zero.
    unsafe fn destroy(this: NonNull<Self>);

    /// Frees the block's own storage. Called exactly once, after `destroy`, when both counts
    /// are zero. `this` must not be touched afterwards.
    unsafe fn deallocate(this: NonNull<Self>);
}

unsafe fn erased_destroy<B: ControlBlock>(block: NonNull<BlockHeader>) {
    unsafe { B::destroy(block.cast()) }
}

unsafe fn erased_deallocate<B: ControlBlock>(block: NonNull<BlockHeader>) {
    unsafe { B::deallocate(block.cast()) }
}

// Block for a payload that was allocated elsewhere and is adopted by pointer. The deleter decides
// how the payload is released, the allocator only ever sees the block itself.
#[repr(C)]
pub(crate) struct SeparateBlock<T, D, A>
where T: ?Sized,
      D: Deleter<T>,
      A: Allocator
{
    header: BlockHeader,
    ptr: Option<NonNull<T>>,
    deleter: Option<D>,
    alloc: ManuallyDrop<A>
}

impl<T, D, A> SeparateBlock<T, D, A>
where T: ?Sized,
      D: Deleter<T>,
      A: Allocator
{
    /// Allocates a block adopting `ptr`. If the block can't be allocated the payload is handed
    /// to `deleter` before the error is returned, so nothing leaks.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid until `deleter` is invoked on it.
    pub(crate) unsafe fn try_new(ptr: NonNull<T>, deleter: D, alloc: A)
        -> Result<NonNull<BlockHeader>, SharedError>
    {
        let layout = Layout::new::<Self>();
        let raw = match alloc.allocate(layout) {
            Ok(raw) => raw.cast::<Self>(),
            Err(_) => {
                unsafe { deleter.delete(ptr) };
                return Err(SharedError::alloc(layout));
            }
        };
        unsafe {
            raw.as_ptr().write(Self {
                header: BlockHeader::new::<Self>(),
                ptr: Some(ptr),
                deleter: Some(deleter),
                alloc: ManuallyDrop::new(alloc)
            });
        }
        trace!("allocated {} block at {:p} ({} bytes)", Self::NAME, raw, layout.size());
        Ok(raw.cast())
    }
}

unsafe impl<T, D, A> ControlBlock for SeparateBlock<T, D, A>
where T: ?Sized,
      D: Deleter<T>,
      A: Allocator
{
    const NAME: &'static str = "separate";

    unsafe fn destroy(this: NonNull<Self>) {
        let raw = this.as_ptr();
        // both are taken out so a second destroy finds nothing to release
        let (ptr, deleter) = unsafe { ((*raw).ptr.take(), (*raw).deleter.take()) };
        if let (Some(ptr), Some(deleter)) = (ptr, deleter) {
            unsafe { deleter.delete(ptr) }
        }
    }

    unsafe fn deallocate(this: NonNull<Self>) {
        let raw = this.as_ptr();
        unsafe {
            // the stored allocator is moved out, nothing may read it after this
            let alloc = ManuallyDrop::take(&mut (*raw).alloc);
            ptr::drop_in_place(&raw mut (*raw).deleter);
            alloc.deallocate(this.cast(), Layout::new::<Self>());
        }
    }
}

// Block that carries the payload inline, so the payload and its bookkeeping share one allocation.
#[repr(C)]
pub(crate) struct InlineBlock<T, A>
where A: Allocator
{
    header: BlockHeader,
    alloc: ManuallyDrop<A>,
    value: MaybeUninit<T>
}

// frees the block storage again if the payload never gets constructed
struct StorageGuard<'a, A>
where A: Allocator
{
    raw: NonNull<u8>,
    layout: Layout,
    alloc: &'a A
}

impl<'a, A> Drop for StorageGuard<'a, A>
where A: Allocator
{
    fn drop(&mut self) {
        unsafe { self.alloc.deallocate(self.raw, self.layout) }
    }
}

impl<T, A> InlineBlock<T, A>
where A: Allocator
{
    /// Allocates a block and builds the payload straight into its inline slot. The block only
    /// becomes visible once `init` has succeeded; on error or panic the storage is released.
    pub(crate) fn try_new_with<E, F>(alloc: A, init: F)
        -> Result<(NonNull<BlockHeader>, NonNull<T>), SharedError<E>>
    where F: FnOnce() -> Result<T, E>
    {
        let layout = Layout::new::<Self>();
        let raw = alloc.allocate(layout)
            .map_err(|_| SharedError::alloc(layout))?
            .cast::<Self>();
        let guard = StorageGuard { raw: raw.cast(), layout, alloc: &alloc };
        let slot = unsafe { (&raw mut (*raw.as_ptr()).value).cast::<T>() };
        match init() {
            Ok(value) => unsafe { slot.write(value) },
            Err(e) => return Err(SharedError::Construct(e))
        }
        mem::forget(guard);
        unsafe {
            (&raw mut (*raw.as_ptr()).header).write(BlockHeader::new::<Self>());
            (&raw mut (*raw.as_ptr()).alloc).write(ManuallyDrop::new(alloc));
        }
        trace!("allocated {} block at {:p} ({} bytes)", Self::NAME, raw, layout.size());
        Ok((raw.cast(), unsafe { NonNull::new_unchecked(slot) }))
    }
}

unsafe impl<T, A> ControlBlock for InlineBlock<T, A>
where A: Allocator
{
    const NAME: &'static str = "inline";

    unsafe fn destroy(this: NonNull<Self>) {
        unsafe { ptr::drop_in_place((&raw mut (*this.as_ptr()).value).cast::<T>()) }
    }

    unsafe fn deallocate(this: NonNull<Self>) {
        let raw = this.as_ptr();
        unsafe {
            let alloc = ManuallyDrop::take(&mut (*raw).alloc);
            alloc.deallocate(this.cast(), Layout::new::<Self>());
        }
    }
}
