// Instruments shared by the unit tests: a drop counter and an allocator that keeps a tally.
use allocator_api2::alloc::{ AllocError, Allocator, Global };
use std::{
    alloc::Layout,
    cell::Cell,
    ptr::NonNull,
    rc::Rc
};

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, Default)]
pub(crate) struct DropSentinel {
    drops: Rc<Cell<usize>>
}

impl DropSentinel {
    pub(crate) fn new() -> Self { Self::default() }
    pub(crate) fn drops(&self) -> usize { self.drops.get() }
    pub(crate) fn token(&self) -> DropToken { DropToken { drops: self.drops.clone() } }
}

// bumps its sentinel exactly once, when dropped
#[derive(Debug)]
pub(crate) struct DropToken {
    drops: Rc<Cell<usize>>
}

impl Drop for DropToken {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[derive(Debug, Default)]
struct AllocStats {
    allocations: Cell<usize>,
    deallocations: Cell<usize>,
    fail: Cell<bool>
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CountingAlloc {
    stats: Rc<AllocStats>
}

impl CountingAlloc {
    pub(crate) fn new() -> Self { Self::default() }
    pub(crate) fn failing() -> Self {
        let alloc = Self::default();
        alloc.stats.fail.set(true);
        alloc
    }
    pub(crate) fn allocations(&self) -> usize { self.stats.allocations.get() }
    pub(crate) fn deallocations(&self) -> usize { self.stats.deallocations.get() }
    pub(crate) fn live(&self) -> usize { self.allocations() - self.deallocations() }
}

unsafe impl Allocator for CountingAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if self.stats.fail.get() {
            return Err(AllocError);
        }
        self.stats.allocations.set(self.stats.allocations.get() + 1);
        Global.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.stats.deallocations.set(self.stats.deallocations.get() + 1);
        unsafe { Global.deallocate(ptr, layout) }
    }
}
