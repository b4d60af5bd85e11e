// std::make_shared / std::allocate_shared
// Payload and control block share a single allocation here, unlike adoption by pointer.
use allocator_api2::alloc::{ Allocator, Global };
use std::convert::Infallible;
use crate::{
    control_block::InlineBlock,
    enable_shared::SharedFromThis,
    error::SharedError,
    shared_ptr::SharedPtr
};

/// Constructs `value` inside a new control block from the global allocator.
pub fn make_shared<T>(value: T) -> SharedPtr<T> {
    allocate_shared(Global, value)
}

pub fn allocate_shared<T, A>(alloc: A, value: T) -> SharedPtr<T>
where A: Allocator + 'static
{
    allocate_shared_with(alloc, move || value)
}

/// Runs `init` and writes its result straight into the block's payload slot.
pub fn allocate_shared_with<T, A, F>(alloc: A, init: F) -> SharedPtr<T>
where A: Allocator + 'static,
      F: FnOnce() -> T
{
    match try_allocate_shared_with(alloc, move || Ok::<T, Infallible>(init())) {
        Ok(shared) => shared,
        Err(e) => e.handle()
    }
}

pub fn try_allocate_shared<T, A>(alloc: A, value: T) -> Result<SharedPtr<T>, SharedError>
where A: Allocator + 'static
{
    try_allocate_shared_with(alloc, move || Ok(value))
}

/// Allocates the block, then runs the fallible constructor `init` into it. If `init` fails the
/// storage is released and its error comes back as [`SharedError::Construct`]; no handle is
/// ever created for a half-built payload.
pub fn try_allocate_shared_with<T, A, E, F>(alloc: A, init: F) -> Result<SharedPtr<T>, SharedError<E>>
where A: Allocator + 'static,
      F: FnOnce() -> Result<T, E>
{
    let (rep, ptr) = InlineBlock::try_new_with(alloc, init)?;
    Ok(unsafe { SharedPtr::from_parts(ptr, rep) })
}

/// [`make_shared`], then links the payload's [`EnableSharedFromThis`](crate::EnableSharedFromThis).
pub fn make_shared_observed<T>(value: T) -> SharedPtr<T>
where T: SharedFromThis
{
    make_shared(value).observe()
}

pub fn allocate_shared_observed<T, A>(alloc: A, value: T) -> SharedPtr<T>
where T: SharedFromThis,
      A: Allocator + 'static
{
    allocate_shared(alloc, value).observe()
}
