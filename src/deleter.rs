use std::ptr::NonNull;

/// Destroy-policy for a payload adopted by pointer. It travels inside the control block, so
/// handles stay the same type whatever policy their block was created with.
///
/// Any `FnOnce(NonNull<T>)` is a deleter, which covers returning objects to a pool or handing
/// them to a C-style free function.
pub trait Deleter<T>
where T: ?Sized
{
    /// Releases the payload.
    ///
    /// # Safety
    ///
    /// `ptr` must be the pointer this deleter was paired with when it was adopted, and must not
    /// be used again afterwards.
    unsafe fn delete(self, ptr: NonNull<T>);
}

// std::default_delete
/// Releases a payload that was allocated as a `Box<T>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultDelete;

impl<T> Deleter<T> for DefaultDelete
where T: ?Sized
{
    unsafe fn delete(self, ptr: NonNull<T>) {
        drop(unsafe { Box::from_raw(ptr.as_ptr()) })
    }
}

impl<T, F> Deleter<T> for F
where T: ?Sized,
      F: FnOnce(NonNull<T>)
{
    unsafe fn delete(self, ptr: NonNull<T>) { self(ptr) }
}
