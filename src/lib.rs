//! Single-threaded shared ownership in the shape of C++'s `shared_ptr`/`weak_ptr`.
//!
//! Every ownership group has one control block holding a strong and a weak count. The payload
//! is destroyed when the strong count reaches zero; the block itself is freed once the weak count
//! has reached zero as well, so a [`WeakPtr`] can keep asking whether its payload is alive.
//!
//! A group starts either by adopting a pointer ([`SharedPtr::from_box`],
//! [`SharedPtr::from_raw_with_deleter_in`]), which allocates a block that only refers to the
//! payload, or through [`make_shared`]/[`allocate_shared`], which place the payload inside the
//! block. Deleters and allocators live in the block, never in the handle type.
//!
//! Counts are plain cells: handles are neither `Send` nor `Sync`. Strong cycles are never
//! collected; break them with a [`WeakPtr`].
use std::ptr::NonNull;

mod control_block;
pub mod deleter;
pub mod enable_shared;
pub mod error;
pub mod make_shared;
pub mod shared_ptr;
pub mod weak_ptr;
#[cfg(test)]
mod test_util;

pub use deleter::{ DefaultDelete, Deleter };
pub use enable_shared::{ EnableSharedFromThis, SharedFromThis };
pub use error::SharedError;
pub use make_shared::{
    allocate_shared,
    allocate_shared_observed,
    allocate_shared_with,
    make_shared,
    make_shared_observed,
    try_allocate_shared,
    try_allocate_shared_with
};
pub use shared_ptr::SharedPtr;
pub use weak_ptr::WeakPtr;

// Common ground of SharedPtr and WeakPtr for `upcast!`
#[doc(hidden)]
pub trait RawCast {
    type Pointee: ?Sized;
    type Output<U: ?Sized>;

    unsafe fn cast_raw<U, F>(self, f: F) -> Self::Output<U>
    where U: ?Sized,
          F: FnOnce(NonNull<Self::Pointee>) -> NonNull<U>;
}

/// Converts a [`SharedPtr`] or [`WeakPtr`] into one of an unsized type its payload coerces to,
/// usually a trait object. The new handle joins the same ownership group.
///
/// ```
/// use shared_ptr::{ make_shared, upcast, SharedPtr };
/// use std::fmt::Display;
///
/// let number = make_shared(7);
/// let shown: SharedPtr<dyn Display> = upcast!(number.clone() => dyn Display);
/// assert_eq!(shown.to_string(), "7");
/// assert_eq!(number.use_count(), 2);
/// ```
#[macro_export]
macro_rules! upcast {
    ($handle:expr => $target:ty) => {
        match $handle {
            // an unsizing coercion keeps the address, so the handle still points at its payload
            handle => unsafe {
                $crate::RawCast::cast_raw(handle, |ptr| -> ::core::ptr::NonNull<$target> { ptr })
            }
        }
    };
}
