use std::{
    alloc::{ handle_alloc_error, Layout },
    convert::Infallible
};
use thiserror::Error;

/// Failure while creating a new ownership group.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SharedError<E = Infallible> {
    #[error("failed to allocate a {}-byte control block", .layout.size())]
    Alloc { layout: Layout },

    #[error("payload construction failed: {0}")]
    Construct(E),
}

impl<E> SharedError<E> {
    #[cold]
    pub fn alloc(layout: Layout) -> Self {
        SharedError::Alloc { layout }
    }
}

impl SharedError {
    // the panicking entry points have no error channel, so OOM goes the way of Box and Rc
    pub(crate) fn handle(self) -> ! {
        match self {
            SharedError::Alloc { layout } => handle_alloc_error(layout),
            SharedError::Construct(never) => match never {}
        }
    }
}
