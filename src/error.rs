//! # Error Taxonomy
//!
//! Every fallible operation in pagetls returns one of five error kinds.
//! Callers are expected to branch on the kind (retry after `destroy`,
//! report `OutOfRange` to the user, treat `OutOfMemory` as backpressure),
//! so the taxonomy is a closed enum rather than an opaque report type.
//!
//! The one failure that is *not* represented here is an `mprotect` failure
//! inside an access envelope: continuing with a page in an unknown
//! protection state is unsafe, so that path aborts the process (see
//! [`crate::page::Page::protect`]).

use thiserror::Error;

/// Errors returned by the pagetls operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TlsError {
    /// The requested size was zero.
    #[error("storage size must be greater than zero")]
    InvalidArgument,

    /// The calling thread already owns a local storage area.
    #[error("calling thread already owns a local storage area")]
    AlreadyExists,

    /// No local storage area exists for the requested thread.
    #[error("no local storage area registered for this thread")]
    NotFound,

    /// `offset + length` exceeds the logical size of the storage area.
    #[error("offset and length exceed the storage area size")]
    OutOfRange,

    /// The kernel refused to map another page.
    #[error("failed to map an anonymous page")]
    OutOfMemory,
}
