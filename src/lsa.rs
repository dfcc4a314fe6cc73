//! # Local Storage Areas
//!
//! An [`Lsa`] is one thread's logical byte-addressable storage: a
//! requested size plus the ordered pages backing it. `pages[i]` backs the
//! byte range `[i * page_size, (i + 1) * page_size)`; the last page may be
//! only partially used.
//!
//! The LSA struct itself is owned by exactly one directory entry, but the
//! pages inside it may be shared with other LSAs (see
//! [`crate::engine`] for the clone and fork protocols). The page vector
//! sits behind a mutex because two structural operations can race:
//!
//! - the owning thread repointing a slot during a copy-on-write fork, and
//! - another thread cloning the page list while registering a shared LSA.
//!
//! That lock is only ever held for bounded, non-blocking work (slot swaps,
//! one-page copies); the fault handler never takes it.

use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::TlsError;
use crate::page::{page_size, Page, Prot};

/// Page list of one LSA. Most LSAs span a handful of pages, so the
/// vector stores four inline before spilling to the heap.
pub type PageVec = SmallVec<[Arc<Page>; 4]>;

/// One thread's local storage area.
#[derive(Debug)]
pub struct Lsa {
    size: usize,
    pages: Mutex<PageVec>,
}

impl Lsa {
    /// Build a fresh LSA of `size` bytes backed by newly mapped,
    /// zero-filled, no-access pages.
    pub fn new(size: usize) -> Result<Arc<Self>, TlsError> {
        let count = size.div_ceil(page_size());
        let mut pages = PageVec::with_capacity(count);
        for _ in 0..count {
            // Pages already mapped are unmapped by drop if a later one
            // fails.
            pages.push(Arc::new(Page::map(Prot::None)?));
        }
        Ok(Arc::new(Self {
            size,
            pages: Mutex::new(pages),
        }))
    }

    /// Build an LSA that shares an existing page list. Cloning the `Arc`s
    /// is what increments each page's reference count; no bytes move.
    pub fn with_pages(size: usize, pages: PageVec) -> Arc<Self> {
        debug_assert_eq!(pages.len(), size.div_ceil(page_size()));
        Arc::new(Self {
            size,
            pages: Mutex::new(pages),
        })
    }

    /// Logical capacity in bytes. Offsets `0..size` are valid.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of pages backing this LSA.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Clone the page list for structural sharing (the clone protocol).
    pub fn share_pages(&self) -> PageVec {
        self.pages.lock().clone()
    }

    /// The page-list lock. The engine holds it across each per-page
    /// access envelope so that a fork and a concurrent clone of this LSA
    /// cannot interleave.
    pub fn pages(&self) -> &Mutex<PageVec> {
        &self.pages
    }

    /// Base addresses of every page, for the fault-attribution snapshot.
    pub fn page_bases(&self, out: &mut Vec<usize>) {
        for page in self.pages.lock().iter() {
            out.push(page.base());
        }
    }
}
