//! # Anonymous Page Mappings
//!
//! This module implements [`Page`], the unit of storage and sharing in
//! pagetls: a single OS-page-sized anonymous mapping with independently
//! switchable protection.
//!
//! ## Why one mapping per page?
//!
//! The engine shares storage between threads at page granularity and forks
//! individual pages on write. Mapping each logical page separately means:
//!
//! - A page can be repointed in one storage area without touching the
//!   mappings of its neighbours.
//! - `munmap` of a dead page cannot take live neighbours with it.
//! - Protection changes (`PROT_NONE` ↔ readable/writable) are naturally
//!   scoped to exactly the page being accessed.
//!
//! ## Resting state
//!
//! Pages rest at `PROT_NONE`. Any touch outside an access envelope raises
//! SIGSEGV, which is exactly the trap the fault-attribution handler keys
//! on (see [`crate::fault`]). `MAP_ANONYMOUS` guarantees fresh pages read
//! as zeroes once unprotected.
//!
//! ## Sharing
//!
//! Sharing is expressed as `Arc<Page>`: the strong count *is* the page's
//! reference count. A count of 1 means exactly one storage area owns the
//! page and may mutate it in place; a count above 1 means the page is
//! shared and must be forked before mutation. The mapping is released in
//! `Drop`, i.e. when the count reaches zero.

use std::ptr;
use std::sync::OnceLock;

use crate::error::TlsError;

/// Cached OS page size. Queried once, immutable thereafter.
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// The OS page size in bytes.
///
/// First call queries `sysconf(_SC_PAGESIZE)`; the fault handler relies on
/// this being initialized eagerly during handler installation so that it
/// never has to initialize it from signal context.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf takes no pointers and has no preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if raw > 0 {
            raw as usize
        } else {
            4096
        }
    })
}

/// Protection state of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prot {
    /// No access; the resting state of every page.
    None,
    /// Readable, for the read envelope and for seeding a fork.
    Read,
    /// Readable and writable, for the write envelope.
    ReadWrite,
}

impl Prot {
    fn flags(self) -> libc::c_int {
        match self {
            Prot::None => libc::PROT_NONE,
            Prot::Read => libc::PROT_READ,
            Prot::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// One page-sized anonymous mapping.
///
/// The raw base pointer is never handed out as a Rust reference; all byte
/// movement goes through the `unsafe` copy methods below, whose callers
/// hold the protection invariants described on each method.
#[derive(Debug)]
pub struct Page {
    base: *mut u8,
}

// SAFETY: Page is a handle to a process-wide mapping. All mutation goes
// through raw-pointer copies guarded by the engine's locking discipline;
// no &mut aliasing is ever created from the base pointer.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// Map a fresh anonymous zero-filled page with the given protection.
    pub fn map(prot: Prot) -> Result<Self, TlsError> {
        // SAFETY: a NULL-hinted MAP_PRIVATE|MAP_ANONYMOUS mapping of one
        // page cannot alias existing memory; the fd/offset arguments are
        // ignored for anonymous mappings.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                page_size(),
                prot.flags(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if base == libc::MAP_FAILED {
            return Err(TlsError::OutOfMemory);
        }

        Ok(Self {
            base: base as *mut u8,
        })
    }

    /// Base address of the mapping.
    pub fn base(&self) -> usize {
        self.base as usize
    }

    /// Switch the page's protection.
    ///
    /// A failed `mprotect` on a known-live mapping leaves the envelope in
    /// an unknowable state, so this aborts the process instead of
    /// returning an error the caller could not act on.
    pub fn protect(&self, prot: Prot) {
        // SAFETY: base points at a live mapping of exactly page_size()
        // bytes owned by this Page; mprotect on it cannot touch any other
        // mapping.
        let rc = unsafe { libc::mprotect(self.base as *mut libc::c_void, page_size(), prot.flags()) };
        if rc != 0 {
            eprintln!("pagetls: mprotect failed on live page, aborting");
            std::process::abort();
        }
    }

    /// Copy `src` into the page starting at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must have relaxed this page to [`Prot::ReadWrite`],
    /// `offset + src.len()` must not exceed the page size, and no other
    /// thread may be copying into the same page (the engine guarantees
    /// this by holding the owning storage area's lock).
    pub unsafe fn write_bytes(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= page_size());
        // SAFETY: bounds are the caller's contract; src is a live slice
        // and cannot overlap an anonymous mapping it does not point into.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len()) }
    }

    /// Copy bytes starting at `offset` out of the page into `dst`.
    ///
    /// # Safety
    ///
    /// The caller must have relaxed this page to at least [`Prot::Read`]
    /// and `offset + dst.len()` must not exceed the page size.
    pub unsafe fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() <= page_size());
        // SAFETY: bounds are the caller's contract; dst is a live slice
        // disjoint from the mapping.
        unsafe { ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len()) }
    }

    /// Seed this page's full contents from `other`.
    ///
    /// Used once per fork: the new private page must start as an exact
    /// copy of the shared page it replaces.
    ///
    /// # Safety
    ///
    /// `self` must be [`Prot::ReadWrite`], `other` at least
    /// [`Prot::Read`], and the two pages must be distinct mappings.
    pub unsafe fn copy_page_from(&self, other: &Page) {
        debug_assert_ne!(self.base, other.base);
        // SAFETY: both mappings are page_size() bytes and distinct, so
        // the ranges cannot overlap.
        unsafe { ptr::copy_nonoverlapping(other.base, self.base, page_size()) }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        // SAFETY: base was returned by mmap for exactly page_size() bytes
        // and is unmapped exactly once. munmap failure on a valid mapping
        // is not actionable during drop.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, page_size());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert!(ps.is_power_of_two());
        assert_eq!(ps, page_size());
    }

    #[test]
    fn fresh_page_reads_as_zeroes() {
        let page = Page::map(Prot::Read).unwrap();
        let mut buf = vec![0xFFu8; 64];
        // SAFETY: page is readable and buf fits in one page.
        unsafe { page.read_bytes(0, &mut buf) };
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_round_trips() {
        let page = Page::map(Prot::ReadWrite).unwrap();
        let data = [0xDE, 0xAD, 0xBE, 0xEF];
        let mut out = [0u8; 4];
        // SAFETY: page is read-write; offsets stay within the page.
        unsafe {
            page.write_bytes(100, &data);
            page.read_bytes(100, &mut out);
        }
        assert_eq!(out, data);
    }

    #[test]
    fn fork_seed_copies_whole_page() {
        let old = Page::map(Prot::ReadWrite).unwrap();
        let pattern = [0xABu8; 32];
        // SAFETY: both pages read-write, offsets in bounds, distinct maps.
        unsafe {
            old.write_bytes(0, &pattern);
            old.write_bytes(page_size() - 32, &pattern);

            let fresh = Page::map(Prot::ReadWrite).unwrap();
            fresh.copy_page_from(&old);

            let mut head = [0u8; 32];
            let mut tail = [0u8; 32];
            fresh.read_bytes(0, &mut head);
            fresh.read_bytes(page_size() - 32, &mut tail);
            assert_eq!(head, pattern);
            assert_eq!(tail, pattern);
        }
    }

    #[test]
    fn distinct_pages_have_distinct_bases() {
        let a = Page::map(Prot::None).unwrap();
        let b = Page::map(Prot::None).unwrap();
        assert_ne!(a.base(), b.base());
        assert_eq!(a.base() % page_size(), 0);
    }

    #[test]
    fn reprotect_cycle_does_not_disturb_contents() {
        let page = Page::map(Prot::ReadWrite).unwrap();
        let data = [7u8; 16];
        // SAFETY: protection is relaxed around every copy.
        unsafe {
            page.write_bytes(0, &data);
            page.protect(Prot::None);
            page.protect(Prot::Read);
            let mut out = [0u8; 16];
            page.read_bytes(0, &mut out);
            assert_eq!(out, data);
        }
    }
}
