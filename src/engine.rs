//! # Operations and the Access Discipline
//!
//! The five public operations all act on behalf of the calling thread,
//! keyed by its [`std::thread::ThreadId`]:
//!
//! - [`create`] / [`destroy`]: lifecycle of the thread's storage area
//! - [`read`] / [`write`]: byte transfers under the access envelope
//! - [`clone_from`]: structural sharing of another thread's pages
//!
//! ## The access envelope
//!
//! Pages rest at no-access. Every transfer follows the same shape, one
//! page at a time:
//!
//! ```text
//! unprotect(page) ──► copy bytes ──► reprotect(page)
//! ```
//!
//! The window is bounded and contains no blocking call, because a page's
//! protection is process-visible: while one thread has a shared page
//! unprotected, every other thread mapping it could touch it too. On any
//! error the touched page is already back at no-access before the error
//! propagates (fail-safe closed).
//!
//! ## Copy-on-write fork
//!
//! A write that lands on a shared page (reference count above one) first
//! forks it: map a fresh writable page, seed it with the shared page's
//! entire current contents, repoint this LSA's slot, and drop the old
//! reference. The shared page goes straight back to no-access, since
//! other LSAs still map it. The fork runs under the LSA's page-list lock so a
//! concurrent clone cannot capture a half-installed slot; the directory
//! mutex is never held across any envelope.
//!
//! ## Lock ordering
//!
//! Directory mutex before any LSA page-list lock, everywhere. The fault
//! handler takes neither (it reads the directory's lock-free snapshot).

use std::sync::Arc;
use std::thread;

use crate::directory::Directory;
use crate::error::TlsError;
use crate::fault;
use crate::lsa::Lsa;
use crate::page::{page_size, Page, Prot};

/// Create a local storage area of `size` bytes for the calling thread.
///
/// The area reads as zeroes until written. Installs the fault handler on
/// first use anywhere in the process.
pub fn create(size: usize) -> Result<(), TlsError> {
    if size == 0 {
        return Err(TlsError::InvalidArgument);
    }
    fault::install();

    let tid = thread::current().id();
    let dir = Directory::global();
    if dir.lookup(tid).is_some() {
        return Err(TlsError::AlreadyExists);
    }

    let lsa = Lsa::new(size)?;
    dir.register(tid, lsa)
}

/// Destroy the calling thread's storage area.
///
/// Exclusively owned pages are unmapped; shared pages only lose one
/// reference and live on in the LSAs still holding them.
pub fn destroy() -> Result<(), TlsError> {
    let tid = thread::current().id();
    match Directory::global().remove(tid) {
        Some(lsa) => {
            // The snapshot was republished by remove(); dropping the LSA
            // here is what actually unmaps pages that hit zero.
            drop(lsa);
            Ok(())
        }
        None => Err(TlsError::NotFound),
    }
}

/// Read `out.len()` bytes starting at `offset` from the calling thread's
/// storage area into `out`.
pub fn read(offset: usize, out: &mut [u8]) -> Result<(), TlsError> {
    let tid = thread::current().id();
    let lsa = Directory::global().lookup(tid).ok_or(TlsError::NotFound)?;
    check_bounds(offset, out.len(), lsa.size())?;

    let ps = page_size();
    let mut cursor = 0;
    while cursor < out.len() {
        let abs = offset + cursor;
        let (idx, in_off) = (abs / ps, abs % ps);
        let chunk = (ps - in_off).min(out.len() - cursor);

        // Only the owning thread ever repoints this LSA's slots, so the
        // handle stays current after the lock is released.
        let page = Arc::clone(&lsa.pages().lock()[idx]);

        page.protect(Prot::Read);
        // SAFETY: the page is readable and in_off + chunk stays within
        // one page by construction of chunk.
        unsafe { page.read_bytes(in_off, &mut out[cursor..cursor + chunk]) };
        page.protect(Prot::None);

        cursor += chunk;
    }
    Ok(())
}

/// Write `data` into the calling thread's storage area starting at
/// `offset`, forking any page still shared with another thread.
pub fn write(offset: usize, data: &[u8]) -> Result<(), TlsError> {
    let tid = thread::current().id();
    let lsa = Directory::global().lookup(tid).ok_or(TlsError::NotFound)?;
    check_bounds(offset, data.len(), lsa.size())?;

    let ps = page_size();
    let mut retired: Vec<Arc<Page>> = Vec::new();
    let mut cursor = 0;
    while cursor < data.len() {
        let abs = offset + cursor;
        let (idx, in_off) = (abs / ps, abs % ps);
        let chunk = (ps - in_off).min(data.len() - cursor);

        // Held across the whole per-page envelope: a clone of this LSA
        // must either see the old shared page or the fully written new
        // one, never a half-installed slot.
        let mut pages = lsa.pages().lock();

        let target = if Arc::strong_count(&pages[idx]) > 1 {
            let (fresh, old) = fork_page(&mut pages[idx])?;
            retired.push(old);
            fresh
        } else {
            let page = Arc::clone(&pages[idx]);
            page.protect(Prot::ReadWrite);
            page
        };

        // SAFETY: target is writable, this thread holds the page-list
        // lock, and in_off + chunk stays within one page.
        unsafe { target.write_bytes(in_off, &data[cursor..cursor + chunk]) };
        target.protect(Prot::None);
        drop(pages);

        cursor += chunk;
    }

    if !retired.is_empty() {
        // New page bases enter the snapshot before the displaced
        // references go away: a racing destroy may have made this thread
        // a displaced page's last owner, and the page must leave the
        // snapshot before the drop below unmaps it.
        Directory::global().republish();
        drop(retired);
    }
    Ok(())
}

/// Fork `slot` in place: repoint it at a private copy of the shared page
/// it holds. Returns the new page, left writable for the caller's
/// transfer, and the displaced page.
///
/// The caller must keep the displaced reference alive until the snapshot
/// has been republished: if a concurrent destroy made the caller the
/// displaced page's last owner, dropping it earlier would unmap a page
/// the snapshot still lists, and a later fault on recycled address space
/// would be misattributed as a TLS fault.
fn fork_page(slot: &mut Arc<Page>) -> Result<(Arc<Page>, Arc<Page>), TlsError> {
    let old = Arc::clone(slot);
    let fresh = Arc::new(Page::map(Prot::ReadWrite)?);

    // Seed the private copy with the shared page's full current
    // contents, then put the shared page straight back to no-access.
    old.protect(Prot::Read);
    // SAFETY: fresh is read-write, old is readable, distinct mappings.
    unsafe { fresh.copy_page_from(&old) };
    old.protect(Prot::None);

    *slot = Arc::clone(&fresh);
    Ok((fresh, old))
}

/// Attach the calling thread to `target`'s storage area by reference.
///
/// No bytes are copied; both threads share the same pages until one of
/// them writes, at which point the writer forks its own copy.
pub fn clone_from(target: thread::ThreadId) -> Result<(), TlsError> {
    fault::install();

    let tid = thread::current().id();
    let dir = Directory::global();
    if dir.lookup(tid).is_some() {
        return Err(TlsError::AlreadyExists);
    }
    let source = dir.lookup(target).ok_or(TlsError::NotFound)?;

    let lsa = Lsa::with_pages(source.size(), source.share_pages());
    dir.register(tid, lsa)
}

/// Size of the calling thread's storage area, if it has one.
pub fn lsa_size() -> Option<usize> {
    let dir = Directory::try_global()?;
    dir.lookup(thread::current().id()).map(|lsa| lsa.size())
}

fn check_bounds(offset: usize, len: usize, size: usize) -> Result<(), TlsError> {
    let end = offset.checked_add(len).ok_or(TlsError::OutOfRange)?;
    if end > size {
        return Err(TlsError::OutOfRange);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Every test runs its operations on a dedicated thread so the global
    // directory entries of concurrently running tests cannot collide.
    fn on_thread<F: FnOnce() + Send + 'static>(f: F) {
        thread::spawn(f).join().unwrap();
    }

    #[test]
    fn bounds_check_rejects_overflowing_ranges() {
        assert_eq!(check_bounds(usize::MAX, 2, 100), Err(TlsError::OutOfRange));
        assert_eq!(check_bounds(50, 51, 100), Err(TlsError::OutOfRange));
        assert_eq!(check_bounds(50, 50, 100), Ok(()));
        assert_eq!(check_bounds(100, 0, 100), Ok(()));
    }

    #[test]
    fn create_rejects_zero_size() {
        on_thread(|| {
            assert_eq!(create(0), Err(TlsError::InvalidArgument));
        });
    }

    #[test]
    fn empty_transfers_succeed_without_touching_pages() {
        on_thread(|| {
            create(10).unwrap();
            write(10, &[]).unwrap();
            let mut out: [u8; 0] = [];
            read(10, &mut out).unwrap();
            destroy().unwrap();
        });
    }

    #[test]
    fn lsa_size_reports_the_requested_capacity() {
        on_thread(|| {
            assert_eq!(lsa_size(), None);
            create(777).unwrap();
            assert_eq!(lsa_size(), Some(777));
            destroy().unwrap();
            assert_eq!(lsa_size(), None);
        });
    }

    #[test]
    fn fork_keeps_the_displaced_page_alive_for_the_caller() {
        let lsa = Lsa::new(page_size()).unwrap();
        let mut pages = lsa.pages().lock();
        // A second owner, standing in for a clone on another thread.
        let sharer = Arc::clone(&pages[0]);
        let old_base = sharer.base();

        let (fresh, old) = fork_page(&mut pages[0]).unwrap();
        assert_eq!(old.base(), old_base);
        assert_eq!(fresh.base(), pages[0].base());
        assert_ne!(fresh.base(), old_base);

        // Even when the other owner disappears right after the fork, the
        // displaced page stays mapped through the returned reference, so
        // the caller can order the snapshot republish before the unmap.
        drop(sharer);
        assert_eq!(Arc::strong_count(&old), 1);
        fresh.protect(Prot::None);
    }

    #[test]
    fn forking_write_republishes_the_snapshot() {
        use std::sync::mpsc;

        let ps = page_size();
        let (tid_tx, tid_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let owner = thread::spawn(move || {
            create(ps).unwrap();
            write(0, &[0xAAu8; 64]).unwrap();
            tid_tx.send(thread::current().id()).unwrap();
            stop_rx.recv().unwrap();
            destroy().unwrap();
        });

        let owner_id = tid_rx.recv().unwrap();
        thread::spawn(move || {
            clone_from(owner_id).unwrap();
            write(0, &[0xBBu8; 64]).unwrap();

            let dir = Directory::global();

            // The fork repointed this area at a fresh page; the write
            // must have republished it into the attribution snapshot.
            let lsa = dir.lookup(thread::current().id()).unwrap();
            let mut mine = Vec::new();
            lsa.page_bases(&mut mine);
            assert!(mine.iter().all(|b| dir.contains_page(*b)));

            // The displaced page still belongs to the owner and stays
            // attributed.
            let owner_lsa = dir.lookup(owner_id).unwrap();
            let mut theirs = Vec::new();
            owner_lsa.page_bases(&mut theirs);
            assert_ne!(mine, theirs);
            assert!(theirs.iter().all(|b| dir.contains_page(*b)));

            destroy().unwrap();
        })
        .join()
        .unwrap();

        stop_tx.send(()).unwrap();
        owner.join().unwrap();
    }

    #[test]
    fn operations_without_an_lsa_fail_not_found() {
        on_thread(|| {
            let mut buf = [0u8; 4];
            assert_eq!(read(0, &mut buf), Err(TlsError::NotFound));
            assert_eq!(write(0, &buf), Err(TlsError::NotFound));
            assert_eq!(destroy(), Err(TlsError::NotFound));
        });
    }
}
