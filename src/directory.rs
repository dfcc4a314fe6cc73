//! # Thread → LSA Directory
//!
//! The directory maps each thread identifier to its local storage area
//! and enforces at-most-one-LSA-per-thread. Keys are opaque
//! [`std::thread::ThreadId`]s in a growable hash map rather than raw
//! numeric ids indexing a fixed table, so identifier values carry no
//! assumptions about range or density.
//!
//! ## Two read paths
//!
//! Normal operations (`register`, `lookup`, `remove`) serialize on one
//! mutex. The fault handler cannot use that path: it runs in signal
//! context, where blocking on a lock another thread holds mid-mutation
//! would hang the process. It instead consults a **snapshot**: an
//! immutable sorted slice of every live page base address, swapped in
//! atomically after each mutation of the live page set.
//!
//! ## Snapshot retirement
//!
//! Superseded snapshots are intentionally never freed: a signal handler
//! may still be walking one, and there is no signal-safe way to know when
//! it has finished. The leak is bounded by the number of directory
//! mutations (create / clone / destroy / fork), each retiring one small
//! slice.
//!
//! ## Ordering
//!
//! The snapshot is republished *before* `remove` returns the detached
//! LSA, so by the time the caller drops the last reference to a page and
//! unmaps it, the snapshot no longer lists that page. A fault on a freshly
//! unmapped address is therefore attributed as external (fatal), not as a
//! TLS fault, matching what actually happened.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::TlsError;
use crate::lsa::Lsa;

/// Immutable view of the live page set, readable from signal context.
struct Snapshot {
    bases: Box<[usize]>,
}

/// The thread → LSA map plus its fault-attribution snapshot.
pub struct Directory {
    entries: Mutex<HashMap<ThreadId, Arc<Lsa>>>,
    /// Latest published snapshot; null until the first registration.
    /// Superseded snapshots are leaked, see the module docs.
    snapshot: AtomicPtr<Snapshot>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            snapshot: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// The process-wide directory, if it has been created.
    ///
    /// Returns `None` rather than initializing so that signal context can
    /// call it without risking a blocking one-time init.
    pub(crate) fn try_global() -> Option<&'static Directory> {
        GLOBAL.get()
    }

    /// The process-wide directory, creating it on first use.
    pub(crate) fn global() -> &'static Directory {
        GLOBAL.get_or_init(Directory::new)
    }

    /// Register `lsa` under `tid`. Fails if the thread already has one.
    pub fn register(&self, tid: ThreadId, lsa: Arc<Lsa>) -> Result<(), TlsError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&tid) {
            return Err(TlsError::AlreadyExists);
        }
        entries.insert(tid, lsa);
        self.publish(&entries);
        Ok(())
    }

    /// Fetch a handle to `tid`'s LSA.
    pub fn lookup(&self, tid: ThreadId) -> Option<Arc<Lsa>> {
        self.entries.lock().get(&tid).cloned()
    }

    /// Atomically detach and return `tid`'s LSA.
    ///
    /// The snapshot is republished before the entry is handed back, so
    /// any page the caller ends up unmapping is already out of the
    /// attribution set.
    pub fn remove(&self, tid: ThreadId) -> Option<Arc<Lsa>> {
        let mut entries = self.entries.lock();
        let lsa = entries.remove(&tid)?;
        self.publish(&entries);
        Some(lsa)
    }

    /// Rebuild the snapshot from the current entries. Called by the
    /// engine after a fork changes a page base without touching the map.
    pub fn republish(&self) {
        let entries = self.entries.lock();
        self.publish(&entries);
    }

    fn publish(&self, entries: &HashMap<ThreadId, Arc<Lsa>>) {
        let mut bases = Vec::new();
        for lsa in entries.values() {
            lsa.page_bases(&mut bases);
        }
        bases.sort_unstable();
        bases.dedup();

        let fresh = Box::into_raw(Box::new(Snapshot {
            bases: bases.into_boxed_slice(),
        }));
        // The previous snapshot stays allocated; a signal handler on
        // another thread may still hold its pointer.
        self.snapshot.store(fresh, Ordering::Release);
    }

    /// Whether `base` is a live TLS page base address.
    ///
    /// Lock-free and allocation-free: safe to call from signal context.
    pub fn contains_page(&self, base: usize) -> bool {
        let snap = self.snapshot.load(Ordering::Acquire);
        if snap.is_null() {
            return false;
        }
        // SAFETY: published snapshots are never freed, so the pointer
        // remains valid for the life of the process.
        let bases = unsafe { &(*snap).bases };
        bases.binary_search(&base).is_ok()
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: OnceLock<Directory> = OnceLock::new();
