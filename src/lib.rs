//! # pagetls - Page-Granular Copy-on-Write Thread-Local Storage
//!
//! pagetls implements user-level thread-local storage from virtual-memory
//! primitives alone: anonymous mappings, protection flags, and fault
//! signaling. No compiler or runtime TLS support is involved.
//!
//! Each thread may create one **local storage area** (LSA), a fixed-size
//! byte region backed by individually mapped OS pages. LSAs can be cloned
//! across threads: the clone shares the original's pages by reference,
//! and the first write to a shared page transparently forks a private
//! copy for the writer (copy-on-write).
//!
//! ## Quick Start
//!
//! ```ignore
//! use pagetls::{create, destroy, read, write};
//!
//! create(4096)?;
//! write(0, b"hello")?;
//!
//! let mut buf = [0u8; 5];
//! read(0, &mut buf)?;
//! assert_eq!(&buf, b"hello");
//!
//! destroy()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  Operations (create/read/write/clone/...)    │
//! ├─────────────────────────────────────────────┤
//! │  Access Discipline (unprotect→copy→protect)  │
//! │  + Copy-on-Write Fork                        │
//! ├──────────────────────┬──────────────────────┤
//! │  Directory           │  Fault Attribution    │
//! │  (tid → LSA map,     │  (SIGSEGV/SIGBUS →    │
//! │   page snapshot)     │   kill thread / crash)│
//! ├──────────────────────┴──────────────────────┤
//! │  LSA (ordered page list, logical size)       │
//! ├─────────────────────────────────────────────┤
//! │  Page (anonymous mapping, PROT_NONE at rest) │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Protection model
//!
//! Pages rest at no-access. Every read or write opens a short envelope:
//! relax protection on the touched page, move the bytes, restore
//! no-access. A touch outside such an envelope traps, and the installed
//! fault handler attributes the trap: a live TLS page terminates only the
//! offending thread, anything else crashes the process the default way.
//!
//! ## Sharing model
//!
//! `clone_from(target)` copies page *references*, not bytes. Every shared
//! page carries an atomic reference count (its `Arc` strong count); a
//! write to a page with count above one first duplicates the page's full
//! current contents into a private replacement, so the writer diverges
//! while every other owner keeps reading the original bytes.
//!
//! ## Module Overview
//!
//! - [`page`]: anonymous page mappings and protection control
//! - [`lsa`]: the per-thread storage area (ordered page list)
//! - [`directory`]: thread → LSA map and the fault-attribution snapshot
//! - [`engine`]: the public operations and the access discipline
//! - `fault`: SIGSEGV/SIGBUS handler and fault attribution
//!
//! ## Known gap
//!
//! A thread terminated by the fault handler leaves its directory entry
//! (and page references) behind; reclaiming it requires an explicit
//! `destroy` by a supervising mechanism.

pub mod directory;
pub mod engine;
pub mod error;
mod fault;
pub mod lsa;
pub mod page;

pub use engine::{clone_from, create, destroy, lsa_size, read, write};
pub use error::TlsError;
