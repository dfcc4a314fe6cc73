//! # Fault Attribution
//!
//! A process-wide handler for SIGSEGV and SIGBUS that decides, for each
//! access violation, whether the faulting address is a live TLS page.
//!
//! If it is, some thread touched a storage-area page outside a sanctioned
//! access envelope (the pages rest at no-access precisely so this traps).
//! The process is healthy and only the offending thread is terminated.
//! Anything else is a genuine illegal access: the handler restores the
//! default disposition and returns, so the faulting instruction
//! re-executes and the process crashes exactly as it would have without
//! pagetls installed.
//!
//! ## Terminating one thread from signal context
//!
//! The offending thread is taken down with the raw `exit` syscall, which
//! terminates the calling thread only (`exit_group` is the one that ends
//! the process). `pthread_exit` cannot be used here: glibc implements it
//! as a forced unwind, and when that unwind reaches the `catch_unwind`
//! frame in Rust's thread entry shim, glibc aborts the entire process
//! with "FATAL: exception not rethrown". The raw syscall performs no
//! unwinding, and the kernel still clears the thread's TID futex on
//! exit, so `pthread_join` and `JoinHandle::join` observe the
//! termination normally.
//!
//! ## Signal-context constraints
//!
//! The handler allocates nothing, takes no locks, and calls only
//! async-signal-safe primitives. Attribution reads the directory's
//! atomically published snapshot ([`Directory::contains_page`]); the page
//! size and the global directory are both initialized eagerly in
//! [`install`], never from the handler.
//!
//! ## Installation
//!
//! Installed at most once per process, lazily, from the first `create`
//! or `clone_from`. SIGBUS is hooked alongside SIGSEGV because some
//! platforms report faults on mapped-but-inaccessible pages as SIGBUS.

use std::mem;
use std::ptr;
use std::sync::Once;

use crate::directory::Directory;
use crate::page::page_size;

static INSTALL: Once = Once::new();

type SigactionFn = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Install the access-violation handler. Idempotent.
pub(crate) fn install() {
    INSTALL.call_once(|| {
        // Both must exist before the first fault can arrive: the handler
        // is not allowed to run one-time initialization itself.
        page_size();
        Directory::global();

        let handler: SigactionFn = on_access_violation;

        // SAFETY: sa is fully initialized before sigaction reads it;
        // installing a process-wide handler is the documented use of
        // sigaction. The old disposition is discarded on purpose, the
        // not-ours path re-raises via SIG_DFL rather than chaining.
        unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = handler as *const () as usize;
            sa.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaction(libc::SIGSEGV, &sa, ptr::null_mut());
            libc::sigaction(libc::SIGBUS, &sa, ptr::null_mut());
        }
    });
}

extern "C" fn on_access_violation(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    // SAFETY: for SIGSEGV/SIGBUS delivered with SA_SIGINFO, info points
    // at a valid siginfo_t carrying the faulting address.
    let addr = unsafe { (*info).si_addr() } as usize;
    let base = addr & !(page_size() - 1);

    if let Some(dir) = Directory::try_global() {
        if dir.contains_page(base) {
            // A TLS page touched outside its envelope: take down only
            // the thread that did it. Its directory entry stays behind
            // until a supervisor destroys it.
            //
            // SAFETY: SYS_exit terminates the calling thread without
            // unwinding; no destructor or lock state is left behind that
            // this thread was allowed to hold while faulting on a
            // resting page.
            unsafe {
                libc::syscall(libc::SYS_exit, 0);
            }
            // SYS_exit does not return; falling through to the SIG_DFL
            // path below would crash the process, which is the only
            // remaining option anyway.
        }
    }

    // Not ours. Put the default disposition back and return; the kernel
    // re-executes the faulting instruction and delivers the default
    // fatal behavior.
    //
    // SAFETY: resetting a disposition to SIG_DFL is unconditionally
    // valid, and sigaction is async-signal-safe.
    unsafe {
        let mut dfl: libc::sigaction = mem::zeroed();
        dfl.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut dfl.sa_mask);
        libc::sigaction(signal, &dfl, ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn install_is_idempotent() {
        install();
        install();

        // The handler we installed is still in place after the second
        // call.
        // SAFETY: querying a disposition with a null new-action pointer
        // only reads.
        unsafe {
            let mut current: libc::sigaction = mem::zeroed();
            libc::sigaction(libc::SIGSEGV, ptr::null(), &mut current);
            let expected: SigactionFn = on_access_violation;
            assert_eq!(current.sa_sigaction, expected as *const () as usize);
        }
    }

    /// Set by the faulting routine only if it survives past the stray
    /// touch, which must never happen.
    static SURVIVED_THE_TOUCH: AtomicBool = AtomicBool::new(false);
    /// Base address of the page the routine faults on.
    static FAULTED_PAGE: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn touch_own_page_outside_envelope(_arg: *mut libc::c_void) -> *mut libc::c_void {
        crate::engine::create(64).unwrap();

        let lsa = Directory::global()
            .lookup(thread::current().id())
            .unwrap();
        let mut bases = Vec::new();
        lsa.page_bases(&mut bases);
        FAULTED_PAGE.store(bases[0], Ordering::SeqCst);

        // The page rests at no-access; touching it without an envelope
        // traps straight into the handler, which must end this thread
        // right here.
        // SAFETY: the address is a live mapping; the store never
        // retires because the thread is terminated by the handler.
        unsafe { ptr::write_volatile(bases[0] as *mut u8, 1) };

        SURVIVED_THE_TOUCH.store(true, Ordering::SeqCst);
        ptr::null_mut()
    }

    #[test]
    fn tls_fault_terminates_only_the_faulting_thread() {
        install();

        // Raw pthread rather than std::thread: the routine is killed
        // mid-flight, so there is no Rust return value to collect, and
        // pthread_join reports plain thread termination either way.
        // SAFETY: the thread routine is a valid extern "C" fn and the
        // join happens exactly once.
        unsafe {
            let mut tid: libc::pthread_t = mem::zeroed();
            let rc = libc::pthread_create(
                &mut tid,
                ptr::null(),
                touch_own_page_outside_envelope,
                ptr::null_mut(),
            );
            assert_eq!(rc, 0);
            assert_eq!(libc::pthread_join(tid, ptr::null_mut()), 0);
        }

        // The join returned, so this process survived the fault, and the
        // faulting thread never executed past the stray touch.
        assert!(!SURVIVED_THE_TOUCH.load(Ordering::SeqCst));

        // Known gap, asserted on purpose: the killed thread's area is
        // still registered and its page still attributed until a
        // supervisor destroys it.
        let page = FAULTED_PAGE.load(Ordering::SeqCst);
        assert_ne!(page, 0);
        assert!(Directory::global().contains_page(page));
    }
}
