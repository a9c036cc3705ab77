//! Unix page primitives: `mmap`/`mprotect`/`munmap` plus a `SIGSEGV`
//! handler that converts write faults on protected pages into
//! parent-tracking events, grounded on
//! `original_source/platform/unix/colUnixPlatform.c`.

use std::io;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

pub(super) fn alloc_granularity() -> usize {
    // Unix reservation granularity is the system page size itself;
    // there is no separate "allocation granularity" as on Windows.
    page_size::get()
}

pub(super) fn reserve(size: usize, commit: bool) -> io::Result<usize> {
    let prot = if commit {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_NONE
    };
    // MAP_NORESERVE: don't reserve swap for pages we may never touch,
    // matching the reference implementation's sparse-commit strategy.
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    let ptr = unsafe { libc::mmap(ptr::null_mut(), size, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as usize)
}

pub(super) fn release(addr: usize, size: usize) -> io::Result<()> {
    let rc = unsafe { libc::munmap(addr as *mut libc::c_void, size) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(super) fn commit(addr: usize, size: usize) -> io::Result<()> {
    let rc = unsafe {
        libc::mprotect(
            addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(super) fn decommit(addr: usize, size: usize) -> io::Result<()> {
    // madvise(MADV_DONTNEED) lets the kernel drop the backing pages
    // while keeping the mapping (and its protection) intact, matching
    // the reference implementation's decommit semantics.
    unsafe {
        libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_NONE);
        libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED);
    }
    Ok(())
}

pub(super) fn protect(addr: usize, size: usize, protect: bool) -> io::Result<()> {
    let prot = if protect {
        libc::PROT_READ
    } else {
        libc::PROT_READ | libc::PROT_WRITE
    };
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, size, prot) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

static PREVIOUS_HANDLER: AtomicPtr<libc::sigaction> = AtomicPtr::new(ptr::null_mut());

extern "C" fn page_protect_sigaction(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    // Only a write access-violation on a page we protected ourselves is
    // ours to handle; anything else (a genuine segfault, a read fault)
    // is forwarded to whatever handler was previously installed.
    let is_ours = unsafe {
        if signo != libc::SIGSEGV || info.is_null() {
            false
        } else {
            let code = (*info).si_code;
            code == libc::SEGV_ACCERR
        }
    };

    if is_ours {
        let fault_addr = unsafe { (*info).si_addr() as usize };
        let page_size = page_size::get();
        let page_addr = fault_addr & !(page_size - 1);
        if super::dispatch_fault(page_addr) {
            return; // protection cleared, the faulting store will retry.
        }
    }

    chain_to_previous(signo, info, ctx);
}

fn chain_to_previous(signo: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let prev = PREVIOUS_HANDLER.load(Ordering::SeqCst);
    if prev.is_null() {
        unsafe {
            libc::signal(signo, libc::SIG_DFL);
            libc::raise(signo);
        }
        return;
    }
    unsafe {
        let prev = &*prev;
        if prev.sa_flags & libc::SA_SIGINFO != 0 {
            let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                std::mem::transmute(prev.sa_sigaction);
            handler(signo, info, ctx);
        } else if prev.sa_sigaction != libc::SIG_DFL && prev.sa_sigaction != libc::SIG_IGN {
            let handler: extern "C" fn(libc::c_int) = std::mem::transmute(prev.sa_sigaction);
            handler(signo);
        } else {
            libc::signal(signo, libc::SIG_DFL);
            libc::raise(signo);
        }
    }
}

pub(super) fn install_handler() {
    unsafe {
        let mut sa: libc::sigaction = MaybeUninit::zeroed().assume_init();
        sa.sa_sigaction = page_protect_sigaction as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);

        let mut old: libc::sigaction = MaybeUninit::zeroed().assume_init();
        if libc::sigaction(libc::SIGSEGV, &sa, &mut old) == 0 {
            let boxed = Box::new(old);
            PREVIOUS_HANDLER.store(Box::into_raw(boxed), Ordering::SeqCst);
        }
    }
}
