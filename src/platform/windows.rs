//! Windows page primitives: `VirtualAlloc`/`VirtualProtect`/`VirtualFree`
//! plus a vectored exception handler that converts write faults on
//! protected pages into parent-tracking events, grounded on
//! `original_source/platform/win32/colWin32Platform.c`.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use windows_sys::Win32::Foundation::EXCEPTION_ACCESS_VIOLATION;
use windows_sys::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, EXCEPTION_CONTINUE_EXECUTION, EXCEPTION_CONTINUE_SEARCH,
    EXCEPTION_POINTERS,
};
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
};

pub(super) fn alloc_granularity() -> usize {
    // Windows reserves address space in units of `dwAllocationGranularity`
    // (typically 64 KiB), coarser than `dwPageSize`.
    65536
}

pub(super) fn reserve(size: usize, commit: bool) -> io::Result<usize> {
    let flags = if commit {
        MEM_RESERVE | MEM_COMMIT
    } else {
        MEM_RESERVE
    };
    let protect = if commit { PAGE_READWRITE } else { PAGE_NOACCESS };
    let ptr = unsafe { VirtualAlloc(std::ptr::null(), size, flags, protect) };
    if ptr.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as usize)
}

pub(super) fn release(addr: usize, _size: usize) -> io::Result<()> {
    let ok = unsafe { VirtualFree(addr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(super) fn commit(addr: usize, size: usize) -> io::Result<()> {
    let ptr = unsafe { VirtualAlloc(addr as *const _, size, MEM_COMMIT, PAGE_READWRITE) };
    if ptr.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(super) fn decommit(addr: usize, size: usize) -> io::Result<()> {
    let ok = unsafe { VirtualFree(addr as *mut _, size, MEM_DECOMMIT) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(super) fn protect(addr: usize, size: usize, protect: bool) -> io::Result<()> {
    let new_protect = if protect { PAGE_READONLY } else { PAGE_READWRITE };
    let mut old_protect: u32 = 0;
    let ok = unsafe { VirtualProtect(addr as *const _, size, new_protect, &mut old_protect) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

static HANDLE: AtomicUsize = AtomicUsize::new(0);

unsafe extern "system" fn page_protect_vectored_handler(info: *mut EXCEPTION_POINTERS) -> i32 {
    let record = &*(*info).ExceptionRecord;
    if record.ExceptionCode != EXCEPTION_ACCESS_VIOLATION {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    // ExceptionInformation[0] == 1 means the faulting access was a
    // write; ExceptionInformation[1] is the faulting virtual address.
    let is_write = record.ExceptionInformation[0] == 1;
    let fault_addr = record.ExceptionInformation[1] as usize;
    if is_write {
        let page_size = page_size::get();
        let page_addr = fault_addr & !(page_size - 1);
        if super::dispatch_fault(page_addr) {
            return EXCEPTION_CONTINUE_EXECUTION;
        }
    }
    EXCEPTION_CONTINUE_SEARCH
}

pub(super) fn install_handler() {
    let handle = unsafe { AddVectoredExceptionHandler(1, Some(page_protect_vectored_handler)) };
    HANDLE.store(handle as usize, Ordering::SeqCst);
}
