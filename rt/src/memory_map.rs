use rustix::mm::{
    mmap_anonymous, mprotect, munmap, MapFlags, MprotectFlags, ProtFlags,
};
use rustix::param::page_size;
use std::io::{Error, Result as IoResult};
use std::ptr::null_mut;

pub(crate) fn multiple_of_page_size(size: usize) -> usize {
    let page = page_size();

    (size + (page - 1)) & !(page - 1)
}

fn mmap_options() -> MapFlags {
    let base = MapFlags::PRIVATE;

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    return base | MapFlags::STACK;

    #[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
    base
}

/// A chunk of memory created using `mmap`, used as stack memory.
pub(crate) struct MemoryMap {
    pub(crate) ptr: *mut u8,
    pub(crate) len: usize,
}

impl MemoryMap {
    /// Maps a region of at least `size` bytes, rounded up to the page size.
    pub(crate) fn stack(size: usize) -> IoResult<Self> {
        let len = multiple_of_page_size(size);
        let res = unsafe {
            mmap_anonymous(
                null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                mmap_options(),
            )
        };

        match res {
            Ok(ptr) => Ok(MemoryMap { ptr: ptr as *mut u8, len }),
            Err(e) => Err(Error::from_raw_os_error(e.raw_os_error())),
        }
    }

    /// Makes the page starting at the given offset inaccessible.
    pub(crate) fn protect(&mut self, start: usize) -> IoResult<()> {
        let res = unsafe {
            mprotect(
                self.ptr.add(start) as _,
                page_size(),
                MprotectFlags::empty(),
            )
        };

        res.map_err(|e| Error::from_raw_os_error(e.raw_os_error()))
    }
}

impl Drop for MemoryMap {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr as _, self.len);
        }
    }
}
