//! Contract linear memory.
//!
//! Address space for the declared maximum is reserved when the memory is
//! created, so the base pointer stays stable across `memory.grow`; grown
//! pages are committed in place. The JITted code receives the base in a
//! pinned register and the current size through the context header, and
//! both are refreshed after every host upcall.

use anyhow::{bail, Result};
use more_asserts::assert_le;
use std::ptr;
use std::slice;

/// Bytes per WebAssembly page.
pub const WASM_PAGE_SIZE: usize = 0x10000;

/// Hard cap on addressable pages (a full 32-bit index space).
pub const MAX_MEMORY_PAGES: u32 = 0x10000;

/// A growable, page-granular byte region backing one module instance.
#[derive(Debug)]
pub struct LinearMemory {
    base: *mut u8,
    /// Committed (accessible) size in bytes.
    size: usize,
    /// Reserved size in bytes; `size` never exceeds it.
    reserved: usize,
    maximum_pages: u32,
}

impl LinearMemory {
    /// Create a memory of `initial` pages, reserving space for `maximum`
    /// pages (or the addressable cap when absent).
    pub fn new(initial: u32, maximum: Option<u32>) -> Result<Self> {
        let maximum_pages = maximum.unwrap_or(MAX_MEMORY_PAGES).min(MAX_MEMORY_PAGES);
        if initial > maximum_pages {
            bail!(
                "initial memory of {} pages exceeds the maximum of {}",
                initial,
                maximum_pages
            );
        }
        let reserved = maximum_pages as usize * WASM_PAGE_SIZE;
        let size = initial as usize * WASM_PAGE_SIZE;
        // A zero-size reservation is legal but mmap dislikes it.
        let reserved = reserved.max(WASM_PAGE_SIZE);
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                reserved,
                libc::PROT_NONE,
                libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            bail!(
                "mmap failed to reserve {:#x} bytes of linear memory: {}",
                reserved,
                std::io::Error::last_os_error()
            );
        }
        let mut memory = Self {
            base: base as *mut u8,
            size: 0,
            reserved,
            maximum_pages,
        };
        if size != 0 {
            memory.commit(size)?;
        }
        Ok(memory)
    }

    fn commit(&mut self, new_size: usize) -> Result<()> {
        assert_le!(self.size, new_size);
        assert_le!(new_size, self.reserved);
        let rc = unsafe {
            libc::mprotect(
                self.base.add(self.size) as *mut libc::c_void,
                new_size - self.size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            bail!(
                "mprotect failed to commit linear memory: {}",
                std::io::Error::last_os_error()
            );
        }
        self.size = new_size;
        Ok(())
    }

    /// Current size in pages.
    pub fn pages(&self) -> u32 {
        (self.size / WASM_PAGE_SIZE) as u32
    }

    /// Current size in bytes; always a multiple of the page size.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Grow by `delta` pages. Returns the previous page count, or `None`
    /// when the limit is exceeded (the Wasm-level `-1`).
    pub fn grow(&mut self, delta: u32) -> Option<u32> {
        let old_pages = self.pages();
        let new_pages = old_pages.checked_add(delta)?;
        if new_pages > self.maximum_pages {
            return None;
        }
        if delta != 0 {
            self.commit(new_pages as usize * WASM_PAGE_SIZE).ok()?;
        }
        Some(old_pages)
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.base, self.size) }
    }
}

impl Drop for LinearMemory {
    fn drop(&mut self) {
        unsafe {
            let rc = libc::munmap(self.base as *mut libc::c_void, self.reserved);
            debug_assert_eq!(rc, 0, "munmap of linear memory failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_is_stable_across_grow() {
        let mut memory = LinearMemory::new(1, Some(4)).unwrap();
        let base = memory.base();
        memory.as_mut_slice()[0xffff] = 0xaa;
        assert_eq!(memory.grow(2), Some(1));
        assert_eq!(memory.base(), base);
        assert_eq!(memory.pages(), 3);
        assert_eq!(memory.as_slice()[0xffff], 0xaa);
        assert_eq!(memory.grow(2), None);
        assert_eq!(memory.pages(), 3);
    }

    #[test]
    fn zero_page_memory() {
        let memory = LinearMemory::new(0, None).unwrap();
        assert_eq!(memory.pages(), 0);
        assert!(memory.as_slice().is_empty());
    }
}
