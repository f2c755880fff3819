//! Append-only executable memory for JITted code.
//!
//! The arena hands out contiguous writable byte ranges while a segment is
//! open, then seals the segment read+execute. Address space for the whole
//! arena is reserved up front so emitted code never moves; pages are
//! committed lazily as allocations advance.

use anyhow::{bail, Context, Result};
use more_asserts::assert_le;
use std::ptr;

/// Opaque marker for an open segment, returned by [`CodeArena::start_code`].
#[derive(Debug)]
pub struct SegmentHandle {
    base: usize,
}

/// An append-only writable region that becomes executable on seal.
///
/// Three positions are tracked: the base of the current segment, the
/// write cursor, and the hard end of the most recent allocation. Between
/// `start_code` and `end_code` the segment is writable and not
/// executable; after `end_code(.., true)` it is executable and not
/// writable.
#[derive(Debug)]
pub struct CodeArena {
    base: *mut u8,
    /// Reserved address-space size.
    capacity: usize,
    /// Bytes committed read+write so far.
    committed: usize,
    /// Next byte to hand out.
    cursor: usize,
    /// Upper bound reserved by the last `alloc`.
    hard_end: usize,
    segment_open: bool,
    sealed: bool,
}

impl CodeArena {
    /// Reserve `capacity` bytes of address space for code.
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = region::page::ceil(capacity);
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_NONE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            bail!(
                "mmap failed to reserve {:#x} bytes for the code arena: {}",
                capacity,
                std::io::Error::last_os_error()
            );
        }
        Ok(Self {
            base: base as *mut u8,
            capacity,
            committed: 0,
            cursor: 0,
            hard_end: 0,
            segment_open: false,
            sealed: false,
        })
    }

    /// Record the current position as the base of a new executable
    /// segment.
    pub fn start_code(&mut self) -> SegmentHandle {
        assert!(!self.segment_open, "a code segment is already open");
        assert!(!self.sealed, "arena already sealed");
        self.segment_open = true;
        SegmentHandle { base: self.cursor }
    }

    /// Reserve `n` contiguous bytes within the open segment and return a
    /// writable pointer to them. The reservation may overestimate; unused
    /// tail bytes are returned with [`reclaim`](Self::reclaim).
    pub fn alloc(&mut self, n: usize) -> Result<*mut u8> {
        assert!(self.segment_open, "alloc outside of an open segment");
        let start = self.cursor;
        let end = start
            .checked_add(n)
            .context("code arena allocation overflow")?;
        if end > self.capacity {
            bail!(
                "code arena exhausted: need {:#x} bytes, reserved {:#x}",
                end,
                self.capacity
            );
        }
        if end > self.committed {
            let new_committed = region::page::ceil(end);
            let rc = unsafe {
                libc::mprotect(
                    self.base.add(self.committed) as *mut libc::c_void,
                    new_committed - self.committed,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            if rc != 0 {
                bail!(
                    "mprotect failed to commit code arena pages: {}",
                    std::io::Error::last_os_error()
                );
            }
            self.committed = new_committed;
        }
        self.cursor = end;
        self.hard_end = end;
        Ok(unsafe { self.base.add(start) })
    }

    /// Return `n` unwritten bytes at the tail of the most recent `alloc`
    /// to the free pool.
    pub fn reclaim(&mut self, ptr: *mut u8, n: usize) {
        let offset = ptr as usize - self.base as usize;
        assert_eq!(
            offset + n,
            self.hard_end,
            "reclaim must return the tail of the last allocation"
        );
        assert_le!(offset, self.cursor);
        self.cursor = offset;
        self.hard_end = offset;
    }

    /// Seal `[segment_base, write_cursor)`. With `executable` the range
    /// is remapped read+execute; a failure to seal is fatal because the
    /// caller holds jump targets into the segment.
    pub fn end_code(&mut self, handle: SegmentHandle, executable: bool) {
        assert!(self.segment_open, "no open segment to seal");
        self.segment_open = false;
        if !executable || self.cursor == handle.base {
            return;
        }
        let start = region::page::floor(self.base as usize + handle.base);
        let len = self.base as usize + self.cursor - start;
        unsafe {
            region::protect(start as *const u8, len, region::Protection::READ_EXECUTE)
                .expect("failed to seal code segment read+execute");
        }
        self.sealed = true;
    }

    /// Base address of the reservation.
    pub fn base(&self) -> *const u8 {
        self.base
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        unsafe {
            let rc = libc::munmap(self.base as *mut libc::c_void, self.capacity);
            debug_assert_eq!(rc, 0, "munmap of code arena failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_reclaim_accounting() {
        let mut arena = CodeArena::new(1 << 20).unwrap();
        let seg = arena.start_code();
        let p = arena.alloc(1000).unwrap();
        assert_eq!(arena.len(), 1000);
        unsafe {
            ptr::write_bytes(p, 0xc3, 600);
        }
        arena.reclaim(unsafe { p.add(600) }, 400);
        assert_eq!(arena.len(), 600);
        let q = arena.alloc(16).unwrap();
        assert_eq!(q as usize - p as usize, 600);
        arena.reclaim(q, 16);
        arena.end_code(seg, true);
    }

    #[test]
    fn sealed_segment_is_executable() {
        let mut arena = CodeArena::new(1 << 16).unwrap();
        let seg = arena.start_code();
        let p = arena.alloc(16).unwrap();
        // mov eax, 7; ret
        unsafe {
            p.copy_from(
                [0xb8, 0x07, 0x00, 0x00, 0x00, 0xc3].as_ptr(),
                6,
            );
        }
        arena.reclaim(unsafe { p.add(6) }, 10);
        arena.end_code(seg, true);
        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(p) };
        assert_eq!(f(), 7);
    }
}
