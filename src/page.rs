use core::fmt;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::addr::{PAddr, PGSIZE};

/// The content of a 4096-byte physical page.
#[repr(align(4096))]
pub struct RawPage {
    inner: [u8; PGSIZE],
}

/// An owning handle to a physical page.
///
/// # Safety
///
/// - inner is 4096-byte aligned.
/// - At any moment, at most one `Page` refers to a given physical page.
///
/// A `Page` must be returned to the allocator (or deliberately leaked into a
/// page table, which takes over the ownership); silently dropping one loses
/// a physical page, so `drop` panics.
pub struct Page {
    inner: NonNull<RawPage>,
}

impl Page {
    /// Converts a raw address into a `Page`.
    ///
    /// # Safety
    ///
    /// - `addr` is the 4096-byte-aligned address of an unowned physical page.
    pub unsafe fn from_usize(addr: usize) -> Self {
        debug_assert!(addr % PGSIZE == 0, "Page::from_usize");
        Self {
            // SAFETY: a page's address is never zero.
            inner: unsafe { NonNull::new_unchecked(addr as *mut RawPage) },
        }
    }

    /// Consumes the handle, returning the page's address. The caller becomes
    /// responsible for the page.
    pub fn into_usize(self) -> usize {
        let addr = self.inner.as_ptr() as usize;
        core::mem::forget(self);
        addr
    }

    pub fn addr(&self) -> PAddr {
        PAddr::from(self.inner.as_ptr() as usize)
    }

    /// Fills the whole page with `value`.
    pub fn write_bytes(&mut self, value: u8) {
        // SAFETY: self refers to a valid page by the invariant.
        unsafe {
            core::ptr::write_bytes(self.inner.as_ptr(), value, 1);
        }
    }
}

impl Deref for Page {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        // SAFETY: self uniquely refers to a valid page by the invariant.
        unsafe { &self.inner.as_ref().inner }
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: self uniquely refers to a valid page by the invariant.
        unsafe { &mut self.inner.as_mut().inner }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({:p})", self.inner)
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        // In host tests a panicking drop would turn every unwinding
        // assertion into a double panic; leaking the page is enough there.
        #[cfg(not(test))]
        panic!("Page must never drop");
    }
}
