//! Physical memory allocator, for user processes, kernel stacks,
//! page-table pages, and pipe buffers. Allocates whole 4096-byte pages.
//!
//! Each CPU owns a freelist, so that in the common case allocation and
//! freeing touch no shared cache line. A CPU whose list is empty steals
//! from its peers, one peer lock at a time, so stealing cannot deadlock.

use core::ptr;

use array_macro::array;

use crate::{
    addr::{pgrounddown, pgroundup, Addr, PGSIZE},
    cpu::{pop_off, push_off},
    lock::Spinlock,
    page::Page,
    param::NCPU,
};

struct Run {
    next: *mut Run,
}

/// # Safety
///
/// - This singly linked list does not have a cycle.
/// - If head is null, then it is an empty list. Otherwise, it is nonempty,
///   and head is its first element, which is a valid page.
struct Freelist {
    head: *mut Run,
}

// SAFETY: the pages linked from `head` are owned by the list, and the list
// is only reached through its `Spinlock`.
unsafe impl Send for Freelist {}

impl Freelist {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    fn push(&mut self, pa: usize) {
        let r = pa as *mut Run;
        // SAFETY: the page is owned by the caller and becomes owned by the
        // list; writing the link into its first word cannot create a cycle.
        unsafe { (*r).next = self.head };
        self.head = r;
    }

    fn pop(&mut self) -> Option<usize> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: head is not null, so by the invariant it is a valid page.
        let next = unsafe { (*self.head).next };
        Some(core::mem::replace(&mut self.head, next) as usize)
    }

    fn len(&self) -> usize {
        let mut n = 0;
        let mut p = self.head;
        while !p.is_null() {
            n += 1;
            // SAFETY: the list is acyclic and every node is a valid page.
            p = unsafe { (*p).next };
        }
        n
    }
}

/// The physical page allocator.
pub struct Kmem {
    lists: [Spinlock<Freelist>; NCPU],

    /// The range of physical memory this allocator governs.
    /// Written once by `init` before any other CPU runs.
    start: usize,
    end: usize,
}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            lists: array![_ => Spinlock::new("kmem", Freelist::new()); NCPU],
            start: 0,
            end: 0,
        }
    }

    /// Hands every page in `[start, end)` to the current CPU's freelist.
    ///
    /// # Safety
    ///
    /// - The range must be unused physical memory, and must not overlap
    ///   pages given to any allocator before.
    /// - Must be called exactly once, before any other CPU allocates.
    pub unsafe fn init(&mut self, start: usize, end: usize) {
        self.start = pgroundup(start);
        self.end = pgrounddown(end);
        for pa in num_iter::range_step(self.start, self.end, PGSIZE) {
            // SAFETY: pa is aligned, inside [start, end), and not yet owned
            // by any freelist.
            self.free(unsafe { Page::from_usize(pa) });
        }
    }

    /// Returns the page to the current CPU's freelist.
    /// The page is poisoned to catch dangling references.
    pub fn free(&self, mut page: Page) {
        let pa = page.addr().into_usize();
        assert!(
            pa % PGSIZE == 0 && (self.start..self.end).contains(&pa),
            "Kmem::free"
        );

        // Fill with junk to catch dangling refs.
        page.write_bytes(1);

        // The cpu id is only meaningful while interrupts are off; otherwise
        // this thread could migrate and push onto another CPU's list without
        // holding its lock.
        push_off();
        let id = crate::arch::cpu_id();
        self.lists[id].lock().push(page.into_usize());
        pop_off();
    }

    /// Allocates a 4096-byte page, poisoned with junk.
    /// Returns `None` only if every CPU's freelist is empty.
    pub fn alloc(&self) -> Option<Page> {
        push_off();
        let id = crate::arch::cpu_id();
        let mut pa = self.lists[id].lock().pop();
        pop_off();

        // Our list is empty; steal from the other CPUs, holding only one
        // peer lock at a time.
        if pa.is_none() {
            for (i, list) in self.lists.iter().enumerate() {
                if i == id {
                    continue;
                }
                pa = list.lock().pop();
                if pa.is_some() {
                    break;
                }
            }
        }

        // SAFETY: the address was popped from a freelist, so it is an
        // aligned, unowned page in [start, end).
        let mut page = unsafe { Page::from_usize(pa?) };
        page.write_bytes(5); // fill with junk
        Some(page)
    }

    /// Total number of free pages, across every CPU's list.
    pub fn free_pages(&self) -> usize {
        self.lists.iter().map(|list| list.lock().len()).sum()
    }

    #[cfg(test)]
    fn list_len(&self, i: usize) -> usize {
        self.lists[i].lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::boxed::Box;
    use std::sync::Arc;
    use std::vec::Vec;

    use super::*;
    use crate::arch;

    /// A leaked, page-aligned arena standing in for [end, PHYSTOP).
    fn arena(pages: usize) -> (usize, usize) {
        let layout = std::alloc::Layout::from_size_align(pages * PGSIZE, PGSIZE).unwrap();
        // SAFETY: layout has a non-zero size.
        let base = unsafe { std::alloc::alloc(layout) } as usize;
        assert!(base != 0);
        (base, base + pages * PGSIZE)
    }

    fn kmem_with(pages: usize) -> Arc<Kmem> {
        let (start, end) = arena(pages);
        let mut kmem = Box::new(Kmem::new());
        // SAFETY: the arena is fresh and handed to exactly this allocator.
        unsafe { kmem.init(start, end) };
        Arc::from(kmem)
    }

    #[test]
    fn alloc_is_aligned_and_in_range_and_poisoned() {
        let kmem = kmem_with(8);
        let mut held = Vec::new();
        for _ in 0..8 {
            let page = kmem.alloc().expect("arena should hold 8 pages");
            let pa = page.addr().into_usize();
            assert_eq!(pa % PGSIZE, 0);
            assert!((kmem.start..kmem.end).contains(&pa));
            assert!(page.iter().all(|&b| b == 5));
            held.push(page);
        }
        assert!(kmem.alloc().is_none());
        assert_eq!(kmem.free_pages(), 0);
        for page in held {
            kmem.free(page);
        }
        assert_eq!(kmem.free_pages(), 8);
    }

    #[test]
    fn free_then_alloc_is_lifo() {
        let kmem = kmem_with(4);
        let a = kmem.alloc().unwrap();
        let pa = a.addr().into_usize();
        kmem.free(a);
        let b = kmem.alloc().unwrap();
        assert_eq!(b.addr().into_usize(), pa);
        kmem.free(b);
    }

    #[test]
    fn empty_cpu_steals_from_peers() {
        // init() put every page on this thread's list; a fresh thread gets
        // its own hart id and an empty list, so its alloc must steal.
        let kmem = kmem_with(4);
        std::thread::spawn({
            let kmem = Arc::clone(&kmem);
            move || {
                let id = arch::cpu_id();
                let page = kmem.alloc().expect("should steal from the peer list");
                let pa = page.addr().into_usize();
                // Freeing lands on this thread's own list, and the next
                // allocation pops it back (LIFO).
                kmem.free(page);
                assert!(kmem.list_len(id) >= 1);
                let again = kmem.alloc().unwrap();
                assert_eq!(again.addr().into_usize(), pa);
                kmem.free(again);
            }
        })
        .join()
        .unwrap();
        assert_eq!(kmem.free_pages(), 4);
    }

    #[test]
    fn concurrent_alloc_free_conserves_pages() {
        const PAGES: usize = 32;
        const THREADS: usize = 4;
        const ITERS: usize = 500;

        let kmem = kmem_with(PAGES);
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let kmem = Arc::clone(&kmem);
            handles.push(std::thread::spawn(move || {
                let mut held = Vec::new();
                let mut seed = (t as u64 + 1).wrapping_mul(0x9e3779b97f4a7c15);
                for _ in 0..ITERS {
                    // xorshift; alternate between allocating and freeing.
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    if seed % 2 == 0 || held.is_empty() {
                        if let Some(page) = kmem.alloc() {
                            held.push(page);
                        }
                    } else if let Some(page) = held.pop() {
                        kmem.free(page);
                    }
                }
                for page in held {
                    kmem.free(page);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(kmem.free_pages(), PAGES);
    }

    #[test]
    #[should_panic(expected = "Kmem::free")]
    fn free_rejects_out_of_range() {
        let kmem = kmem_with(2);
        let (other, _) = arena(1);
        // SAFETY: the page is valid; the allocator is expected to reject it
        // before touching the freelist.
        kmem.free(unsafe { Page::from_usize(other) });
    }

    #[test]
    fn two_allocations_never_alias() {
        let kmem = kmem_with(6);
        let a = kmem.alloc().unwrap();
        let b = kmem.alloc().unwrap();
        assert_ne!(a.addr().into_usize(), b.addr().into_usize());
        kmem.free(a);
        kmem.free(b);
    }
}
