//! Page tables: the kernel's direct map, per-process user address spaces,
//! and the per-process kernel maps that mirror them.

use core::{cmp, marker::PhantomData, mem, slice};

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    addr::{
        make_satp, pa2pte, pgrounddown, pgroundup, pte2pa, Addr, KVAddr, PAddr, UVAddr, VAddr,
        MAXVA, PGSIZE, PLNUM, PLSIZE,
    },
    arch,
    kalloc::Kmem,
    memlayout::{CLINT, KERNBASE, PHYSTOP, PLIC, TRAMPOLINE, TRAPFRAME, UART0, VIRTIO0},
    page::Page,
};

bitflags! {
    pub struct PteFlags: usize {
        /// valid
        const V = 1 << 0;
        /// readable
        const R = 1 << 1;
        /// writable
        const W = 1 << 2;
        /// executable
        const X = 1 << 3;
        /// user-accessible
        const U = 1 << 4;
        /// global
        const G = 1 << 5;
        /// accessed
        const A = 1 << 6;
        /// dirty
        const D = 1 << 7;
    }
}

/// # Safety
///
/// If self.is_table() is true, then it must refer to a valid page-table page.
///
/// Because of #[derive(Default)], inner is initially 0, which satisfies the
/// invariant.
#[derive(Default)]
pub struct PageTableEntry {
    inner: usize,
}

impl PageTableEntry {
    pub fn get_flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.inner)
    }

    fn flag_intersects(&self, flag: PteFlags) -> bool {
        self.get_flags().intersects(flag)
    }

    pub fn get_pa(&self) -> PAddr {
        pte2pa(self.inner)
    }

    pub fn is_valid(&self) -> bool {
        self.flag_intersects(PteFlags::V)
    }

    pub fn is_user(&self) -> bool {
        self.is_valid() && self.flag_intersects(PteFlags::U)
    }

    /// An interior entry: valid, but with none of R/W/X set.
    pub fn is_table(&self) -> bool {
        self.is_valid() && !self.flag_intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    /// A leaf entry: valid, with at least one of R/W/X set.
    pub fn is_data(&self) -> bool {
        self.is_valid() && self.flag_intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    /// Make the entry refer to a given page-table page.
    fn set_table(&mut self, page: *mut RawPageTable) {
        self.inner = pa2pte((page as usize).into()) | PteFlags::V.bits();
    }

    /// Make the entry refer to a given address with a given permission.
    /// The permission should include at least one of R, W, and X not to be
    /// considered as an entry referring to a page-table page.
    fn set_entry(&mut self, pa: PAddr, perm: PteFlags) {
        assert!(perm.intersects(PteFlags::R | PteFlags::W | PteFlags::X));
        self.inner = pa2pte(pa) | (perm | PteFlags::V).bits();
    }

    /// Make the entry inaccessible by user processes by clearing PteFlags::U.
    fn clear_user(&mut self) {
        self.inner &= !PteFlags::U.bits();
    }

    /// Invalidate the entry by making every bit 0.
    fn invalidate(&mut self) {
        self.inner = 0;
    }

    /// Return `Some(..)` if it refers to a page-table page.
    /// Return `None` if it refers to a data page, or is invalid.
    fn as_table_mut(&mut self) -> Option<&mut RawPageTable> {
        if self.is_table() {
            // SAFETY: the invariant of PageTableEntry.
            Some(unsafe { &mut *(pte2pa(self.inner).into_usize() as *mut _) })
        } else {
            None
        }
    }
}

/// A page-table page: 512 PTEs.
///
/// # Safety
///
/// It can be converted into a Page by Page::from_usize(self.inner.as_ptr()
/// as _) without breaking the invariants of Page.
struct RawPageTable {
    inner: [PageTableEntry; PLSIZE],
}

impl RawPageTable {
    /// Makes a new empty raw page table by allocating a zeroed page.
    /// Returns `None` if the allocation failed.
    fn new(kmem: &Kmem) -> Option<*mut RawPageTable> {
        let mut page = kmem.alloc()?;
        page.write_bytes(0);
        // This line guarantees the invariant.
        Some(page.into_usize() as *mut RawPageTable)
    }

    /// Returns `Some(..)` if the `index`th entry refers to a page-table page.
    /// Returns `Some(..)` by allocating a new page if the `index`th entry is
    /// invalid but an allocator was given. The result is `None` when the
    /// allocation failed.
    /// Returns `None` if the `index`th entry refers to a data page.
    /// Returns `None` if the `index`th entry is invalid and no allocator was
    /// given.
    fn get_table_mut(&mut self, index: usize, allocator: Option<&Kmem>) -> Option<&mut RawPageTable> {
        let pte = &mut self.inner[index];
        if !pte.is_valid() {
            let table = Self::new(allocator?)?;
            pte.set_table(table);
        }
        pte.as_table_mut()
    }

    /// Returns the `index`th entry, which refers to a data page or is
    /// invalid. Panics if the entry refers to a page-table page.
    fn get_entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        let pte = &mut self.inner[index];
        assert!(!pte.is_table());
        pte
    }

    /// Recursively frees page-table pages. All leaf mappings must already
    /// have been removed; a remaining leaf is a bug.
    ///
    /// # Safety
    ///
    /// This method frees the page table itself, so this page table must
    /// not be used after an invocation of this method.
    unsafe fn free_walk(&mut self, kmem: &Kmem) {
        // There are 2^9 = 512 PTEs in a page table.
        for pte in &mut self.inner {
            if let Some(table) = pte.as_table_mut() {
                // SAFETY: the table is not used anymore.
                unsafe { table.free_walk(kmem) };
                pte.invalidate();
            } else if pte.is_valid() {
                panic!("free_walk: leaf");
            }
        }
        // SAFETY: safe to convert inner into a Page by the invariant.
        let page = unsafe { Page::from_usize(self.inner.as_ptr() as _) };
        kmem.free(page);
    }
}

/// # Safety
///
/// ptr uniquely refers to a valid 3-level RawPageTable.
pub struct PageTable<A: VAddr> {
    ptr: *mut RawPageTable,
    _marker: PhantomData<A>,
}

// SAFETY: a PageTable is an owning handle; the raw pointer is never aliased.
unsafe impl<A: VAddr> Send for PageTable<A> {}

impl<A: VAddr> PageTable<A> {
    /// Makes a new empty page table by allocating a new page.
    /// Returns `None` if the allocation failed.
    pub fn new(kmem: &Kmem) -> Option<Self> {
        Some(Self {
            ptr: RawPageTable::new(kmem)?,
            _marker: PhantomData,
        })
    }

    pub fn as_usize(&self) -> usize {
        self.ptr as usize
    }

    /// The satp value that installs this page table.
    pub fn satp(&self) -> usize {
        make_satp(self.as_usize())
    }

    /// Returns the leaf-level PTE in this page table that corresponds to
    /// virtual address `va`. When an allocator is given, creates any
    /// required interior page-table pages.
    ///
    /// The risc-v Sv39 scheme has three levels of page-table pages. A
    /// page-table page contains 512 64-bit PTEs.
    /// A 64-bit virtual address is split into five fields:
    ///   39..63 -- must be zero.
    ///   30..38 -- 9 bits of level-2 index.
    ///   21..29 -- 9 bits of level-1 index.
    ///   12..20 -- 9 bits of level-0 index.
    ///    0..11 -- 12 bits of byte offset within the page.
    pub fn get_mut(&mut self, va: A, allocator: Option<&Kmem>) -> Option<&mut PageTableEntry> {
        assert!(va.into_usize() < MAXVA, "PageTable::get_mut");
        // SAFETY: self.ptr uniquely refers to a valid RawPageTable by the
        // invariant.
        let mut page_table = unsafe { &mut *self.ptr };
        for level in (1..PLNUM).rev() {
            page_table = page_table.get_table_mut(va.page_table_index(level), allocator)?;
        }
        Some(page_table.get_entry_mut(va.page_table_index(0)))
    }

    /// Looks up `va` and returns its physical address, offset included.
    /// Can only be used to look up user-accessible pages.
    pub fn walk_addr(&mut self, va: A) -> Option<PAddr> {
        if va.into_usize() >= MAXVA {
            return None;
        }
        let offset = va.into_usize() % PGSIZE;
        let pte = self.get_mut(A::from(pgrounddown(va.into_usize())), None)?;
        if !pte.is_user() {
            return None;
        }
        Some(pte.get_pa() + offset)
    }

    /// Creates a leaf PTE mapping the page of `va` to `pa` with `perm`.
    /// Panics if the page is already mapped. Returns `Err(())` if a needed
    /// interior table could not be allocated.
    pub fn insert(&mut self, va: A, pa: PAddr, perm: PteFlags, kmem: &Kmem) -> Result<(), ()> {
        let a = pgrounddown(va.into_usize());
        let pte = self.get_mut(A::from(a), Some(kmem)).ok_or(())?;
        assert!(!pte.is_valid(), "PageTable::insert");
        pte.set_entry(pa, perm);
        Ok(())
    }

    /// Creates PTEs for virtual addresses starting at `va` that refer to
    /// physical addresses starting at `pa`. `va` and `size` might not be
    /// page-aligned. Returns `Err(())` if a needed interior page-table page
    /// could not be allocated.
    pub fn insert_range(
        &mut self,
        va: A,
        size: usize,
        pa: PAddr,
        perm: PteFlags,
        kmem: &Kmem,
    ) -> Result<(), ()> {
        let start = pgrounddown(va.into_usize());
        let end = pgrounddown(va.into_usize() + size - 1);
        for i in num_iter::range_step_inclusive(0, end - start, PGSIZE) {
            self.insert(va + i, pa + i, perm, kmem)?;
        }
        Ok(())
    }

    /// Removes the mapping of `va` and returns the physical address it
    /// mapped. Panics if the mapping is missing or is not a leaf.
    pub fn remove(&mut self, va: A) -> PAddr {
        let pte = self.get_mut(va, None).expect("PageTable::remove");
        assert!(pte.is_data(), "PageTable::remove: not a leaf");
        let pa = pte.get_pa();
        pte.invalidate();
        pa
    }

    /// Removes `npages` of mappings starting from `va`. `va` must be
    /// page-aligned, and every mapping must exist and be a leaf.
    /// When `free_into` is given, the physical frames are returned to it.
    pub fn remove_range(&mut self, va: A, npages: usize, free_into: Option<&Kmem>) {
        assert!(va.is_page_aligned(), "remove_range: not aligned");

        for a in num_iter::range_step(
            va.into_usize(),
            va.into_usize() + npages * PGSIZE,
            PGSIZE,
        ) {
            let pte = self.get_mut(A::from(a), None).expect("remove_range: walk");
            assert!(pte.is_valid(), "remove_range: not mapped");
            assert!(pte.is_data(), "remove_range: not a leaf");
            let pa = pte.get_pa();
            pte.invalidate();
            if let Some(kmem) = free_into {
                // SAFETY: the frame was mapped at exactly one place, which
                // was just removed, so it is unowned now.
                kmem.free(unsafe { Page::from_usize(pa.into_usize()) });
            }
        }
    }

    /// Removes the mapping of `va` if it exists and is a leaf.
    /// Used for teardown of partially built address spaces.
    fn try_remove(&mut self, va: A) -> Option<PAddr> {
        let pte = self.get_mut(va, None)?;
        if !pte.is_data() {
            return None;
        }
        let pa = pte.get_pa();
        pte.invalidate();
        Some(pa)
    }

    /// Frees every page-table page. All leaf mappings must already have
    /// been removed.
    pub fn free(self, kmem: &Kmem) {
        // SAFETY: self is consumed, so the table is not used again.
        unsafe { (*self.ptr).free_walk(kmem) };
        mem::forget(self);
    }

    /// Prints the page-table tree, interior entries included, the way the
    /// boot monitor expects it.
    pub fn dump(&self) {
        crate::println!("page table {:p}", self.ptr);
        // SAFETY: self.ptr refers to a valid RawPageTable by the invariant.
        unsafe { Self::dump_level(&*self.ptr, 1) };
    }

    fn dump_level(table: &RawPageTable, depth: usize) {
        for (i, pte) in table.inner.iter().enumerate() {
            if !pte.is_valid() {
                continue;
            }
            for _ in 0..depth {
                crate::print!(" ..");
            }
            let pa = pte.get_pa().into_usize();
            crate::println!("{}: pte {:#x} pa {:#x}", i, pte.inner, pa);
            if pte.is_table() {
                // SAFETY: interior entries refer to valid page-table pages.
                Self::dump_level(unsafe { &*(pa as *const RawPageTable) }, depth + 1);
            }
        }
    }
}

/// UserMemory manages the page table and allocated pages of a process. Its
/// invariant guarantees that every PAddr mapped below `size` came from the
/// page allocator. This property is crucial for the safety of methods that
/// read or write memory, such as copy_in, and for freeing those frames.
///
/// # Safety
///
/// For brevity, pt := page_table, treated as a function from va to pa.
/// - If va ∈ dom(pt), va mod PGSIZE = 0 ∧ pt(va) mod PGSIZE = 0.
/// - pt(TRAMPOLINE) = trampoline.
/// - TRAPFRAME ∈ dom(pt).
/// - If va ∈ dom(pt) ∧ va ∉ { TRAMPOLINE, TRAPFRAME },
///   then Page::from_usize(pt(va)) succeeds without breaking the invariant
///   of Page.
/// - pgroundup(size) ∉ dom(pt) below TRAPFRAME.
pub struct UserMemory {
    /// Page table of the process.
    page_table: PageTable<UVAddr>,
    /// Size of process memory (bytes).
    size: usize,
}

impl UserMemory {
    /// Creates a user page table with no user memory, but with the
    /// trampoline and the given trap frame mapped at the top. If `src_opt`
    /// is `Some(src)`, loads `src` at address 0; src.len() must be less
    /// than a page.
    /// Returns `None` if an allocation failed.
    pub fn new(trap_frame: PAddr, src_opt: Option<&[u8]>, kmem: &Kmem) -> Option<Self> {
        let page_table = PageTable::new(kmem)?;
        let mut memory = Self {
            page_table,
            size: 0,
        };

        // Map the trampoline code (for system call return) at the highest
        // user virtual address. Only the supervisor uses it on the way
        // to/from user space, so not PTE_U.
        if memory
            .page_table
            .insert(
                TRAMPOLINE.into(),
                arch::trampoline_addr().into(),
                PteFlags::R | PteFlags::X,
                kmem,
            )
            .is_err()
        {
            memory.free(kmem);
            return None;
        }

        // Map the trap frame just below TRAMPOLINE, for the trampoline.
        if memory
            .page_table
            .insert(
                TRAPFRAME.into(),
                trap_frame,
                PteFlags::R | PteFlags::W,
                kmem,
            )
            .is_err()
        {
            memory.free(kmem);
            return None;
        }

        if let Some(src) = src_opt {
            assert!(src.len() < PGSIZE, "UserMemory::new: more than a page");
            let mut page = match kmem.alloc() {
                Some(page) => page,
                None => {
                    memory.free(kmem);
                    return None;
                }
            };
            page.write_bytes(0);
            page[..src.len()].copy_from_slice(src);
            if let Err(page) = memory.push_page(
                page,
                PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
                kmem,
            ) {
                kmem.free(page);
                memory.free(kmem);
                return None;
            }
        }

        Some(memory)
    }

    /// Makes a new memory by copying this one. Copies both the page table
    /// and the physical memory. Returns `None` on failure, freeing any
    /// allocated pages.
    pub fn try_clone(&mut self, trap_frame: PAddr, kmem: &Kmem) -> Option<Self> {
        let new = Self::new(trap_frame, None, kmem)?;
        let mut new = scopeguard::guard(new, |new| new.free(kmem));
        for i in num_iter::range_step(0, self.size, PGSIZE) {
            let pte = self
                .page_table
                .get_mut(i.into(), None)
                .expect("try_clone: pte should exist");
            assert!(pte.is_valid(), "try_clone: page not present");

            let pa = pte.get_pa();
            let flags = pte.get_flags();
            let mut page = kmem.alloc()?;
            // SAFETY: pa is an address in page_table, hence the address of
            // a page by the invariant.
            let src = unsafe { slice::from_raw_parts(pa.into_usize() as *const u8, PGSIZE) };
            page.copy_from_slice(src);
            if let Err(page) = new.push_page(page, flags, kmem) {
                kmem.free(page);
                return None;
            }
        }
        let mut new = scopeguard::ScopeGuard::into_inner(new);
        new.size = self.size;
        Some(new)
    }

    /// The size of this memory, in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The satp value that installs this process's page table.
    pub fn satp(&self) -> usize {
        self.page_table.satp()
    }

    pub fn page_table_mut(&mut self) -> &mut PageTable<UVAddr> {
        &mut self.page_table
    }

    /// Allocates PTEs and physical memory to grow the process to `newsz`,
    /// which need not be page aligned. The address space must stay below
    /// the PLIC window, which the per-process kernel map reserves.
    /// Returns the new size, or `Err(())` after rolling back partial work.
    pub fn alloc(&mut self, newsz: usize, kmem: &Kmem) -> Result<usize, ()> {
        if newsz > PLIC {
            return Err(());
        }
        if newsz <= self.size {
            return Ok(self.size);
        }

        let oldsz = self.size;
        let mut this = scopeguard::guard(self, |this| {
            let _ = this.dealloc(oldsz, kmem);
        });
        while pgroundup(this.size) < pgroundup(newsz) {
            let mut page = kmem.alloc().ok_or(())?;
            page.write_bytes(0);
            if let Err(page) = this.push_page(
                page,
                PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
                kmem,
            ) {
                kmem.free(page);
                return Err(());
            }
        }
        let this = scopeguard::ScopeGuard::into_inner(this);
        this.size = newsz;
        Ok(this.size)
    }

    /// Deallocates user pages to bring the process size down to `newsz`,
    /// which need not be page-aligned. Returns the new process size.
    pub fn dealloc(&mut self, newsz: usize, kmem: &Kmem) -> usize {
        if self.size <= newsz {
            return self.size;
        }

        while pgroundup(newsz) < pgroundup(self.size) {
            if let Some(page) = self.pop_page() {
                kmem.free(page);
            }
        }
        self.size = newsz;
        newsz
    }

    /// Grows or shrinks the process size by `n` bytes.
    /// Returns the old size, or `Err(())` on failure.
    pub fn resize(&mut self, n: isize, kmem: &Kmem) -> Result<usize, ()> {
        let size = self.size;
        match n.cmp(&0) {
            cmp::Ordering::Equal => (),
            cmp::Ordering::Greater => {
                let _ = self.alloc(size + n as usize, kmem)?;
            }
            cmp::Ordering::Less => {
                let _ = self.dealloc(size.wrapping_sub(n.unsigned_abs()), kmem);
            }
        };
        Ok(size)
    }

    /// Marks a PTE invalid for user access.
    /// Used by exec for the user stack guard page.
    pub fn clear_user(&mut self, va: UVAddr) {
        self.page_table
            .get_mut(va, None)
            .expect("clear_user")
            .clear_user();
    }

    /// Copy from kernel to user.
    /// Copies `src` to virtual address `dstva` in this page table.
    /// Returns `Err(())` if a page is missing or not user-writable.
    pub fn copy_out_bytes(&mut self, dstva: UVAddr, src: &[u8]) -> Result<(), ()> {
        let mut dst = dstva.into_usize();
        let mut len = src.len();
        let mut offset = 0;
        while len > 0 {
            let va = pgrounddown(dst);
            let poffset = dst - va;
            let page = self.get_slice(va.into()).ok_or(())?;
            let n = cmp::min(PGSIZE - poffset, len);
            page[poffset..poffset + n].copy_from_slice(&src[offset..offset + n]);
            len -= n;
            offset += n;
            dst += n;
        }
        Ok(())
    }

    /// Copy a value from kernel to user.
    pub fn copy_out<T: AsBytes>(&mut self, dstva: UVAddr, src: &T) -> Result<(), ()> {
        self.copy_out_bytes(dstva, src.as_bytes())
    }

    /// Copy from user to kernel.
    /// Copies `dst.len()` bytes to `dst` from virtual address `srcva` in
    /// this page table.
    pub fn copy_in_bytes(&mut self, dst: &mut [u8], srcva: UVAddr) -> Result<(), ()> {
        let mut src = srcva.into_usize();
        let mut len = dst.len();
        let mut offset = 0;
        while len > 0 {
            let va = pgrounddown(src);
            let poffset = src - va;
            let page = self.get_slice(va.into()).ok_or(())?;
            let n = cmp::min(PGSIZE - poffset, len);
            dst[offset..offset + n].copy_from_slice(&page[poffset..poffset + n]);
            len -= n;
            offset += n;
            src += n;
        }
        Ok(())
    }

    /// Copy a value from user to kernel.
    pub fn copy_in<T: AsBytes + FromBytes>(&mut self, dst: &mut T, srcva: UVAddr) -> Result<(), ()> {
        self.copy_in_bytes(dst.as_bytes_mut(), srcva)
    }

    /// Copies a null-terminated string from user to kernel, until a '\0' or
    /// `dst.len()` bytes. Returns the string length on success.
    pub fn copy_in_str(&mut self, dst: &mut [u8], srcva: UVAddr) -> Result<usize, ()> {
        let mut src = srcva.into_usize();
        let mut offset = 0;
        let mut max = dst.len();
        while max > 0 {
            let va = pgrounddown(src);
            let poffset = src - va;
            let page = self.get_slice(va.into()).ok_or(())?;
            let n = cmp::min(PGSIZE - poffset, max);

            let from = &page[poffset..poffset + n];
            match from.iter().position(|c| *c == 0) {
                Some(i) => {
                    dst[offset..offset + i + 1].copy_from_slice(&from[..i + 1]);
                    return Ok(offset + i);
                }
                None => {
                    dst[offset..offset + n].copy_from_slice(from);
                    max -= n;
                    offset += n;
                    src += n;
                }
            }
        }
        Err(())
    }

    /// Frees the user pages, the trampoline and trap-frame mappings, and
    /// the page-table tree. The trap-frame page itself belongs to the
    /// process and is freed by it.
    pub fn free(mut self, kmem: &Kmem) {
        let _ = self.dealloc(0, kmem);
        let _ = self.page_table.try_remove(TRAMPOLINE.into());
        let _ = self.page_table.try_remove(TRAPFRAME.into());
        self.page_table.free(kmem);
    }

    /// Returns the page at `va` as a slice. `None` if unmapped or not
    /// user-accessible.
    fn get_slice(&mut self, va: UVAddr) -> Option<&mut [u8]> {
        if va.into_usize() >= TRAPFRAME {
            return None;
        }
        let pte = self.page_table.get_mut(va, None)?;
        if !pte.is_user() {
            return None;
        }
        // SAFETY: va < TRAPFRAME, so pte.get_pa() is the address of a page
        // by the invariant.
        Some(unsafe { slice::from_raw_parts_mut(pte.get_pa().into_usize() as _, PGSIZE) })
    }

    /// Increases the size by appending a given page with given flags.
    /// `Err(page)` returns the page on failure.
    fn push_page(&mut self, page: Page, perm: PteFlags, kmem: &Kmem) -> Result<(), Page> {
        let pa = page.into_usize();
        // The invariant is maintained because pa is the address of a page.
        let size = pgroundup(self.size);
        self.page_table
            .insert(size.into(), pa.into(), perm, kmem)
            // SAFETY: pa is the address of the page given to us.
            .map_err(|_| unsafe { Page::from_usize(pa) })?;
        self.size = size + PGSIZE;
        Ok(())
    }

    /// Decreases the size by removing the most recently appended page.
    /// `None` if the size is 0.
    fn pop_page(&mut self) -> Option<Page> {
        if self.size == 0 {
            return None;
        }
        self.size = pgroundup(self.size) - PGSIZE;
        let pa = self.page_table.remove(self.size.into()).into_usize();
        // SAFETY: pa was mapped below size, hence the address of a page by
        // the invariant.
        Some(unsafe { Page::from_usize(pa) })
    }
}

/// KernelMemory manages a kernel page table: either the global direct map
/// installed at boot, or a per-process copy of it that additionally mirrors
/// the process's user mappings (with the U bit cleared) so that kernel code
/// can dereference user virtual addresses directly.
pub struct KernelMemory {
    /// Page table of the kernel.
    page_table: PageTable<KVAddr>,
}

impl KernelMemory {
    /// Makes the global direct-map page table for the kernel.
    /// Panics if an allocation fails; the boot cannot proceed without it.
    pub fn new(kmem: &Kmem) -> Self {
        Self::build(kmem, true)
    }

    /// Makes a kernel page table for one process: the global map minus the
    /// CLINT, whose window lies low enough to collide with a grown user
    /// address space.
    pub fn new_per_process(kmem: &Kmem) -> Self {
        Self::build(kmem, false)
    }

    fn build(kmem: &Kmem, include_clint: bool) -> Self {
        let mut page_table = PageTable::new(kmem).expect("kvmmap");
        let mut map = |va: usize, size: usize, pa: usize, perm| {
            page_table
                .insert_range(va.into(), size, pa.into(), perm, kmem)
                .expect("kvmmap");
        };

        // Uart registers
        map(UART0, PGSIZE, UART0, PteFlags::R | PteFlags::W);

        // Virtio mmio disk interface
        map(VIRTIO0, PGSIZE, VIRTIO0, PteFlags::R | PteFlags::W);

        // CLINT
        if include_clint {
            map(CLINT, 0x10000, CLINT, PteFlags::R | PteFlags::W);
        }

        // PLIC
        map(PLIC, 0x400000, PLIC, PteFlags::R | PteFlags::W);

        // Map kernel text executable and read-only.
        let et = arch::text_end();
        map(KERNBASE, et - KERNBASE, KERNBASE, PteFlags::R | PteFlags::X);

        // Map kernel data and the physical RAM we'll make use of.
        map(et, PHYSTOP - et, et, PteFlags::R | PteFlags::W);

        // Map the trampoline for trap entry/exit to the highest virtual
        // address in the kernel.
        map(
            TRAMPOLINE,
            PGSIZE,
            arch::trampoline_addr(),
            PteFlags::R | PteFlags::X,
        );

        Self { page_table }
    }

    /// The satp value that installs this kernel page table.
    pub fn satp(&self) -> usize {
        self.page_table.satp()
    }

    /// Switch the h/w page table register to this kernel page table, and
    /// enable paging.
    pub unsafe fn init_hart(&self) {
        unsafe {
            arch::w_satp(self.satp());
            arch::sfence_vma();
        }
    }

    /// Maps one kernel stack page at `va`.
    pub fn map_kstack(&mut self, va: usize, pa: PAddr, kmem: &Kmem) {
        self.page_table
            .insert_range(va.into(), PGSIZE, pa, PteFlags::R | PteFlags::W, kmem)
            .expect("map_kstack");
    }

    /// Removes the kernel stack mapping at `va`, freeing the frame.
    pub fn unmap_kstack(&mut self, va: usize, kmem: &Kmem) {
        self.page_table.remove_range(va.into(), 1, Some(kmem));
    }

    /// Mirrors the user mappings in `[oldsz, newsz)` into this kernel page
    /// table, with the U bit cleared so supervisor mode may use them.
    /// Panics if a user page is missing; growth happens user-side first.
    pub fn mirror_grow(
        &mut self,
        user: &mut UserMemory,
        oldsz: usize,
        newsz: usize,
        kmem: &Kmem,
    ) {
        let oldsz = pgroundup(oldsz);
        let newsz = pgroundup(newsz);
        for va in num_iter::range_step(oldsz, newsz, PGSIZE) {
            let pte = user
                .page_table_mut()
                .get_mut(va.into(), None)
                .expect("mirror_grow: pte should exist");
            assert!(pte.is_valid(), "mirror_grow: not mapped");
            assert!(pte.is_data(), "mirror_grow: not a leaf");

            let pa = pte.get_pa();
            // The guard page is not PTE_U, so the flags are taken as-is,
            // minus U: supervisor mode cannot touch user-accessible pages.
            let flags = pte.get_flags() - PteFlags::U;
            self.page_table
                .insert_range(va.into(), PGSIZE, pa, flags, kmem)
                .expect("mirror_grow");
        }
    }

    /// Mirrors the whole user address space of `user` into this table.
    pub fn mirror_user(&mut self, user: &mut UserMemory, kmem: &Kmem) {
        let size = user.size();
        self.mirror_grow(user, 0, size, kmem);
    }

    /// Drops the mirrored mappings in `[newsz, oldsz)`. Only the PTEs go;
    /// the frames still belong to the user address space.
    pub fn mirror_shrink(&mut self, oldsz: usize, newsz: usize) {
        let npages = (pgroundup(oldsz) - pgroundup(newsz)) / PGSIZE;
        self.page_table
            .remove_range(pgroundup(newsz).into(), npages, None);
    }

    /// Frees a per-process kernel page table: removes every mapping without
    /// freeing the frames (the kernel ranges are shared, the user frames
    /// belong to the user address space), then frees the tree. The kernel
    /// stack must already have been unmapped.
    pub fn free_per_process(mut self, user_sz: usize, kmem: &Kmem) {
        let pt = &mut self.page_table;
        pt.remove_range(UART0.into(), 1, None);
        pt.remove_range(VIRTIO0.into(), 1, None);
        pt.remove_range(PLIC.into(), 0x400000 / PGSIZE, None);
        pt.remove_range(KERNBASE.into(), (PHYSTOP - KERNBASE) / PGSIZE, None);
        pt.remove_range(TRAMPOLINE.into(), 1, None);
        if user_sz > 0 {
            pt.remove_range(0usize.into(), pgroundup(user_sz) / PGSIZE, None);
        }
        self.page_table.free(kmem);
    }

    /// Prints this kernel page table.
    pub fn dump(&self) {
        self.page_table.dump();
    }
}

#[cfg(test)]
mod tests {
    use std::boxed::Box;
    use std::sync::Arc;
    use std::vec;

    use super::*;
    use crate::kalloc::Kmem;

    fn kmem_with(pages: usize) -> Arc<Kmem> {
        let layout = std::alloc::Layout::from_size_align(pages * PGSIZE, PGSIZE).unwrap();
        // SAFETY: layout has a non-zero size.
        let base = unsafe { std::alloc::alloc(layout) } as usize;
        assert!(base != 0);
        let mut kmem = Box::new(Kmem::new());
        // SAFETY: the arena is fresh and handed to exactly this allocator.
        unsafe { kmem.init(base, base + pages * PGSIZE) };
        Arc::from(kmem)
    }

    #[test]
    fn walk_allocates_once_then_finds_the_same_pte() {
        let kmem = kmem_with(16);
        let mut pt = PageTable::<UVAddr>::new(&kmem).unwrap();
        let va = UVAddr::from(3 * PGSIZE);

        let first = pt.get_mut(va, Some(&kmem)).unwrap() as *mut PageTableEntry;
        let second = pt.get_mut(va, None).unwrap() as *mut PageTableEntry;
        assert_eq!(first, second);

        pt.free(&kmem);
        assert_eq!(kmem.free_pages(), 16);
    }

    #[test]
    fn mapped_range_translates_with_offsets() {
        let kmem = kmem_with(16);
        let mut pt = PageTable::<UVAddr>::new(&kmem).unwrap();
        let frame = kmem.alloc().unwrap();
        let pa = frame.addr();
        core::mem::forget(frame);

        pt.insert_range(
            UVAddr::from(0),
            PGSIZE,
            pa,
            PteFlags::R | PteFlags::W | PteFlags::U,
            &kmem,
        )
        .unwrap();

        for k in [0usize, 1, 8, PGSIZE - 1] {
            let got = pt.walk_addr(UVAddr::from(k)).unwrap();
            assert_eq!(got.into_usize(), pa.into_usize() + k);
        }

        // Without the U bit the lookup must fail.
        pt.remove_range(UVAddr::from(0), 1, None);
        pt.insert_range(UVAddr::from(0), PGSIZE, pa, PteFlags::R | PteFlags::W, &kmem)
            .unwrap();
        assert!(pt.walk_addr(UVAddr::from(0)).is_none());

        pt.remove_range(UVAddr::from(0), 1, Some(&kmem));
        pt.free(&kmem);
        assert_eq!(kmem.free_pages(), 16);
    }

    #[test]
    #[should_panic(expected = "PageTable::get_mut")]
    fn walk_beyond_maxva_panics() {
        let kmem = kmem_with(4);
        let mut pt = PageTable::<UVAddr>::new(&kmem).unwrap();
        let _ = pt.get_mut(UVAddr::from(MAXVA), None);
    }

    #[test]
    #[should_panic(expected = "PageTable::insert")]
    fn remap_panics() {
        let kmem = kmem_with(16);
        let mut pt = PageTable::<UVAddr>::new(&kmem).unwrap();
        let page = kmem.alloc().unwrap();
        let pa = page.addr();
        core::mem::forget(page);

        pt.insert(UVAddr::from(0), pa, PteFlags::R | PteFlags::U, &kmem)
            .unwrap();
        let _ = pt.insert(UVAddr::from(0), pa, PteFlags::R | PteFlags::U, &kmem);
    }

    #[test]
    #[should_panic(expected = "free_walk: leaf")]
    fn free_walk_panics_on_remaining_leaf() {
        let kmem = kmem_with(16);
        let mut pt = PageTable::<UVAddr>::new(&kmem).unwrap();
        let page = kmem.alloc().unwrap();
        let pa = page.addr();
        core::mem::forget(page);

        pt.insert(UVAddr::from(0), pa, PteFlags::R | PteFlags::U, &kmem)
            .unwrap();
        pt.free(&kmem);
    }

    #[test]
    fn unmap_then_map_again_succeeds() {
        let kmem = kmem_with(16);
        let mut pt = PageTable::<UVAddr>::new(&kmem).unwrap();
        let page = kmem.alloc().unwrap();
        let pa = page.addr();
        core::mem::forget(page);

        pt.insert(UVAddr::from(PGSIZE), pa, PteFlags::R | PteFlags::U, &kmem)
            .unwrap();
        pt.remove_range(UVAddr::from(PGSIZE), 1, None);
        pt.insert(UVAddr::from(PGSIZE), pa, PteFlags::R | PteFlags::U, &kmem)
            .unwrap();

        pt.remove_range(UVAddr::from(PGSIZE), 1, Some(&kmem));
        pt.free(&kmem);
        assert_eq!(kmem.free_pages(), 16);
    }

    fn new_user_memory(kmem: &Kmem) -> (UserMemory, PAddr) {
        let trap_frame = kmem.alloc().unwrap();
        let tf_pa = trap_frame.addr();
        core::mem::forget(trap_frame);
        (UserMemory::new(tf_pa, None, kmem).unwrap(), tf_pa)
    }

    fn release(memory: UserMemory, tf_pa: PAddr, kmem: &Kmem) {
        memory.free(kmem);
        // SAFETY: the trap-frame page was leaked in new_user_memory.
        kmem.free(unsafe { crate::page::Page::from_usize(tf_pa.into_usize()) });
    }

    #[test]
    fn user_memory_grows_and_shrinks() {
        let kmem = kmem_with(32);
        let initial = kmem.free_pages();
        let (mut memory, tf_pa) = new_user_memory(&kmem);

        assert_eq!(memory.alloc(3 * PGSIZE, &kmem), Ok(3 * PGSIZE));
        for va in [0usize, PGSIZE, 2 * PGSIZE] {
            assert!(memory.page_table_mut().walk_addr(va.into()).is_some());
        }

        assert_eq!(memory.dealloc(PGSIZE, &kmem), PGSIZE);
        assert!(memory.page_table_mut().walk_addr(PGSIZE.into()).is_none());
        assert!(memory.page_table_mut().walk_addr(0usize.into()).is_some());

        release(memory, tf_pa, &kmem);
        assert_eq!(kmem.free_pages(), initial);
    }

    #[test]
    fn growth_is_clamped_below_the_plic() {
        let kmem = kmem_with(8);
        let (mut memory, tf_pa) = new_user_memory(&kmem);
        assert_eq!(memory.alloc(PLIC + 1, &kmem), Err(()));
        assert_eq!(memory.size(), 0);
        release(memory, tf_pa, &kmem);
    }

    #[test]
    fn failed_growth_rolls_back() {
        let kmem = kmem_with(8);
        let (mut memory, tf_pa) = new_user_memory(&kmem);
        let before = memory.size();
        // 8 pages cannot back a 64-page address space.
        assert_eq!(memory.alloc(64 * PGSIZE, &kmem), Err(()));
        assert_eq!(memory.size(), before);
        release(memory, tf_pa, &kmem);
    }

    #[test]
    fn copy_out_then_in_round_trips_across_pages() {
        let kmem = kmem_with(32);
        let (mut memory, tf_pa) = new_user_memory(&kmem);
        memory.alloc(2 * PGSIZE, &kmem).unwrap();

        let pattern: vec::Vec<u8> = (0..PGSIZE).map(|i| (i % 251) as u8).collect();
        let dst = UVAddr::from(PGSIZE / 2);
        memory.copy_out_bytes(dst, &pattern).unwrap();

        let mut back = std::vec![0u8; PGSIZE];
        memory.copy_in_bytes(&mut back, dst).unwrap();
        assert_eq!(back, pattern);

        // Typed copies go through the same walk.
        memory.copy_out(UVAddr::from(24), &0xfeed_face_dead_beefu64).unwrap();
        let mut value = 0u64;
        memory.copy_in(&mut value, UVAddr::from(24)).unwrap();
        assert_eq!(value, 0xfeed_face_dead_beef);

        // Copies that run past the end of the address space fail.
        assert!(memory
            .copy_out_bytes(UVAddr::from(2 * PGSIZE - 1), &[1, 2])
            .is_err());

        release(memory, tf_pa, &kmem);
    }

    #[test]
    fn copy_in_str_stops_at_nul() {
        let kmem = kmem_with(32);
        let (mut memory, tf_pa) = new_user_memory(&kmem);
        memory.alloc(2 * PGSIZE, &kmem).unwrap();

        // Place "hello\0" straddling the page boundary.
        let src = UVAddr::from(PGSIZE - 3);
        memory.copy_out_bytes(src, b"hello\0").unwrap();

        let mut buf = [0xffu8; 16];
        let len = memory.copy_in_str(&mut buf, src).unwrap();
        assert_eq!(len, 5);
        assert_eq!(&buf[..6], b"hello\0");

        // A string with no terminator within the buffer is an error.
        memory.copy_out_bytes(UVAddr::from(0), &[b'x'; 16]).unwrap();
        let mut small = [0u8; 8];
        assert!(memory.copy_in_str(&mut small, UVAddr::from(0)).is_err());

        release(memory, tf_pa, &kmem);
    }

    #[test]
    fn clone_copies_frames_not_aliases() {
        let kmem = kmem_with(64);
        let initial = kmem.free_pages();
        let (mut parent, parent_tf) = new_user_memory(&kmem);
        parent.alloc(3 * PGSIZE, &kmem).unwrap();
        parent
            .copy_out_bytes(UVAddr::from(PGSIZE + 17), b"shared bytes")
            .unwrap();

        let child_tf_page = kmem.alloc().unwrap();
        let child_tf = child_tf_page.addr();
        core::mem::forget(child_tf_page);
        let mut child = parent.try_clone(child_tf, &kmem).unwrap();

        assert_eq!(child.size(), parent.size());
        for va in (0..parent.size()).step_by(PGSIZE) {
            let pa_parent = parent.page_table_mut().walk_addr(va.into()).unwrap();
            let pa_child = child.page_table_mut().walk_addr(va.into()).unwrap();
            assert_ne!(pa_parent.into_usize(), pa_child.into_usize());
        }

        let mut buf = [0u8; 12];
        child.copy_in_bytes(&mut buf, UVAddr::from(PGSIZE + 17)).unwrap();
        assert_eq!(&buf, b"shared bytes");

        release(parent, parent_tf, &kmem);
        release(child, child_tf, &kmem);
        assert_eq!(kmem.free_pages(), initial);
    }

    #[test]
    fn kernel_mirror_follows_user_growth() {
        let kmem = kmem_with(128);
        let (mut memory, tf_pa) = new_user_memory(&kmem);
        let mut kmap = KernelMemory::new_per_process(&kmem);

        memory.alloc(2 * PGSIZE, &kmem).unwrap();
        kmap.mirror_user(&mut memory, &kmem);

        // The mirrored page resolves to the same frame, without the U bit,
        // so walk_addr (a user-only lookup) must reject it.
        let user_pa = memory.page_table_mut().walk_addr(0usize.into()).unwrap();
        let pte_pa = {
            let pte = kmap.page_table.get_mut(KVAddr::from(0), None).unwrap();
            assert!(pte.is_data());
            assert!(!pte.is_user());
            pte.get_pa()
        };
        assert_eq!(user_pa.into_usize(), pte_pa.into_usize());

        let old = memory.size();
        memory.alloc(4 * PGSIZE, &kmem).unwrap();
        kmap.mirror_grow(&mut memory, old, 4 * PGSIZE, &kmem);

        kmap.mirror_shrink(4 * PGSIZE, 0);
        kmap.free_per_process(0, &kmem);
        release(memory, tf_pa, &kmem);
    }
}
