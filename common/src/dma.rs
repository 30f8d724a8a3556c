//! Physically contiguous, page-backed allocations for DMA rings and PRP
//! scratch tables. Ported from the Redox `common` crate's `Dma<T>`: a single
//! `physalloc`/`physmap` pair backs the allocation, `physical()` hands the
//! bus address to the device and `Deref`/`DerefMut` hand the kernel-virtual
//! view to the driver.

use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};

use syscall::error::Result;
use syscall::{physalloc, physfree, physmap, physunmap, PhysmapFlags};

pub struct Dma<T: ?Sized> {
    phys: usize,
    virt: *mut T,
    bytes: usize,
}

unsafe impl<T: ?Sized + Send> Send for Dma<T> {}
unsafe impl<T: ?Sized + Send> Sync for Dma<T> {}

impl<T> Dma<T> {
    /// Allocates room for a single `T`, leaving it uninitialized.
    pub unsafe fn zeroed() -> Result<Dma<MaybeUninit<T>>> {
        let bytes = core::mem::size_of::<T>();
        Dma::<MaybeUninit<T>>::alloc(bytes.max(1))
    }
}

impl<T> Dma<MaybeUninit<T>> {
    fn alloc(bytes: usize) -> Result<Self> {
        let phys = physalloc(bytes)?;
        let virt = unsafe { physmap(phys, bytes, PhysmapFlags::PHYSMAP_WRITE)? } as *mut MaybeUninit<T>;
        unsafe {
            core::ptr::write_bytes(virt as *mut u8, 0, bytes);
        }
        Ok(Dma {
            phys,
            virt,
            bytes,
        })
    }

    /// Caller asserts the buffer has been fully initialized (zero-fill from
    /// `alloc` already satisfies this for POD command/result structures).
    pub unsafe fn assume_init(self) -> Dma<T> {
        let out = Dma {
            phys: self.phys,
            virt: self.virt as *mut T,
            bytes: self.bytes,
        };
        core::mem::forget(self);
        out
    }
}

impl<T> Dma<[T]> {
    /// Allocates a physically contiguous slice of `len` zeroed elements.
    pub fn zeroed_slice(len: usize) -> Result<Dma<[MaybeUninit<T>]>> {
        let bytes = core::mem::size_of::<T>() * len;
        let phys = physalloc(bytes.max(1))?;
        let virt = unsafe { physmap(phys, bytes.max(1), PhysmapFlags::PHYSMAP_WRITE)? };
        unsafe {
            core::ptr::write_bytes(virt as *mut u8, 0, bytes);
        }
        let slice = unsafe {
            core::slice::from_raw_parts_mut(virt as *mut MaybeUninit<T>, len)
        };
        Ok(Dma {
            phys,
            virt: slice as *mut [MaybeUninit<T>],
            bytes,
        })
    }
}

impl<T> Dma<[MaybeUninit<T>]> {
    pub unsafe fn assume_init(self) -> Dma<[T]> {
        let len = (*self.virt).len();
        let out = Dma {
            phys: self.phys,
            virt: core::slice::from_raw_parts_mut(self.virt as *mut T, len) as *mut [T],
            bytes: self.bytes,
        };
        core::mem::forget(self);
        out
    }
}

impl<T: ?Sized> Dma<T> {
    pub fn physical(&self) -> usize {
        self.phys
    }
}

impl<T: ?Sized> Deref for Dma<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.virt }
    }
}

impl<T: ?Sized> DerefMut for Dma<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.virt }
    }
}

impl<T: ?Sized> Drop for Dma<T> {
    fn drop(&mut self) {
        unsafe {
            let _ = physunmap(self.virt as *mut u8 as usize);
            let _ = physfree(self.phys, self.bytes.max(1));
        }
    }
}
