use core::cell::UnsafeCell;
use core::ops::{BitAnd, BitOr, Not};
use core::ptr;

/// Common interface for a single hardware register, whether memory-mapped or
/// accessed through port I/O. Mirrors the historical Redox `common::io::Io`
/// trait so driver code can stay agnostic to which backing it is given.
pub trait Io {
    type Value: Copy + PartialEq + BitAnd<Output = Self::Value> + BitOr<Output = Self::Value> + Not<Output = Self::Value>;

    fn read(&self) -> Self::Value;
    fn write(&mut self, value: Self::Value);

    #[inline(always)]
    fn readf(&self, flags: Self::Value) -> bool {
        (self.read() & flags) == flags
    }

    #[inline(always)]
    fn writef(&mut self, flags: Self::Value, value: bool) {
        let tmp: Self::Value = if value {
            self.read() | flags
        } else {
            self.read() & !flags
        };
        self.write(tmp);
    }
}

/// A memory-mapped register of type `T`. Every access goes through
/// `read_volatile`/`write_volatile` so the compiler can never reorder or
/// elide accesses to device memory.
#[repr(transparent)]
pub struct Mmio<T> {
    value: UnsafeCell<T>,
}

impl<T> Mmio<T> {
    /// Constructs a zeroed `Mmio<T>`. Only sound when placed over memory the
    /// device itself owns (a BAR mapping), never a plain heap value.
    pub unsafe fn zeroed() -> Self {
        Mmio {
            value: core::mem::zeroed(),
        }
    }
}

impl<T: Copy> Io for Mmio<T> {
    type Value = T;

    #[inline(always)]
    fn read(&self) -> T {
        unsafe { ptr::read_volatile(self.value.get()) }
    }

    #[inline(always)]
    fn write(&mut self, value: T) {
        unsafe { ptr::write_volatile(self.value.get(), value) }
    }
}

unsafe impl<T> Send for Mmio<T> {}
unsafe impl<T> Sync for Mmio<T> {}
