//! Register-access and DMA-allocation primitives shared by the NVMe driver
//! crates. Kept deliberately small: this crate exists only to give the
//! hardware-facing code a single place to get volatile MMIO access and
//! physically contiguous memory from, the way the upstream Redox `common`
//! crate does for every PCI driver in the tree.

pub mod dma;
pub mod io;

pub use dma::Dma;
pub use io::{Io, Mmio};
