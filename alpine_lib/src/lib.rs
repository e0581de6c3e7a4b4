#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

#[cfg(all(not(feature = "std"), test))]
extern crate std;

pub mod addr;
pub mod delay;
pub mod dma_map;
pub mod dma_pool;
pub mod interrupt;
pub mod net;
pub mod paging;
pub mod ringq;
pub mod sync;

#[cfg(feature = "std")]
pub const IS_STD: bool = true;

#[cfg(not(feature = "std"))]
pub const IS_STD: bool = false;
