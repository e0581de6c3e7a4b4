//! Memory pool for DMA.

use core::{alloc::Layout, ptr::NonNull};

use rlsf::Tlsf;

use crate::{
    addr::{phy_addr::PhyAddr, virt_addr::VirtAddr, Addr},
    paging::{self, PAGESIZE},
    sync::{mcs::MCSNode, mutex::Mutex},
};

const FLLEN: usize = 26; // The maximum pool block is (32 << 26) - 1, nearly 2GiB.
const SLLEN: usize = 32;
type FLBitmap = u32; // must cover FLLEN
type SLBitmap = u32; // must cover SLLEN

type TlsfAlloc = Tlsf<'static, FLBitmap, SLBitmap, FLLEN, SLLEN>;

pub const NUMA_NODE_MAX: usize = 4;

static DMA_POOL: [Mutex<TlsfAlloc>; NUMA_NODE_MAX] =
    [const { Mutex::new(Tlsf::new()) }; NUMA_NODE_MAX];

/// Donate `size` bytes of device-reachable memory starting at `start` to the
/// DMA pool of `numa_id`.
///
/// # Safety
///
/// `start` must point to `size` bytes of valid memory that nothing else
/// allocates from, and the region must be visible to the device.
pub unsafe fn init_dma_pool(numa_id: usize, start: VirtAddr, size: usize) {
    assert!(numa_id < NUMA_NODE_MAX);

    let pool = core::slice::from_raw_parts_mut(start.as_mut_ptr::<u8>(), size);

    let Some(pool) = NonNull::new(pool as *mut [u8]) else {
        return;
    };

    let mut node = MCSNode::new();
    let mut guard = DMA_POOL[numa_id].lock(&mut node);
    guard.insert_free_block_ptr(pool);
}

/// Grow the pool of `numa_id` with `size` bytes taken from the global heap.
///
/// Intended for hosted environments and tests, where no platform carve-out
/// exists. The donated memory is never returned to the heap.
pub fn init_dma_pool_from_heap(numa_id: usize, size: usize) {
    let Ok(layout) = Layout::from_size_align(size, PAGESIZE) else {
        return;
    };

    let ptr = unsafe { alloc::alloc::alloc(layout) };
    if ptr.is_null() {
        log::warn!("dma_pool: failed to reserve {size} bytes from the heap");
        return;
    }

    unsafe { init_dma_pool(numa_id, VirtAddr::new(ptr as usize), size) };
}

/// Page-aligned, physically contiguous memory holding `count` elements of
/// `T`, as many as fit the allocation.
#[derive(Debug)]
pub struct DMAPool<T> {
    virt_addr: VirtAddr,
    phy_addr: PhyAddr,
    size: usize,
    count: usize,
    numa_id: usize,
    ptr: NonNull<T>,
}

unsafe impl<T: Send> Send for DMAPool<T> {}
unsafe impl<T: Sync> Sync for DMAPool<T> {}

impl<T> DMAPool<T> {
    pub fn new(numa_id: usize, pages: usize) -> Option<Self> {
        assert!(numa_id < NUMA_NODE_MAX);
        assert!(core::mem::size_of::<T>() > 0);
        assert!(core::mem::size_of::<T>() <= pages * PAGESIZE);
        assert!(core::mem::align_of::<T>() <= PAGESIZE);

        let size = pages * PAGESIZE;
        let layout = Layout::from_size_align(size, PAGESIZE).ok()?;

        let mut node = MCSNode::new();

        let pool = {
            let mut allocator = DMA_POOL[numa_id].lock(&mut node);
            allocator.allocate(layout)?
        };

        let virt_addr = VirtAddr::new(pool.as_ptr() as usize);
        let phy_addr = paging::vm_to_phy(virt_addr)?;
        let ptr = NonNull::new(pool.as_ptr() as *mut T)?;
        let count = size / core::mem::size_of::<T>();

        Some(Self {
            virt_addr,
            phy_addr,
            size,
            count,
            numa_id,
            ptr,
        })
    }

    #[inline(always)]
    pub fn get_virt_addr(&self) -> VirtAddr {
        self.virt_addr
    }

    #[inline(always)]
    pub fn get_phy_addr(&self) -> PhyAddr {
        self.phy_addr
    }

    #[inline(always)]
    pub fn get_size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn get_count(&self) -> usize {
        self.count
    }

    #[inline(always)]
    pub fn get_numa_id(&self) -> usize {
        self.numa_id
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.count) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.count) }
    }
}

impl<T> AsRef<T> for DMAPool<T> {
    fn as_ref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> AsMut<T> for DMAPool<T> {
    fn as_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for DMAPool<T> {
    fn drop(&mut self) {
        let ptr = self.virt_addr.as_mut_ptr::<u8>();
        let mut node = MCSNode::new();
        let mut allocator = DMA_POOL[self.numa_id].lock(&mut node);
        unsafe {
            allocator.deallocate(NonNull::new_unchecked(ptr), PAGESIZE);
        }
    }
}
