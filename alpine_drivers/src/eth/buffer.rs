//! Packet buffer pool.
//!
//! One allocation abstraction with three interchangeable backing
//! strategies: whole pages, sub-page fragments carved from shared pages,
//! and exact-fit allocations. Every buffer handed out is already mapped
//! for the device; the mapping step fails separately from allocation and
//! is accounted separately, so "out of memory" and "out of mapping space"
//! stay distinguishable in the statistics.
//!
//! Released transmit buffers are parked in a bounded recycle cache and
//! handed back out to the RX refill path instead of being freed.

use alloc::sync::Arc;

use alpine_lib::{
    addr::{phy_addr::PhyAddr, Addr},
    dma_map::{DmaMap, DmaSegment, DmaTag},
    dma_pool::DMAPool,
    paging::PAGESIZE,
    ringq::RingQ,
};

/// Buffer sizes are clamped to amortize allocation cost on small MTUs and
/// bound descriptor sizes on large ones.
pub const RX_BUF_SIZE_MIN: usize = 1024;
pub const RX_BUF_SIZE_MAX: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPolicyKind {
    /// Whole pages per buffer.
    Page,
    /// Sub-page fragments packed into shared pages.
    Frag,
    /// Exact-fit allocation per buffer.
    Whole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAllocErr {
    OutOfMemory,
    DmaMapping,
}

impl core::fmt::Display for BufferAllocErr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "buffer memory exhausted"),
            Self::DmaMapping => write!(f, "DMA mapping failure"),
        }
    }
}

#[derive(Debug)]
enum Backing {
    Page(DMAPool<u8>),
    Whole(DMAPool<u8>),
    Frag {
        page: Arc<DMAPool<u8>>,
        offset: usize,
    },
}

/// An owned, device-mapped packet buffer.
///
/// Ownership moves with the buffer: a ring holds it while posted, the
/// completion path moves it out, and only the pool can hand it out again.
#[derive(Debug)]
pub struct PacketBuffer {
    backing: Backing,
    capacity: usize,
    seg: DmaSegment,
    #[allow(dead_code)]
    map: DmaMap,
}

impl PacketBuffer {
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    pub fn dma_address(&self) -> PhyAddr {
        self.seg.ds_addr
    }

    fn virt(&self) -> *mut u8 {
        match &self.backing {
            Backing::Page(pool) | Backing::Whole(pool) => pool.get_virt_addr().as_mut_ptr(),
            Backing::Frag { page, offset } => unsafe {
                page.get_virt_addr().as_mut_ptr::<u8>().add(*offset)
            },
        }
    }

    /// Copy `data` into the buffer.
    pub fn write(&mut self, data: &[u8]) {
        assert!(data.len() <= self.capacity);
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.virt(), data.len());
        }
    }

    /// View the first `len` bytes of the payload.
    ///
    /// # Safety
    ///
    /// The caller must know that `len` bytes have been written, by the
    /// device or via [`Self::write`].
    pub unsafe fn as_slice(&self, len: usize) -> &[u8] {
        assert!(len <= self.capacity);
        core::slice::from_raw_parts(self.virt(), len)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BufferPoolStats {
    pub allocated: u64,
    pub released: u64,
    pub recycled: u64,
    pub oom: u64,
    pub map_failures: u64,
    /// Buffers currently out of the pool's hands.
    pub outstanding: u64,
}

pub struct BufferPool {
    policy: BufferPolicyKind,
    numa_id: usize,
    tag: DmaTag,
    buf_size: usize,
    frag_cursor: Option<(Arc<DMAPool<u8>>, usize)>,
    recycle: RingQ<PacketBuffer>,
    pub stats: BufferPoolStats,
}

impl BufferPool {
    /// `size_hint` is derived from the MTU plus frame overhead and gets
    /// clamped to the configured bounds.
    pub fn new(
        policy: BufferPolicyKind,
        numa_id: usize,
        tag: DmaTag,
        size_hint: usize,
        recycle_capacity: usize,
    ) -> Self {
        let buf_size = size_hint.clamp(RX_BUF_SIZE_MIN, RX_BUF_SIZE_MAX);

        Self {
            policy,
            numa_id,
            tag,
            buf_size,
            frag_cursor: None,
            recycle: RingQ::new(recycle_capacity.max(1)),
            stats: BufferPoolStats::default(),
        }
    }

    #[inline(always)]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    fn frag_size(&self) -> usize {
        self.buf_size.next_power_of_two()
    }

    fn alloc_backing(&mut self) -> Option<(Backing, usize)> {
        match self.policy {
            BufferPolicyKind::Page => {
                let pages = self.buf_size.div_ceil(PAGESIZE);
                let pool = DMAPool::<u8>::new(self.numa_id, pages)?;
                let capacity = pool.get_size();
                Some((Backing::Page(pool), capacity))
            }
            BufferPolicyKind::Whole => {
                let pages = self.buf_size.div_ceil(PAGESIZE);
                let pool = DMAPool::<u8>::new(self.numa_id, pages)?;
                Some((Backing::Whole(pool), self.buf_size))
            }
            BufferPolicyKind::Frag => {
                let frag_size = self.frag_size();
                if frag_size >= PAGESIZE {
                    let pages = frag_size.div_ceil(PAGESIZE);
                    let pool = DMAPool::<u8>::new(self.numa_id, pages)?;
                    let capacity = pool.get_size();
                    return Some((Backing::Page(pool), capacity));
                }

                let (page, offset) = match self.frag_cursor.take() {
                    Some(cursor) if cursor.1 + frag_size <= PAGESIZE => cursor,
                    _ => (Arc::new(DMAPool::<u8>::new(self.numa_id, 1)?), 0),
                };

                let backing = Backing::Frag {
                    page: page.clone(),
                    offset,
                };
                self.frag_cursor = Some((page, offset + frag_size));

                Some((backing, frag_size))
            }
        }
    }

    /// Obtain one mapped buffer, preferring the recycle cache.
    pub fn allocate(&mut self) -> Result<PacketBuffer, BufferAllocErr> {
        if let Some(buf) = self.recycle.pop() {
            if buf.capacity() >= self.buf_size {
                self.stats.recycled += 1;
                self.stats.outstanding += 1;
                return Ok(buf);
            }
            // Stale size (e.g. after an MTU change); fall through and let
            // it drop.
        }

        let Some((backing, capacity)) = self.alloc_backing() else {
            self.stats.oom += 1;
            return Err(BufferAllocErr::OutOfMemory);
        };

        let vaddr = match &backing {
            Backing::Page(pool) | Backing::Whole(pool) => pool.get_virt_addr(),
            Backing::Frag { page, offset } => page.get_virt_addr() + *offset,
        };

        let mut map = DmaMap::new(self.tag);
        if map.load(vaddr, capacity).is_err() {
            self.stats.map_failures += 1;
            return Err(BufferAllocErr::DmaMapping);
        }

        let seg = match map.segment() {
            Ok(seg) => seg,
            Err(_) => {
                self.stats.map_failures += 1;
                return Err(BufferAllocErr::DmaMapping);
            }
        };

        self.stats.allocated += 1;
        self.stats.outstanding += 1;

        Ok(PacketBuffer {
            backing,
            capacity,
            seg,
            map,
        })
    }

    /// Return a buffer to the pool. It lands in the recycle cache when
    /// there is room, otherwise its memory is freed.
    pub fn release(&mut self, buf: PacketBuffer) {
        self.stats.released += 1;
        self.stats.outstanding = self.stats.outstanding.saturating_sub(1);

        // Full cache: let the buffer drop.
        let _ = self.recycle.push(buf);
    }
}
