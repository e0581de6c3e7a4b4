//! UDMA descriptor rings.
//!
//! A ring owns its DMA-visible descriptor memory and a software buffer
//! table. Two free-running cursors track it: `next_to_use` is where the
//! driver posts, `next_to_clean` is where it reclaims. The consumer never
//! passes the producer; the ring is empty when the cursors are equal and
//! full when their distance reaches the usable capacity.

use alloc::vec::Vec;

use alpine_lib::{
    addr::Addr, dma_pool::DMAPool, net::net_device::EtherFrameBuf, paging::PAGESIZE, ringq::RingQ,
};

use super::buffer::PacketBuffer;
use super::moderation::ModerationState;

pub const MIN_RING_DESCS: usize = 64;
pub const MAX_RING_DESCS: usize = 16384;

/// Extra buffer-table slots kept beyond `sw_count` for descriptor
/// prefetch staging.
pub const RING_SLACK: usize = 16;

/// Frames the RX side can hold for the stack before it must consume them.
pub const RECV_QUEUE_SIZE: usize = 64;

// TX descriptor flag bits (upper half of len_flags).
pub const TXD_EOP: u32 = 1 << 16;
pub const TXD_VLAN: u32 = 1 << 17;
pub const TXD_IPV4_CSUM: u32 = 1 << 18;
pub const TXD_L4_CSUM: u32 = 1 << 19;

// RX descriptor write-back status bits.
pub const RXD_STAT_DD: u8 = 1 << 0;
pub const RXD_STAT_EOP: u8 = 1 << 1;
pub const RXD_STAT_VLAN: u8 = 1 << 2;
pub const RXD_STAT_IPV4_CSUM_OK: u8 = 1 << 3;
pub const RXD_STAT_L4_CSUM_OK: u8 = 1 << 4;
pub const RXD_STAT_L4_UDP: u8 = 1 << 5;
pub const RXD_STAT_HASH: u8 = 1 << 6;

// RX descriptor write-back error bits.
pub const RXD_ERR_CRC: u8 = 1 << 0;
pub const RXD_ERR_TRUNC: u8 = 1 << 1;
pub const RXD_ERR_CSUM: u8 = 1 << 2;

/// Transmit descriptor (16B).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct UdmaTxDesc {
    pub buf: u64,
    /// [15:0] payload length, [31:16] TXD_* flags.
    pub len_flags: u32,
    /// [15:0] VLAN tag, [23:16] L3 header offset, [31:24] L4 header offset.
    pub meta: u32,
}

/// Receive descriptor (24B). The driver fills `buf` and `len` on post;
/// the hardware writes the remaining fields back on completion.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct UdmaRxDesc {
    pub buf: u64,
    pub len: u16,
    pub vlan: u16,
    pub status: u8,
    pub error: u8,
    pub _rsvd: [u8; 2],
    pub hash: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingCreateErr {
    /// Requested size is not a power of two inside the allowed range.
    InvalidSize,
    /// DMA-visible descriptor memory could not be obtained.
    NoDescMemory,
}

fn valid_ring_size(n: usize) -> bool {
    n.is_power_of_two() && (MIN_RING_DESCS..=MAX_RING_DESCS).contains(&n)
}

fn desc_pages<T>(count: usize) -> usize {
    (count * core::mem::size_of::<T>()).div_ceil(PAGESIZE)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RxRingStats {
    pub packets: u64,
    pub bytes: u64,
    pub ring_full: u64,
    pub dropped: u64,
    pub csum_err: u64,
    pub queue_overflow: u64,
    pub alloc_fail: u64,
    pub map_fail: u64,
    /// Traffic since the last moderation decision.
    pub since_packets: u32,
    pub since_bytes: u32,
}

/// A completed RX descriptor: the slot's buffer moves out with it and the
/// slot must be refilled before the ring can post again.
pub struct CompletedRx {
    pub buffer: PacketBuffer,
    pub len: u16,
    pub status: u8,
    pub error: u8,
    pub vlan: u16,
    pub hash: u32,
}

#[derive(Debug)]
pub struct RxRing {
    id: usize,
    sw_count: usize,
    hw_count: usize,
    next_to_use: u32,
    next_to_clean: u32,
    descs: DMAPool<UdmaRxDesc>,
    bufs: Vec<Option<PacketBuffer>>,
    /// Received frames ready for consumption by the stack.
    pub read_queue: RingQ<EtherFrameBuf>,
    pub stats: RxRingStats,
    pub moderation: ModerationState,
}

impl RxRing {
    pub fn new(
        id: usize,
        sw_count: usize,
        hw_count: usize,
        numa_id: usize,
    ) -> Result<Self, RingCreateErr> {
        if !valid_ring_size(sw_count) || !valid_ring_size(hw_count) {
            return Err(RingCreateErr::InvalidSize);
        }

        let mut descs = DMAPool::<UdmaRxDesc>::new(numa_id, desc_pages::<UdmaRxDesc>(hw_count))
            .ok_or(RingCreateErr::NoDescMemory)?;

        for d in descs.as_mut_slice()[..hw_count].iter_mut() {
            *d = UdmaRxDesc::default();
        }

        let mut bufs = Vec::new();
        bufs.resize_with(sw_count + RING_SLACK, || None);

        Ok(Self {
            id,
            sw_count,
            hw_count,
            next_to_use: 0,
            next_to_clean: 0,
            descs,
            bufs,
            read_queue: RingQ::new(RECV_QUEUE_SIZE),
            stats: RxRingStats::default(),
            moderation: ModerationState::new(),
        })
    }

    #[inline(always)]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline(always)]
    pub fn sw_count(&self) -> usize {
        self.sw_count
    }

    #[inline(always)]
    pub fn hw_count(&self) -> usize {
        self.hw_count
    }

    pub fn desc_base(&self) -> alpine_lib::addr::phy_addr::PhyAddr {
        self.descs.get_phy_addr()
    }

    /// Usable capacity: bounded by the buffer table and by the number of
    /// hardware descriptors.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        core::cmp::min(self.sw_count, self.hw_count)
    }

    #[inline(always)]
    fn in_flight(&self) -> usize {
        self.next_to_use.wrapping_sub(self.next_to_clean) as usize
    }

    #[inline(always)]
    pub fn available_slots(&self) -> usize {
        self.capacity() - self.in_flight()
    }

    /// Producer tail for the doorbell register: the free-running post
    /// count. The hardware masks it to a descriptor index itself, which
    /// keeps a completely full ring distinguishable from an empty one.
    #[inline(always)]
    pub fn tail(&self) -> u32 {
        self.next_to_use
    }

    /// Attach a freshly allocated buffer to the next free slot. On a full
    /// ring the buffer is handed back so the caller can return it to the
    /// pool; this is the expected soft-failure path under load.
    pub fn post_rx_buffer(&mut self, buf: PacketBuffer) -> Result<(), PacketBuffer> {
        if self.available_slots() == 0 {
            self.stats.ring_full += 1;
            return Err(buf);
        }

        let hw_idx = (self.next_to_use as usize) & (self.hw_count - 1);
        let sw_idx = (self.next_to_use as usize) & (self.sw_count - 1);

        let desc = UdmaRxDesc {
            buf: buf.dma_address().as_usize() as u64,
            len: buf.capacity() as u16,
            ..UdmaRxDesc::default()
        };
        unsafe {
            core::ptr::write_volatile(&mut self.descs.as_mut_slice()[hw_idx], desc);
        }

        debug_assert!(self.bufs[sw_idx].is_none());
        self.bufs[sw_idx] = Some(buf);
        self.next_to_use = self.next_to_use.wrapping_add(1);

        Ok(())
    }

    /// Reclaim a single completed descriptor, if any.
    pub fn reclaim_one(&mut self) -> Option<CompletedRx> {
        if self.next_to_clean == self.next_to_use {
            return None;
        }

        let hw_idx = (self.next_to_clean as usize) & (self.hw_count - 1);
        let desc = unsafe { core::ptr::read_volatile(&self.descs.as_slice()[hw_idx]) };

        if desc.status & RXD_STAT_DD == 0 {
            return None;
        }

        let sw_idx = (self.next_to_clean as usize) & (self.sw_count - 1);
        let buffer = self.bufs[sw_idx].take()?;

        self.next_to_clean = self.next_to_clean.wrapping_add(1);

        Some(CompletedRx {
            buffer,
            len: desc.len,
            status: desc.status,
            error: desc.error,
            vlan: desc.vlan,
            hash: desc.hash,
        })
    }

    /// Reclaim up to `max` completed descriptors, in posting order.
    pub fn reclaim_completed(&mut self, max: usize) -> RxReclaim<'_> {
        RxReclaim {
            ring: self,
            remaining: max,
        }
    }

    /// Return the ring to its empty state without releasing descriptor
    /// memory; still-posted buffers are dropped.
    pub fn reset(&mut self) {
        for d in self.descs.as_mut_slice()[..self.hw_count].iter_mut() {
            unsafe { core::ptr::write_volatile(d, UdmaRxDesc::default()) };
        }
        for b in self.bufs.iter_mut() {
            *b = None;
        }
        while self.read_queue.pop().is_some() {}

        self.next_to_use = 0;
        self.next_to_clean = 0;
        self.stats.since_packets = 0;
        self.stats.since_bytes = 0;
    }
}

pub struct RxReclaim<'a> {
    ring: &'a mut RxRing,
    remaining: usize,
}

impl Iterator for RxReclaim<'_> {
    type Item = CompletedRx;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.ring.reclaim_one()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TxRingStats {
    pub packets: u64,
    pub bytes: u64,
    pub ring_full: u64,
    /// Traffic since the last moderation decision.
    pub since_packets: u32,
    pub since_bytes: u32,
}

pub struct CompletedTx {
    pub buffer: PacketBuffer,
    pub bytes: u32,
}

#[derive(Debug)]
pub struct TxRing {
    id: usize,
    sw_count: usize,
    hw_count: usize,
    next_to_use: u32,
    next_to_clean: u32,
    descs: DMAPool<UdmaTxDesc>,
    bufs: Vec<Option<(PacketBuffer, u32)>>,
    pub stats: TxRingStats,
    pub moderation: ModerationState,
}

impl TxRing {
    pub fn new(
        id: usize,
        sw_count: usize,
        hw_count: usize,
        numa_id: usize,
    ) -> Result<Self, RingCreateErr> {
        if !valid_ring_size(sw_count) || !valid_ring_size(hw_count) {
            return Err(RingCreateErr::InvalidSize);
        }

        let mut descs = DMAPool::<UdmaTxDesc>::new(numa_id, desc_pages::<UdmaTxDesc>(hw_count))
            .ok_or(RingCreateErr::NoDescMemory)?;

        for d in descs.as_mut_slice()[..hw_count].iter_mut() {
            *d = UdmaTxDesc::default();
        }

        let mut bufs = Vec::new();
        bufs.resize_with(sw_count + RING_SLACK, || None);

        Ok(Self {
            id,
            sw_count,
            hw_count,
            next_to_use: 0,
            next_to_clean: 0,
            descs,
            bufs,
            stats: TxRingStats::default(),
            moderation: ModerationState::new(),
        })
    }

    #[inline(always)]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline(always)]
    pub fn sw_count(&self) -> usize {
        self.sw_count
    }

    #[inline(always)]
    pub fn hw_count(&self) -> usize {
        self.hw_count
    }

    pub fn desc_base(&self) -> alpine_lib::addr::phy_addr::PhyAddr {
        self.descs.get_phy_addr()
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        core::cmp::min(self.sw_count, self.hw_count)
    }

    #[inline(always)]
    fn in_flight(&self) -> usize {
        self.next_to_use.wrapping_sub(self.next_to_clean) as usize
    }

    #[inline(always)]
    pub fn available_slots(&self) -> usize {
        self.capacity() - self.in_flight()
    }

    /// Producer tail for the doorbell register, free running as on the
    /// RX side.
    #[inline(always)]
    pub fn tail(&self) -> u32 {
        self.next_to_use
    }

    /// Producer cursor, free running. The watchdog compares the consumer
    /// cursor against it across ticks to detect a stalled queue.
    #[inline(always)]
    pub fn cursors(&self) -> (u32, u32) {
        (self.next_to_use, self.next_to_clean)
    }

    /// Post one frame held in `buf`. `len` is the payload length; `flags`
    /// and `meta` carry the TXD_* bits and offload metadata.
    pub fn post(
        &mut self,
        buf: PacketBuffer,
        len: usize,
        flags: u32,
        meta: u32,
    ) -> Result<(), PacketBuffer> {
        if self.available_slots() == 0 {
            self.stats.ring_full += 1;
            return Err(buf);
        }

        let hw_idx = (self.next_to_use as usize) & (self.hw_count - 1);
        let sw_idx = (self.next_to_use as usize) & (self.sw_count - 1);

        let desc = UdmaTxDesc {
            buf: buf.dma_address().as_usize() as u64,
            len_flags: (len as u32 & 0xffff) | flags | TXD_EOP,
            meta,
        };
        unsafe {
            core::ptr::write_volatile(&mut self.descs.as_mut_slice()[hw_idx], desc);
        }

        debug_assert!(self.bufs[sw_idx].is_none());
        self.bufs[sw_idx] = Some((buf, len as u32));
        self.next_to_use = self.next_to_use.wrapping_add(1);

        self.stats.packets += 1;
        self.stats.bytes += len as u64;
        self.stats.since_packets += 1;
        self.stats.since_bytes += len as u32;

        Ok(())
    }

    /// Reclaim descriptors the hardware has consumed. `hw_head` is the
    /// free-running completion count read from the device; reclaim stops
    /// there, at `max`, or at the producer cursor, whichever is first.
    pub fn reclaim_completed(&mut self, hw_head: u32, max: usize) -> TxReclaim<'_> {
        TxReclaim {
            ring: self,
            hw_head,
            remaining: max,
        }
    }

    pub fn reset(&mut self) {
        for d in self.descs.as_mut_slice()[..self.hw_count].iter_mut() {
            unsafe { core::ptr::write_volatile(d, UdmaTxDesc::default()) };
        }
        for b in self.bufs.iter_mut() {
            *b = None;
        }

        self.next_to_use = 0;
        self.next_to_clean = 0;
        self.stats.since_packets = 0;
        self.stats.since_bytes = 0;
    }
}

pub struct TxReclaim<'a> {
    ring: &'a mut TxRing,
    hw_head: u32,
    remaining: usize,
}

impl Iterator for TxReclaim<'_> {
    type Item = CompletedTx;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let ring = &mut self.ring;
        if ring.next_to_clean == self.hw_head || ring.next_to_clean == ring.next_to_use {
            return None;
        }

        let sw_idx = (ring.next_to_clean as usize) & (ring.sw_count - 1);
        let (buffer, bytes) = ring.bufs[sw_idx].take()?;
        ring.next_to_clean = ring.next_to_clean.wrapping_add(1);
        self.remaining -= 1;

        Some(CompletedTx { buffer, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth::buffer::{BufferPolicyKind, BufferPool};
    use alpine_lib::{dma_map::DmaTag, dma_pool, paging::PAGESIZE};

    fn seed() -> BufferPool {
        dma_pool::init_dma_pool_from_heap(0, 1024 * PAGESIZE);
        BufferPool::new(BufferPolicyKind::Page, 0, DmaTag::new_64bit(), 2048, 32)
    }

    fn complete_rx(ring: &mut RxRing, n: usize, len: u16) {
        // Play the device: mark the next `n` posted descriptors done.
        for i in 0..n {
            let idx = (ring.next_to_clean as usize + i) & (ring.hw_count - 1);
            let mut d = unsafe { core::ptr::read_volatile(&ring.descs.as_slice()[idx]) };
            d.status = RXD_STAT_DD | RXD_STAT_EOP;
            d.len = len;
            unsafe { core::ptr::write_volatile(&mut ring.descs.as_mut_slice()[idx], d) };
        }
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        assert_eq!(
            RxRing::new(0, 100, 256, 0).unwrap_err(),
            RingCreateErr::InvalidSize
        );
        assert_eq!(
            RxRing::new(0, 256, 32, 0).unwrap_err(),
            RingCreateErr::InvalidSize
        );
        assert_eq!(
            TxRing::new(0, 32768, 256, 0).unwrap_err(),
            RingCreateErr::InvalidSize
        );
    }

    #[test]
    fn test_rx_fill_to_capacity() {
        let mut pool = seed();
        let mut ring = RxRing::new(0, 256, 256, 0).unwrap();

        assert_eq!(ring.available_slots(), 256);

        for _ in 0..256 {
            let buf = pool.allocate().unwrap();
            ring.post_rx_buffer(buf).unwrap();
        }

        assert_eq!(ring.available_slots(), 0);

        // One more post must fail softly and hand the buffer back.
        let buf = pool.allocate().unwrap();
        let buf = ring.post_rx_buffer(buf).unwrap_err();
        pool.release(buf);
        assert_eq!(ring.stats.ring_full, 1);
    }

    #[test]
    fn test_rx_invariant_under_interleaving() {
        let mut pool = seed();
        let mut ring = RxRing::new(0, 64, 64, 0).unwrap();

        let cap = ring.capacity();
        for round in 0..10 {
            let posts = 3 + (round % 5);
            for _ in 0..posts {
                if ring.available_slots() == 0 {
                    break;
                }
                ring.post_rx_buffer(pool.allocate().unwrap()).unwrap();
            }

            let completions = 1 + (round % 3);
            let to_complete = completions.min(ring.in_flight());
            complete_rx(&mut ring, to_complete, 64);

            for done in ring.reclaim_completed(completions) {
                pool.release(done.buffer);
            }

            // next_to_clean never passes next_to_use, and the accounting
            // identity holds at every step.
            assert!(ring.in_flight() <= cap);
            assert_eq!(ring.available_slots() + ring.in_flight(), cap);
        }
    }

    #[test]
    fn test_rx_reclaim_stops_at_incomplete() {
        let mut pool = seed();
        let mut ring = RxRing::new(0, 64, 64, 0).unwrap();

        for _ in 0..8 {
            ring.post_rx_buffer(pool.allocate().unwrap()).unwrap();
        }

        complete_rx(&mut ring, 3, 128);

        let done: alloc::vec::Vec<_> = ring.reclaim_completed(64).collect();
        assert_eq!(done.len(), 3);
        for c in done {
            assert_eq!(c.len, 128);
            pool.release(c.buffer);
        }

        // Nothing more is completed, so the iterator yields nothing even
        // with budget left.
        assert_eq!(ring.reclaim_completed(64).count(), 0);
    }

    #[test]
    fn test_rx_reset_empties_ring() {
        let mut pool = seed();
        let mut ring = RxRing::new(0, 64, 64, 0).unwrap();

        for _ in 0..10 {
            ring.post_rx_buffer(pool.allocate().unwrap()).unwrap();
        }
        ring.reset();

        assert_eq!(ring.available_slots(), ring.capacity());
        assert_eq!(ring.reclaim_completed(64).count(), 0);
    }

    #[test]
    fn test_tx_post_and_reclaim_in_order() {
        let mut pool = seed();
        let mut ring = TxRing::new(0, 64, 64, 0).unwrap();

        for i in 0..5 {
            let mut buf = pool.allocate().unwrap();
            buf.write(&[i as u8; 60]);
            ring.post(buf, 60, 0, 0).unwrap();
        }

        // Device consumed three descriptors.
        let done: alloc::vec::Vec<_> = ring.reclaim_completed(3, usize::MAX).collect();
        assert_eq!(done.len(), 3);
        for (i, c) in done.into_iter().enumerate() {
            assert_eq!(c.bytes, 60);
            assert_eq!(unsafe { c.buffer.as_slice(1)[0] }, i as u8);
            pool.release(c.buffer);
        }

        // The consumer cannot pass the device head.
        assert_eq!(ring.reclaim_completed(3, usize::MAX).count(), 0);
    }

    #[test]
    fn test_tx_ring_full() {
        let mut pool = seed();
        let mut ring = TxRing::new(0, 64, 64, 0).unwrap();

        for _ in 0..64 {
            let buf = pool.allocate().unwrap();
            ring.post(buf, 60, 0, 0).unwrap();
        }

        let buf = pool.allocate().unwrap();
        let buf = ring.post(buf, 60, 0, 0).unwrap_err();
        pool.release(buf);
        assert_eq!(ring.stats.ring_full, 1);
    }
}
