//! # Annapurna Labs Alpine Ethernet controller
//!
//! Driver core for the Alpine family's integrated Ethernet units: UDMA
//! descriptor rings, adaptive interrupt moderation, RX forwarding and
//! flow steering, and the up/down/reset lifecycle. Register access goes
//! through the [`hal::EthHal`] capability contract; PCIe link training,
//! SerDes lane management and the register-level HAL live elsewhere.

use alloc::{
    borrow::Cow,
    boxed::Box,
    collections::{BTreeMap, BTreeSet},
    format,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicBool, Ordering};

use memoffset::offset_of;

use alpine_lib::{
    delay,
    dma_map::DmaTag,
    interrupt::{self, IrqError, IRQ},
    net::{
        ether::{
            extract_headers, NetworkHdr, TransportHdr, UDPHdr, ETHER_CRC_LEN, ETHER_HDR_LEN,
            TCPHdr,
        },
        net_device::{
            EtherFrameBuf, EtherFrameRef, LinkStatus, NetCapabilities, NetDevError, NetDevice,
            NetFlags, PacketHeaderFlags,
        },
    },
    sync::{
        mutex::{MCSNode, Mutex},
        rwlock::{RwLock, RwLockWriteGuard},
    },
};

pub mod buffer;
pub mod events;
pub mod hal;
pub mod live_update;
pub mod moderation;
pub mod ring;
pub mod steering;

use buffer::{BufferAllocErr, BufferPolicyKind, BufferPool};
use events::{CollectMode, ErrEvents, ErrorCounters};
use hal::{
    EthHal, FlowRule, HalError, IoficGroup, LinkParams, MacCounter, MacMode, QueueParams,
    RingDirection, FlowControlParams, INT_GROUP_A_LINK_CHANGE, INT_GROUP_D_MAC_PARITY,
    INT_GROUP_D_UDMA_AXI,
};
use moderation::{
    default_base_interval_usec, default_moderation_table, CoalescingMode, ModerationTable,
};
use ring::{
    RingCreateErr, RxRing, RxRingStats, TxRing, TxRingStats, RXD_ERR_CSUM, RXD_STAT_EOP,
    RXD_STAT_HASH, RXD_STAT_IPV4_CSUM_OK, RXD_STAT_L4_CSUM_OK, RXD_STAT_L4_UDP, RXD_STAT_VLAN,
    TXD_IPV4_CSUM, TXD_L4_CSUM, TXD_VLAN,
};
use steering::{BackupPhase, RxForwarding, SteeringErr};

const DEVICE_NAME: &str = "Annapurna Labs Alpine Ethernet Adapter";
const DEVICE_SHORT_NAME: &str = "al_eth";

pub const MAX_NUM_MULTICAST_ADDRESSES: usize = 128;

/// Completion budget used by the interrupt-driven poll path.
pub const POLL_BUDGET: usize = 64;

/// Service ticks a TX queue may sit non-empty without progress before the
/// watchdog escalates to a full reset.
const TX_TIMEOUT_TICKS: u32 = 5;

/// Bounded retry for the configuration lock; gives up early when a close
/// is already in progress.
const CONFIG_LOCK_RETRIES: usize = 200;

const RECYCLE_CACHE_SIZE: usize = 128;

const DEFAULT_RING_DESCS: usize = 512;

const MIN_MTU: usize = 68;
const MAX_MTU: usize = 9216;

fn buf_size_for_mtu(mtu: usize) -> usize {
    // Frame plus VLAN tag and trailing CRC; the pool clamps further.
    mtu + ETHER_HDR_LEN + ETHER_CRC_LEN + 4
}

/// Compute-once runtime configuration shared by all adapter instances,
/// passed by reference into [`attach`].
#[derive(Debug, Clone)]
pub struct AdapterRuntimeConfig {
    pub num_queues: usize,
    pub numa_id: usize,
    pub mtu: usize,
    pub mac_addr: [u8; 6],
    pub mac_mode: MacMode,
    pub link_speed_mbps: u32,
    pub buffer_policy: BufferPolicyKind,
    pub dma_tag: DmaTag,
    pub rx_descs_sw: usize,
    pub rx_descs_hw: usize,
    pub tx_descs_sw: usize,
    pub tx_descs_hw: usize,
    pub moderation_table: ModerationTable,
}

impl AdapterRuntimeConfig {
    pub fn new() -> Self {
        Self {
            num_queues: 4,
            numa_id: 0,
            mtu: 1500,
            mac_addr: [0x02, 0xa1, 0x70, 0x00, 0x00, 0x01],
            mac_mode: MacMode::TenGSerial,
            link_speed_mbps: 10_000,
            buffer_policy: BufferPolicyKind::Page,
            dma_tag: DmaTag::new_64bit(),
            rx_descs_sw: DEFAULT_RING_DESCS,
            rx_descs_hw: DEFAULT_RING_DESCS,
            tx_descs_sw: DEFAULT_RING_DESCS,
            tx_descs_hw: DEFAULT_RING_DESCS,
            moderation_table: default_moderation_table(default_base_interval_usec()),
        }
    }
}

impl Default for AdapterRuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum AlEthDriverErr {
    DescRingAlloc,
    BufferAlloc,
    DmaMapping,
    InvalidRingSize,
    InvalidQueue,
    QueueConfig(RingDirection, usize),
    InterruptSetup,
    Range,
    UnsupportedProtocol,
    NoFreeSlot,
    Busy,
    Param,
    NotRunning,
    Hal(HalError),
}

impl core::fmt::Display for AlEthDriverErr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            Self::DescRingAlloc => write!(f, "descriptor ring memory allocation failure."),
            Self::BufferAlloc => write!(f, "packet buffer allocation failure."),
            Self::DmaMapping => write!(f, "packet buffer DMA mapping failure."),
            Self::InvalidRingSize => {
                write!(f, "ring size must be a power of two within the allowed range.")
            }
            Self::InvalidQueue => write!(f, "no such queue."),
            Self::QueueConfig(dir, id) => write!(f, "configuration of {dir} queue {id} failed."),
            Self::InterruptSetup => write!(f, "interrupt initialization failure."),
            Self::Range => write!(f, "value out of range."),
            Self::UnsupportedProtocol => write!(f, "unsupported steering protocol."),
            Self::NoFreeSlot => write!(f, "no free flow steering slot."),
            Self::Busy => write!(f, "configuration lock contention."),
            Self::Param => write!(f, "parameter failure."),
            Self::NotRunning => write!(f, "adapter is not running."),
            Self::Hal(e) => write!(f, "register interface failure: {e}"),
        }
    }
}

impl From<HalError> for AlEthDriverErr {
    fn from(value: HalError) -> Self {
        AlEthDriverErr::Hal(value)
    }
}

impl From<RingCreateErr> for AlEthDriverErr {
    fn from(value: RingCreateErr) -> Self {
        match value {
            RingCreateErr::InvalidSize => AlEthDriverErr::InvalidRingSize,
            RingCreateErr::NoDescMemory => AlEthDriverErr::DescRingAlloc,
        }
    }
}

impl From<BufferAllocErr> for AlEthDriverErr {
    fn from(value: BufferAllocErr) -> Self {
        match value {
            BufferAllocErr::OutOfMemory => AlEthDriverErr::BufferAlloc,
            BufferAllocErr::DmaMapping => AlEthDriverErr::DmaMapping,
        }
    }
}

impl From<SteeringErr> for AlEthDriverErr {
    fn from(value: SteeringErr) -> Self {
        match value {
            SteeringErr::Range => AlEthDriverErr::Range,
            SteeringErr::UnsupportedProtocol => AlEthDriverErr::UnsupportedProtocol,
            SteeringErr::NoFreeSlot => AlEthDriverErr::NoFreeSlot,
            SteeringErr::Hal(e) => AlEthDriverErr::Hal(e),
        }
    }
}

impl From<IrqError> for AlEthDriverErr {
    fn from(_: IrqError) -> Self {
        AlEthDriverErr::InterruptSetup
    }
}

impl From<AlEthDriverErr> for NetDevError {
    fn from(value: AlEthDriverErr) -> Self {
        match value {
            // Expected under load; accounted in the ring statistics, so
            // no log noise here.
            AlEthDriverErr::Busy => NetDevError::Busy,
            AlEthDriverErr::InvalidQueue => NetDevError::InvalidQueue,
            _ => {
                log::error!("al_eth: {value}");
                NetDevError::DeviceError
            }
        }
    }
}

/// Adapter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Down,
    BringingUp,
    Up,
    BringingDown,
}

/// How interrupt vectors were bound at bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    /// No vectors obtainable; the platform polls.
    Legacy,
    /// One vector shared by all queues and management.
    SingleVector,
    /// One vector per queue plus one management vector.
    PerQueueVectors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IrqRole {
    Queue(usize),
    Mgmt,
    Shared,
}

#[derive(Debug)]
enum IntBinding {
    Legacy,
    Single(IRQ),
    PerQueue(Vec<(IRQ, IrqRole)>),
}

#[derive(Debug, Default, Clone, Copy)]
struct TxWatchdog {
    last_clean: u32,
    stalled: u32,
}

struct Queue {
    // Lock order within one queue: the ring lock first, then the pool.
    tx: Mutex<Option<TxRing>>,
    rx: Mutex<Option<RxRing>>,
    pool: Mutex<Option<BufferPool>>,
    me: usize,
}

struct AlEthInner {
    hal: Arc<dyn EthHal>,
    cfg: AdapterRuntimeConfig,

    flags: NetFlags,
    capabilities: NetCapabilities,
    state: AdapterState,
    reset_pending: bool,
    live_restored: bool,

    link_active: bool,
    link_speed_mbps: u32,
    full_duplex: bool,

    int_binding: IntBinding,
    irq_to_role: BTreeMap<u16, IrqRole>,
    is_poll_mode: bool,

    forwarding: RxForwarding,
    multicast_addr: BTreeSet<[u8; 6]>,

    rx_coalescing: CoalescingMode,
    tx_coalescing: CoalescingMode,

    watchdog: Vec<TxWatchdog>,

    self_ref: Weak<AlEth>,
}

/// Alpine Ethernet adapter.
pub struct AlEth {
    // The order of lock acquisition must be as follows:
    //
    // 1. `AlEthInner`'s lock
    // 2. `Queue`'s lock
    // 3. `Queue`'s unlock
    // 4. `AlEthInner`'s unlock
    //
    // Otherwise, a deadlock will occur.
    que: Vec<Queue>,
    inner: RwLock<AlEthInner>,

    /// Error counters live outside the configuration lock; the collector
    /// and the statistics reader share their own lock.
    events: ErrEvents,

    closing: AtomicBool,
    reset_request: AtomicBool,
}

/// Create an adapter bound to `hal` and register nothing else; the
/// adapter stays administratively down until [`NetDevice::up`].
pub fn attach(
    hal: Arc<dyn EthHal>,
    cfg: &AdapterRuntimeConfig,
) -> Result<Arc<AlEth>, AlEthDriverErr> {
    if cfg.num_queues == 0 || cfg.num_queues > 16 || !cfg.num_queues.is_power_of_two() {
        return Err(AlEthDriverErr::Param);
    }

    let mut que = Vec::new();
    for i in 0..cfg.num_queues {
        que.push(Queue {
            tx: Mutex::new(None),
            rx: Mutex::new(None),
            pool: Mutex::new(None),
            me: i,
        });
    }

    let capabilities = NetCapabilities::CSUM_IPv4
        | NetCapabilities::CSUM_TCPv4
        | NetCapabilities::CSUM_UDPv4
        | NetCapabilities::CSUM_TCPv6
        | NetCapabilities::CSUM_UDPv6
        | NetCapabilities::VLAN_MTU
        | NetCapabilities::VLAN_HWTAGGING;

    let inner = AlEthInner {
        hal,
        cfg: cfg.clone(),
        flags: NetFlags::BROADCAST | NetFlags::SIMPLEX | NetFlags::MULTICAST,
        capabilities,
        state: AdapterState::Down,
        // The hardware state is unknown at attach time, so the first
        // bring-up starts from a function-level reset.
        reset_pending: true,
        live_restored: false,
        link_active: false,
        link_speed_mbps: 0,
        full_duplex: false,
        int_binding: IntBinding::Legacy,
        irq_to_role: BTreeMap::new(),
        is_poll_mode: true,
        forwarding: RxForwarding::new(),
        multicast_addr: BTreeSet::new(),
        rx_coalescing: CoalescingMode::Adaptive,
        tx_coalescing: CoalescingMode::Adaptive,
        watchdog: Vec::new(),
        self_ref: Weak::new(),
    };

    let eth = Arc::new(AlEth {
        que,
        inner: RwLock::new(inner),
        events: ErrEvents::new(),
        closing: AtomicBool::new(false),
        reset_request: AtomicBool::new(false),
    });

    eth.inner.write().self_ref = Arc::downgrade(&eth);

    let mac = cfg.mac_addr;
    log::info!(
        "{}: {}: MAC = {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        DEVICE_SHORT_NAME,
        DEVICE_NAME,
        mac[0],
        mac[1],
        mac[2],
        mac[3],
        mac[4],
        mac[5]
    );

    Ok(eth)
}

impl AlEthInner {
    /// Backup, reset, restore. Safe to run twice in a row: the steering
    /// pair's phase flag makes the second backup a no-op.
    fn function_level_reset(&mut self) -> Result<(), AlEthDriverErr> {
        self.forwarding.backup_before_reset(&*self.hal)?;
        self.hal.function_level_reset()?;
        self.forwarding.restore_after_reset(&*self.hal)?;
        Ok(())
    }

    fn update_link_status(&mut self) {
        let up = self.hal.link_up();

        if up && !self.link_active {
            self.link_active = true;
            self.link_speed_mbps = self.cfg.link_speed_mbps;
            self.full_duplex = true;
            log::info!("{DEVICE_SHORT_NAME}: link up, {} Mbps", self.link_speed_mbps);
        } else if !up && self.link_active {
            self.link_active = false;
            self.link_speed_mbps = 0;
            log::warn!("{DEVICE_SHORT_NAME}: link down");
        }
    }

    /// Program the unicast/broadcast/promiscuous forwarding entries from
    /// the current interface flags and multicast table occupancy.
    fn iff(&mut self) -> Result<(), AlEthDriverErr> {
        self.flags.remove(NetFlags::ALLMULTI);

        let mut catch_all = false;
        if self.multicast_addr.len() > MAX_NUM_MULTICAST_ADDRESSES {
            self.flags.insert(NetFlags::ALLMULTI);
            catch_all = true;
        }
        if self.flags.contains(NetFlags::PROMISC) {
            catch_all = true;
        }

        let mac = self.cfg.mac_addr;
        self.forwarding
            .configure_default(&*self.hal, &mac, self.cfg.num_queues, catch_all)?;

        Ok(())
    }

    fn alloc_queue_resources(&mut self, que: &[Queue]) -> Result<(), AlEthDriverErr> {
        for q in que.iter() {
            let mut pool = BufferPool::new(
                self.cfg.buffer_policy,
                self.cfg.numa_id,
                self.cfg.dma_tag,
                buf_size_for_mtu(self.cfg.mtu),
                RECYCLE_CACHE_SIZE,
            );

            let mut rx = RxRing::new(
                q.me,
                self.cfg.rx_descs_sw,
                self.cfg.rx_descs_hw,
                self.cfg.numa_id,
            )?;
            let tx = TxRing::new(
                q.me,
                self.cfg.tx_descs_sw,
                self.cfg.tx_descs_hw,
                self.cfg.numa_id,
            )?;

            // Initial RX fill. Failing to populate a fresh ring is fatal
            // to the bring-up, unlike refill misses at run time.
            while rx.available_slots() > 0 {
                let buf = pool.allocate()?;
                if rx.post_rx_buffer(buf).is_err() {
                    return Err(AlEthDriverErr::DescRingAlloc);
                }
            }

            let mut node = MCSNode::new();
            *q.rx.lock(&mut node) = Some(rx);

            let mut node = MCSNode::new();
            *q.tx.lock(&mut node) = Some(tx);

            let mut node = MCSNode::new();
            *q.pool.lock(&mut node) = Some(pool);
        }

        self.watchdog.clear();
        self.watchdog.resize(que.len(), TxWatchdog::default());

        Ok(())
    }

    fn release_queue_resources(&mut self, que: &[Queue]) {
        for q in que.iter() {
            let mut node = MCSNode::new();
            *q.tx.lock(&mut node) = None;

            let mut node = MCSNode::new();
            *q.rx.lock(&mut node) = None;

            let mut node = MCSNode::new();
            *q.pool.lock(&mut node) = None;
        }

        self.watchdog.clear();
    }

    /// Push ring placement down to the device and open the queues. On the
    /// first failure this logs and returns; the caller tears everything
    /// down, so no per-queue rollback happens here.
    fn enable_queues(&mut self, que: &[Queue]) -> Result<(), AlEthDriverErr> {
        for q in que.iter() {
            let mut node = MCSNode::new();
            let mut tx = q.tx.lock(&mut node);
            let tx = tx.as_mut().ok_or(AlEthDriverErr::InvalidQueue)?;

            let params = QueueParams {
                base: tx.desc_base(),
                hw_count: tx.hw_count() as u32,
            };
            if let Err(e) = self.hal.configure_queue(RingDirection::Tx, q.me, &params) {
                log::error!("{DEVICE_SHORT_NAME}: tx queue {} configuration failed: {e}", q.me);
                return Err(AlEthDriverErr::QueueConfig(RingDirection::Tx, q.me));
            }

            let mut node = MCSNode::new();
            let mut rx = q.rx.lock(&mut node);
            let rx = rx.as_mut().ok_or(AlEthDriverErr::InvalidQueue)?;

            let params = QueueParams {
                base: rx.desc_base(),
                hw_count: rx.hw_count() as u32,
            };
            if let Err(e) = self.hal.configure_queue(RingDirection::Rx, q.me, &params) {
                log::error!("{DEVICE_SHORT_NAME}: rx queue {} configuration failed: {e}", q.me);
                return Err(AlEthDriverErr::QueueConfig(RingDirection::Rx, q.me));
            }

            // Publish the initial fill.
            self.hal.set_ring_tail(RingDirection::Rx, q.me, rx.tail())?;
        }

        Ok(())
    }

    fn setup_interrupts(&mut self, n_queues: usize) -> Result<(), AlEthDriverErr> {
        self.irq_to_role.clear();

        if let Ok((binding, map)) = self.allocate_per_queue_vectors(n_queues) {
            self.int_binding = binding;
            self.irq_to_role = map;
            self.is_poll_mode = false;
            return Ok(());
        }

        if let Ok((binding, map)) = self.allocate_single_vector() {
            self.int_binding = binding;
            self.irq_to_role = map;
            self.is_poll_mode = false;
            return Ok(());
        }

        // No vectors at all: shared legacy line, serviced by polling.
        self.int_binding = IntBinding::Legacy;
        self.irq_to_role.insert(0, IrqRole::Shared);
        self.is_poll_mode = true;

        Ok(())
    }

    fn irq_handler(&self) -> Box<dyn Fn(u16) + Send + Sync> {
        let weak = self.self_ref.clone();
        Box::new(move |irq| {
            if let Some(eth) = weak.upgrade() {
                let _ = eth.intr(irq);
            }
        })
    }

    fn allocate_per_queue_vectors(
        &self,
        n_queues: usize,
    ) -> Result<(IntBinding, BTreeMap<u16, IrqRole>), IrqError> {
        let mut irqs = Vec::new();
        let mut map = BTreeMap::new();

        for q in 0..n_queues {
            let name = format!("{DEVICE_SHORT_NAME}-q{q}");
            // A failure here drops the already-acquired IRQs, which
            // releases their vectors.
            let irq = interrupt::register_handler(name.into(), self.irq_handler())?;
            map.insert(irq.get_irq(), IrqRole::Queue(q));
            irqs.push((irq, IrqRole::Queue(q)));
        }

        let name = format!("{DEVICE_SHORT_NAME}-mgmt");
        let irq = interrupt::register_handler(name.into(), self.irq_handler())?;
        map.insert(irq.get_irq(), IrqRole::Mgmt);
        irqs.push((irq, IrqRole::Mgmt));

        Ok((IntBinding::PerQueue(irqs), map))
    }

    fn allocate_single_vector(&self) -> Result<(IntBinding, BTreeMap<u16, IrqRole>), IrqError> {
        let name = format!("{DEVICE_SHORT_NAME}-shared");
        let irq = interrupt::register_handler(name.into(), self.irq_handler())?;

        let mut map = BTreeMap::new();
        map.insert(irq.get_irq(), IrqRole::Shared);

        Ok((IntBinding::Single(irq), map))
    }

    fn release_interrupts(&mut self) {
        // Masking plus a synchronize below makes this an orderly release:
        // nothing new fires, in-flight handlers drain, then the vectors
        // drop.
        self.int_binding = IntBinding::Legacy;
        self.irq_to_role.clear();
        self.is_poll_mode = true;
    }

    fn enable_intr(&mut self, n_queues: usize) {
        match &mut self.int_binding {
            IntBinding::PerQueue(irqs) => {
                for (irq, _) in irqs.iter_mut() {
                    irq.enable();
                }
            }
            IntBinding::Single(irq) => irq.enable(),
            IntBinding::Legacy => (),
        }

        let queue_bits = (1u32 << n_queues) - 1;
        self.hal.unmask(IoficGroup::B, queue_bits);
        self.hal.unmask(IoficGroup::C, queue_bits);
        self.hal.unmask(IoficGroup::A, INT_GROUP_A_LINK_CHANGE);
        self.hal
            .unmask(IoficGroup::D, INT_GROUP_D_MAC_PARITY | INT_GROUP_D_UDMA_AXI);
    }

    fn disable_intr(&mut self) {
        self.hal.mask(IoficGroup::A, !0);
        self.hal.mask(IoficGroup::B, !0);
        self.hal.mask(IoficGroup::C, !0);
        self.hal.mask(IoficGroup::D, !0);

        match &mut self.int_binding {
            IntBinding::PerQueue(irqs) => {
                for (irq, _) in irqs.iter_mut() {
                    irq.disable();
                }
            }
            IntBinding::Single(irq) => irq.disable(),
            IntBinding::Legacy => (),
        }
    }

    fn program_coalescing(&mut self, n_queues: usize) -> Result<(), AlEthDriverErr> {
        for q in 0..n_queues {
            let rx_usec = match self.rx_coalescing {
                CoalescingMode::Fixed(usec) => usec,
                CoalescingMode::Adaptive => self.cfg.moderation_table[0].interval_usec,
            };
            self.hal.set_coalescing(RingDirection::Rx, q, rx_usec)?;

            let tx_usec = match self.tx_coalescing {
                CoalescingMode::Fixed(usec) => usec,
                CoalescingMode::Adaptive => self.cfg.moderation_table[0].interval_usec,
            };
            self.hal.set_coalescing(RingDirection::Tx, q, tx_usec)?;
        }

        Ok(())
    }

    /// The bring-up sequence. Every stage that fails aborts the whole
    /// attempt; the caller unwinds with [`Self::stop`].
    fn init(&mut self, que: &[Queue]) -> Result<(), AlEthDriverErr> {
        let stage = |name: &'static str| {
            move |e: AlEthDriverErr| {
                log::error!("{DEVICE_SHORT_NAME}: bring-up failed at {name}: {e}");
                e
            }
        };

        if self.reset_pending {
            // The matching restore runs after the default forwarding set
            // is in place and strictly before the queues are enabled, so
            // no packet is ever steered by stale rules.
            self.forwarding
                .backup_before_reset(&*self.hal)
                .map_err(AlEthDriverErr::from)
                .map_err(stage("steering backup"))?;
            self.hal
                .function_level_reset()
                .map_err(AlEthDriverErr::from)
                .map_err(stage("reset"))?;
            self.reset_pending = false;
        }

        self.hal
            .set_mac_mode(self.cfg.mac_mode)
            .map_err(AlEthDriverErr::from)
            .map_err(stage("mac mode"))?;
        self.hal
            .set_link_params(&LinkParams {
                speed_mbps: self.cfg.link_speed_mbps,
                full_duplex: true,
                autoneg: true,
            })
            .map_err(AlEthDriverErr::from)
            .map_err(stage("link params"))?;
        self.hal
            .set_flow_control(&FlowControlParams::default())
            .map_err(AlEthDriverErr::from)
            .map_err(stage("flow control"))?;

        self.setup_interrupts(que.len()).map_err(stage("interrupts"))?;

        self.alloc_queue_resources(que).map_err(stage("rings"))?;

        self.iff().map_err(stage("rx forwarding"))?;

        self.forwarding
            .restore_after_reset(&*self.hal)
            .map_err(AlEthDriverErr::from)
            .map_err(stage("steering restore"))?;

        self.enable_queues(que).map_err(stage("queue enable"))?;

        self.program_coalescing(que.len())
            .map_err(stage("coalescing"))?;

        self.enable_intr(que.len());

        self.hal
            .mac_start()
            .map_err(AlEthDriverErr::from)
            .map_err(stage("mac start"))?;

        self.update_link_status();
        self.flags.insert(NetFlags::RUNNING);

        Ok(())
    }

    /// Tear down everything [`Self::init`] set up, in reverse order. Also
    /// the unwind path for a failed bring-up, so every step tolerates the
    /// corresponding stage never having run.
    fn stop(&mut self, que: &[Queue]) {
        self.flags.remove(NetFlags::RUNNING);

        self.disable_intr();
        interrupt::synchronize();

        if let Err(e) = self.hal.mac_stop() {
            log::warn!("{DEVICE_SHORT_NAME}: mac stop failed: {e}");
        }

        // Preserve user steering across the reset the next bring-up will
        // perform.
        if let Err(e) = self.forwarding.backup_before_reset(&*self.hal) {
            log::warn!("{DEVICE_SHORT_NAME}: steering backup failed: {e}");
        }

        self.release_queue_resources(que);
        self.release_interrupts();

        // Hardware needs a fresh reset before reliable reuse, unless a
        // live-update restore just proved the link is already in shape.
        if self.live_restored {
            self.live_restored = false;
        } else {
            self.reset_pending = true;
        }
    }
}

impl AlEth {
    fn config_lock_write(&self) -> Result<RwLockWriteGuard<'_, AlEthInner>, AlEthDriverErr> {
        for _ in 0..CONFIG_LOCK_RETRIES {
            if let Some(guard) = self.inner.try_write() {
                return Ok(guard);
            }
            if self.closing.load(Ordering::Relaxed) {
                return Err(AlEthDriverErr::Busy);
            }
            delay::wait_microsec(50);
        }

        Err(AlEthDriverErr::Busy)
    }

    /// Interrupt dispatch: map the vector to its role and service it.
    ///
    /// Interrupt context never blocks on the configuration lock; when a
    /// configuration change holds it, the activation bows out and the
    /// masked-and-synchronized teardown makes sure nothing is lost.
    fn intr(&self, irq: u16) -> Result<(), AlEthDriverErr> {
        let role = {
            let Some(inner) = self.inner.try_read() else {
                return Ok(());
            };
            inner.irq_to_role.get(&irq).copied()
        };

        match role {
            None => Ok(()),
            Some(IrqRole::Queue(q)) => {
                self.poll_queue(q, POLL_BUDGET)?;
                Ok(())
            }
            Some(IrqRole::Mgmt) => self.mgmt_intr(),
            Some(IrqRole::Shared) => {
                for q in 0..self.que.len() {
                    self.poll_queue(q, POLL_BUDGET)?;
                }
                self.mgmt_intr()
            }
        }
    }

    fn mgmt_intr(&self) -> Result<(), AlEthDriverErr> {
        let link_changed = {
            let Some(inner) = self.inner.try_read() else {
                return Ok(());
            };

            let cause_a = inner.hal.read_cause(IoficGroup::A);
            let cause_d = inner.hal.read_cause(IoficGroup::D);

            if cause_d != 0 {
                self.events.collect(&*inner.hal, CollectMode::Interrupt);
            }

            cause_a & INT_GROUP_A_LINK_CHANGE != 0
        };

        if link_changed {
            // Contention means a configuration change owns the lock; it
            // re-reads link state itself, and the tick path would catch a
            // missed transition anyway.
            if let Some(mut inner) = self.inner.try_write() {
                inner.update_link_status();
                inner.hal.unmask(IoficGroup::A, INT_GROUP_A_LINK_CHANGE);
            }
        }

        Ok(())
    }

    /// Budget-bounded completion processing for one queue: reclaim RX,
    /// hand frames up, refill, reclaim TX into the recycle cache, update
    /// moderation, and re-arm the interrupt only when the budget was not
    /// exhausted.
    fn poll_queue(&self, que_id: usize, budget: usize) -> Result<usize, AlEthDriverErr> {
        let que = self.que.get(que_id).ok_or(AlEthDriverErr::InvalidQueue)?;

        let Some(inner) = self.inner.try_read() else {
            // A configuration change is in flight; it owns the rings.
            return Ok(0);
        };
        if !inner.flags.contains(NetFlags::RUNNING) {
            return Ok(0);
        }

        let mut processed = 0;

        {
            let mut node = MCSNode::new();
            let mut rx_guard = que.rx.lock(&mut node);
            let Some(rx) = rx_guard.as_mut() else {
                return Ok(0);
            };

            let mut pool_node = MCSNode::new();
            let mut pool_guard = que.pool.lock(&mut pool_node);
            let Some(pool) = pool_guard.as_mut() else {
                return Ok(0);
            };

            while processed < budget {
                let Some(done) = rx.reclaim_one() else {
                    break;
                };
                processed += 1;

                if done.error != 0 {
                    if done.error & RXD_ERR_CSUM != 0 {
                        rx.stats.csum_err += 1;
                    }
                    rx.stats.dropped += 1;
                    pool.release(done.buffer);
                    continue;
                }

                if done.status & RXD_STAT_EOP == 0 {
                    // Multi-descriptor frames are outside the fast path;
                    // drop the fragment and account for it.
                    rx.stats.dropped += 1;
                    pool.release(done.buffer);
                    continue;
                }

                let len = done.len as usize;
                let mut csum_flags = PacketHeaderFlags::empty();
                if done.status & RXD_STAT_IPV4_CSUM_OK != 0 {
                    csum_flags |= PacketHeaderFlags::IPV4_CSUM_IN_OK;
                }
                if done.status & RXD_STAT_L4_CSUM_OK != 0 {
                    csum_flags |= if done.status & RXD_STAT_L4_UDP != 0 {
                        PacketHeaderFlags::UDP_CSUM_IN_OK
                    } else {
                        PacketHeaderFlags::TCP_CSUM_IN_OK
                    };
                }

                let rx_hash = if done.status & RXD_STAT_HASH != 0 {
                    csum_flags |= PacketHeaderFlags::FLOWID;
                    Some(done.hash)
                } else {
                    None
                };

                let vlan = if done.status & RXD_STAT_VLAN != 0 {
                    Some(done.vlan)
                } else {
                    None
                };

                let data = unsafe { done.buffer.as_slice(len) }.to_vec();
                let frame = EtherFrameBuf {
                    data,
                    vlan,
                    csum_flags,
                    rx_hash,
                };

                rx.stats.packets += 1;
                rx.stats.bytes += len as u64;
                rx.stats.since_packets += 1;
                rx.stats.since_bytes += len as u32;

                if rx.read_queue.push(frame).is_err() {
                    rx.stats.queue_overflow += 1;
                }

                pool.release(done.buffer);
            }

            // Refill. Misses here are soft: counted, retried on the next
            // poll.
            while rx.available_slots() > 0 {
                match pool.allocate() {
                    Ok(buf) => {
                        if let Err(buf) = rx.post_rx_buffer(buf) {
                            pool.release(buf);
                            break;
                        }
                    }
                    Err(BufferAllocErr::OutOfMemory) => {
                        rx.stats.alloc_fail += 1;
                        break;
                    }
                    Err(BufferAllocErr::DmaMapping) => {
                        rx.stats.map_fail += 1;
                        break;
                    }
                }
            }

            inner
                .hal
                .set_ring_tail(RingDirection::Rx, que_id, rx.tail())?;

            if processed > 0 {
                if let CoalescingMode::Adaptive = inner.rx_coalescing {
                    let packets = rx.stats.since_packets;
                    let bytes = rx.stats.since_bytes;
                    if let Some(usec) =
                        rx.moderation
                            .update(&inner.cfg.moderation_table, packets, bytes)
                    {
                        let _ = inner.hal.set_coalescing(RingDirection::Rx, que_id, usec);
                    }
                    rx.stats.since_packets = 0;
                    rx.stats.since_bytes = 0;
                }
            }
        }

        // TX completions feed freed buffers back to the RX refill path
        // through the pool's recycle cache.
        {
            let mut node = MCSNode::new();
            let mut tx_guard = que.tx.lock(&mut node);
            if let Some(tx) = tx_guard.as_mut() {
                let head = inner.hal.ring_head(RingDirection::Tx, que_id)?;

                let mut pool_node = MCSNode::new();
                let mut pool_guard = que.pool.lock(&mut pool_node);
                if let Some(pool) = pool_guard.as_mut() {
                    let mut tx_done = 0;
                    {
                        let mut completed = tx.reclaim_completed(head, usize::MAX);
                        for done in &mut completed {
                            tx_done += 1;
                            pool.release(done.buffer);
                        }
                    }

                    if tx_done > 0 {
                        if let CoalescingMode::Adaptive = inner.tx_coalescing {
                            let packets = tx.stats.since_packets;
                            let bytes = tx.stats.since_bytes;
                            if let Some(usec) =
                                tx.moderation
                                    .update(&inner.cfg.moderation_table, packets, bytes)
                            {
                                let _ = inner.hal.set_coalescing(RingDirection::Tx, que_id, usec);
                            }
                            tx.stats.since_packets = 0;
                            tx.stats.since_bytes = 0;
                        }
                    }
                }
            }
        }

        if processed < budget {
            // Cooperative continuation: with budget left over we are
            // caught up, so re-arm; otherwise the caller polls again.
            inner.hal.unmask(IoficGroup::B, 1 << que_id);
            inner.hal.unmask(IoficGroup::C, 1 << que_id);
        }

        Ok(processed)
    }

    /// Compute TX descriptor flags and offload metadata for a frame.
    fn tx_offload(&self, frame: &EtherFrameRef) -> (u32, u32) {
        let mut flags = 0;
        let mut meta = 0;

        if let Some(vlan) = frame.vlan {
            flags |= TXD_VLAN;
            meta |= vlan as u32;
        }

        let Ok(ext) = extract_headers(frame.data) else {
            return (flags, meta);
        };

        let l3_off = if ext.vlan.is_some() {
            ETHER_HDR_LEN + 4
        } else {
            ETHER_HDR_LEN
        };

        let mut l4_off = l3_off;
        match &ext.network {
            NetworkHdr::Ipv4(ip) => {
                l4_off += (ip.header_len() as usize) << 2;
                if frame
                    .csum_flags
                    .contains(PacketHeaderFlags::IPV4_CSUM_OUT)
                {
                    flags |= TXD_IPV4_CSUM;
                }
            }
            NetworkHdr::Ipv6(_) => {
                l4_off += core::mem::size_of::<alpine_lib::net::ether::Ip6Hdr>();
            }
            NetworkHdr::None => return (flags, meta),
        }

        // The checksum insertion offset within the frame, as the engine
        // expects it.
        let csum_off = match &ext.transport {
            TransportHdr::Udp(_)
                if frame.csum_flags.contains(PacketHeaderFlags::UDP_CSUM_OUT) =>
            {
                flags |= TXD_L4_CSUM;
                l4_off + offset_of!(UDPHdr, uh_sum)
            }
            TransportHdr::Tcp(_)
                if frame.csum_flags.contains(PacketHeaderFlags::TCP_CSUM_OUT) =>
            {
                flags |= TXD_L4_CSUM;
                l4_off + offset_of!(TCPHdr, th_sum)
            }
            _ => 0,
        };

        meta |= ((l3_off as u32) & 0xff) << 16;
        meta |= ((csum_off as u32) & 0xff) << 24;

        (flags, meta)
    }

    fn send_frame(&self, frame: &EtherFrameRef, que_id: usize) -> Result<(), AlEthDriverErr> {
        let que = self.que.get(que_id).ok_or(AlEthDriverErr::InvalidQueue)?;

        let inner = self.inner.read();
        if !inner.flags.contains(NetFlags::RUNNING) {
            return Err(AlEthDriverErr::NotRunning);
        }
        if !inner.link_active {
            // No link: nothing to do, the stack will retry after carrier
            // comes back.
            return Ok(());
        }

        let (flags, meta) = self.tx_offload(frame);

        let mut node = MCSNode::new();
        let mut tx_guard = que.tx.lock(&mut node);
        let tx = tx_guard.as_mut().ok_or(AlEthDriverErr::NotRunning)?;

        let mut pool_node = MCSNode::new();
        let mut pool_guard = que.pool.lock(&mut pool_node);
        let pool = pool_guard.as_mut().ok_or(AlEthDriverErr::NotRunning)?;

        if frame.data.len() > pool.buf_size() {
            return Err(AlEthDriverErr::Param);
        }

        if tx.available_slots() == 0 {
            // Soft failure, accounted in the ring stats; the caller
            // retries after completions free slots.
            tx.stats.ring_full += 1;
            return Err(AlEthDriverErr::Busy);
        }

        let mut buf = pool.allocate()?;
        buf.write(frame.data);

        match tx.post(buf, frame.data.len(), flags, meta) {
            Ok(()) => {
                inner
                    .hal
                    .set_ring_tail(RingDirection::Tx, que_id, tx.tail())?;
                Ok(())
            }
            Err(buf) => {
                pool.release(buf);
                Err(AlEthDriverErr::Busy)
            }
        }
    }

    // Management-plane surface

    pub fn adapter_state(&self) -> AdapterState {
        self.inner.read().state
    }

    pub fn interrupt_mode(&self) -> InterruptMode {
        let inner = self.inner.read();
        match inner.int_binding {
            IntBinding::Legacy => InterruptMode::Legacy,
            IntBinding::Single(_) => InterruptMode::SingleVector,
            IntBinding::PerQueue(_) => InterruptMode::PerQueueVectors,
        }
    }

    pub fn coalescing_mode(&self, dir: RingDirection) -> CoalescingMode {
        let inner = self.inner.read();
        match dir {
            RingDirection::Rx => inner.rx_coalescing,
            RingDirection::Tx => inner.tx_coalescing,
        }
    }

    /// Switch one direction between adaptive and fixed coalescing. A
    /// fixed interval is programmed to every queue immediately when the
    /// adapter is running.
    pub fn set_coalescing_mode(
        &self,
        dir: RingDirection,
        mode: CoalescingMode,
    ) -> Result<(), AlEthDriverErr> {
        let mut inner = self.config_lock_write()?;

        match dir {
            RingDirection::Rx => inner.rx_coalescing = mode,
            RingDirection::Tx => inner.tx_coalescing = mode,
        }

        if inner.flags.contains(NetFlags::RUNNING) {
            if let CoalescingMode::Fixed(usec) = mode {
                for q in 0..inner.cfg.num_queues {
                    inner.hal.set_coalescing(dir, q, usec)?;
                }
            }
        }

        Ok(())
    }

    pub fn ring_sizes(&self, dir: RingDirection) -> (usize, usize) {
        let inner = self.inner.read();
        match dir {
            RingDirection::Rx => (inner.cfg.rx_descs_sw, inner.cfg.rx_descs_hw),
            RingDirection::Tx => (inner.cfg.tx_descs_sw, inner.cfg.tx_descs_hw),
        }
    }

    /// Change ring geometry. Rings are never resized in place: when the
    /// adapter is up this bounces it, recreating the rings on the way
    /// back. Invalid sizes are rejected with no side effects.
    pub fn set_ring_sizes(
        &self,
        dir: RingDirection,
        sw_count: usize,
        hw_count: usize,
    ) -> Result<(), AlEthDriverErr> {
        let valid = |n: usize| {
            n.is_power_of_two() && (ring::MIN_RING_DESCS..=ring::MAX_RING_DESCS).contains(&n)
        };
        if !valid(sw_count) || !valid(hw_count) {
            return Err(AlEthDriverErr::InvalidRingSize);
        }

        let restart = {
            let mut inner = self.config_lock_write()?;

            match dir {
                RingDirection::Rx => {
                    inner.cfg.rx_descs_sw = sw_count;
                    inner.cfg.rx_descs_hw = hw_count;
                }
                RingDirection::Tx => {
                    inner.cfg.tx_descs_sw = sw_count;
                    inner.cfg.tx_descs_hw = hw_count;
                }
            }

            inner.state == AdapterState::Up
        };

        if restart {
            NetDevice::down(self).map_err(|_| AlEthDriverErr::Busy)?;
            NetDevice::up(self).map_err(|_| AlEthDriverErr::Busy)?;
        }

        Ok(())
    }

    pub fn mtu(&self) -> usize {
        self.inner.read().cfg.mtu
    }

    /// Change the MTU. Buffer geometry follows the MTU, so a running
    /// adapter is bounced to rebuild its pools; invalid values are
    /// rejected with no side effects.
    pub fn set_mtu(&self, mtu: usize) -> Result<(), AlEthDriverErr> {
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(AlEthDriverErr::Range);
        }

        let restart = {
            let mut inner = self.config_lock_write()?;
            inner.cfg.mtu = mtu;
            inner.state == AdapterState::Up
        };

        if restart {
            NetDevice::down(self).map_err(|_| AlEthDriverErr::Busy)?;
            NetDevice::up(self).map_err(|_| AlEthDriverErr::Busy)?;
        }

        Ok(())
    }

    pub fn set_promiscuous(&self, on: bool) -> Result<(), AlEthDriverErr> {
        let mut inner = self.config_lock_write()?;

        if on {
            inner.flags.insert(NetFlags::PROMISC);
        } else {
            inner.flags.remove(NetFlags::PROMISC);
        }

        if inner.flags.contains(NetFlags::RUNNING) {
            inner.iff()?;
        }

        Ok(())
    }

    pub fn set_rss_indirection_entry(
        &self,
        bucket: usize,
        queue: u8,
    ) -> Result<(), AlEthDriverErr> {
        let mut inner = self.config_lock_write()?;
        let num_queues = inner.cfg.num_queues;
        let hal = inner.hal.clone();
        inner
            .forwarding
            .set_indirection_entry(&*hal, bucket, queue, num_queues)?;
        Ok(())
    }

    pub fn rss_indirection_entry(&self, bucket: usize) -> Result<u8, AlEthDriverErr> {
        let inner = self.inner.read();
        if bucket >= hal::RX_RSS_TABLE_SIZE {
            return Err(AlEthDriverErr::Range);
        }
        Ok(inner.hal.indirection_entry(bucket)?)
    }

    pub fn add_flow_steering_rule(&self, rule: FlowRule) -> Result<usize, AlEthDriverErr> {
        let mut inner = self.config_lock_write()?;
        if let Some(q) = rule.queue {
            if q as usize >= inner.cfg.num_queues {
                return Err(AlEthDriverErr::Range);
            }
        }
        let hal = inner.hal.clone();
        Ok(inner.forwarding.add_flow_rule(&*hal, rule)?)
    }

    pub fn remove_flow_steering_rule(&self, slot: usize) -> Result<(), AlEthDriverErr> {
        let mut inner = self.config_lock_write()?;
        let hal = inner.hal.clone();
        inner.forwarding.remove_flow_rule(&*hal, slot)?;
        Ok(())
    }

    pub fn set_udma_override(&self, mask: Option<u8>) -> Result<(), AlEthDriverErr> {
        let mut inner = self.config_lock_write()?;
        let hal = inner.hal.clone();
        inner.forwarding.set_udma_override(&*hal, mask)?;
        Ok(())
    }

    pub fn set_queue_override(&self, queue: Option<u8>) -> Result<(), AlEthDriverErr> {
        let mut inner = self.config_lock_write()?;
        let num_queues = inner.cfg.num_queues;
        let hal = inner.hal.clone();
        inner
            .forwarding
            .set_queue_override(&*hal, queue, num_queues)?;
        Ok(())
    }

    pub fn overrides(&self) -> (Option<u8>, Option<u8>) {
        let inner = self.inner.read();
        (
            inner.forwarding.udma_override(),
            inner.forwarding.queue_override(),
        )
    }

    /// Which half of the steering backup/restore pair ran last.
    pub fn backup_phase(&self) -> BackupPhase {
        self.inner.read().forwarding.phase()
    }

    /// Explicit function-level reset, e.g. ahead of a PCIe-level FLR
    /// requested by the platform. Safe to call twice in a row.
    pub fn function_level_reset(&self) -> Result<(), AlEthDriverErr> {
        let mut inner = self.config_lock_write()?;
        inner.function_level_reset()
    }

    pub fn error_counters(&self) -> ErrorCounters {
        self.events.counters()
    }

    /// Whether ring resources currently exist (diagnostics; true only
    /// between a successful bring-up and the matching bring-down).
    pub fn rings_allocated(&self) -> bool {
        self.que.iter().any(|q| {
            let mut node = MCSNode::new();
            let allocated = q.rx.lock(&mut node).is_some();
            allocated
        })
    }

    pub fn pool_stats(&self, que_id: usize) -> Result<buffer::BufferPoolStats, AlEthDriverErr> {
        let que = self.que.get(que_id).ok_or(AlEthDriverErr::InvalidQueue)?;

        let mut node = MCSNode::new();
        let pool = que.pool.lock(&mut node);
        Ok(pool.as_ref().map(|p| p.stats).unwrap_or_default())
    }

    pub fn queue_stats(&self, que_id: usize) -> Result<(RxRingStats, TxRingStats), AlEthDriverErr> {
        let que = self.que.get(que_id).ok_or(AlEthDriverErr::InvalidQueue)?;

        let mut node = MCSNode::new();
        let rx = que.rx.lock(&mut node);
        let rx_stats = rx.as_ref().map(|r| r.stats).unwrap_or_default();

        let mut node = MCSNode::new();
        let tx = que.tx.lock(&mut node);
        let tx_stats = tx.as_ref().map(|t| t.stats).unwrap_or_default();

        Ok((rx_stats, tx_stats))
    }

    pub fn device_stats(&self) -> DeviceStats {
        let mut stats = DeviceStats::default();

        for q in 0..self.que.len() {
            if let Ok((rx, tx)) = self.queue_stats(q) {
                stats.rx_pkts += rx.packets;
                stats.rx_bytes += rx.bytes;
                stats.tx_pkts += tx.packets;
                stats.tx_bytes += tx.bytes;
            }
        }

        let inner = self.inner.read();
        stats.mac_rx_frames = inner.hal.read_counter(MacCounter::FramesRxOk);
        stats.mac_tx_frames = inner.hal.read_counter(MacCounter::FramesTxOk);
        stats.mac_crc_errors = inner.hal.read_counter(MacCounter::CrcErrors);

        stats
    }

    /// Serialize this port's live-update record into `region`.
    pub fn save_live_state(&self, region: &mut [u8]) -> Result<usize, AlEthDriverErr> {
        let inner = self.inner.read();

        let blob = encode_port_blob(&inner);
        let ports: [&[u8]; 1] = [&blob];

        live_update::save_region(region, &ports).map_err(|_| AlEthDriverErr::Param)
    }

    /// Validate a persisted region and, when it checks out and the link
    /// is still up, arm the lighter-weight bring-up path that skips the
    /// full function-level reset. Returns whether state was restored;
    /// invalid state is treated as absent.
    pub fn restore_live_state(&self, region: &[u8]) -> bool {
        let Some(ports) = live_update::load_region(region) else {
            return false;
        };
        let Some(Some(blob)) = ports.first() else {
            return false;
        };
        let Some(decoded) = decode_port_blob(blob) else {
            return false;
        };

        let mut inner = self.inner.write();

        if !decoded.link_was_active || !inner.hal.link_up() {
            return false;
        }

        inner.forwarding = RxForwarding::new();
        let hal = inner.hal.clone();
        let num_queues = inner.cfg.num_queues;

        let restored = inner
            .forwarding
            .set_udma_override(&*hal, decoded.udma_override)
            .and(inner
                .forwarding
                .set_queue_override(&*hal, decoded.queue_override, num_queues));
        if let Err(e) = restored {
            log::warn!("{DEVICE_SHORT_NAME}: live-update override restore failed: {e}");
            return false;
        }

        inner.reset_pending = false;
        inner.live_restored = true;

        log::info!("{DEVICE_SHORT_NAME}: restored live-update state, link preserved");
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceStats {
    pub rx_pkts: u64,
    pub tx_pkts: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub mac_rx_frames: u64,
    pub mac_tx_frames: u64,
    pub mac_crc_errors: u64,
}

impl core::fmt::Display for DeviceStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "rx_pkts: {}, tx_pkts: {}, rx_bytes: {}, tx_bytes: {}",
            self.rx_pkts, self.tx_pkts, self.rx_bytes, self.tx_bytes
        )
    }
}

struct PortBlob {
    link_was_active: bool,
    udma_override: Option<u8>,
    queue_override: Option<u8>,
}

// Blob layout: flags(4) speed(4) udma(present, value) queue(present, value).
const PORT_BLOB_LEN: usize = 12;

fn encode_port_blob(inner: &AlEthInner) -> [u8; PORT_BLOB_LEN] {
    let mut blob = [0u8; PORT_BLOB_LEN];

    let flags: u32 = if inner.link_active { 1 } else { 0 };
    blob[0..4].copy_from_slice(&flags.to_le_bytes());
    blob[4..8].copy_from_slice(&inner.link_speed_mbps.to_le_bytes());

    if let Some(mask) = inner.forwarding.udma_override() {
        blob[8] = 1;
        blob[9] = mask;
    }
    if let Some(queue) = inner.forwarding.queue_override() {
        blob[10] = 1;
        blob[11] = queue;
    }

    blob
}

fn decode_port_blob(blob: &[u8]) -> Option<PortBlob> {
    if blob.len() < PORT_BLOB_LEN {
        return None;
    }

    let flags = u32::from_le_bytes(blob[0..4].try_into().ok()?);

    Some(PortBlob {
        link_was_active: flags & 1 != 0,
        udma_override: (blob[8] != 0).then_some(blob[9]),
        queue_override: (blob[10] != 0).then_some(blob[11]),
    })
}

impl NetDevice for AlEth {
    fn num_queues(&self) -> usize {
        self.que.len()
    }

    fn flags(&self) -> NetFlags {
        let inner = self.inner.read();
        inner.flags
    }

    fn capabilities(&self) -> NetCapabilities {
        let inner = self.inner.read();
        inner.capabilities
    }

    fn device_short_name(&self) -> Cow<'static, str> {
        DEVICE_SHORT_NAME.into()
    }

    fn link_status(&self) -> LinkStatus {
        let inner = self.inner.read();
        if inner.link_active {
            if inner.full_duplex {
                LinkStatus::UpFullDuplex
            } else {
                LinkStatus::UpHalfDuplex
            }
        } else {
            LinkStatus::Down
        }
    }

    fn link_speed(&self) -> u64 {
        let inner = self.inner.read();
        inner.link_speed_mbps as u64
    }

    fn mac_address(&self) -> [u8; 6] {
        let inner = self.inner.read();
        inner.cfg.mac_addr
    }

    fn can_send(&self) -> bool {
        let inner = self.inner.read();
        inner.flags.contains(NetFlags::RUNNING) && inner.link_active
    }

    fn recv(&self, que_id: usize) -> Result<Option<EtherFrameBuf>, NetDevError> {
        let que = self.que.get(que_id).ok_or(NetDevError::InvalidQueue)?;

        {
            let mut node = MCSNode::new();
            let mut rx = que.rx.lock(&mut node);
            if let Some(rx) = rx.as_mut() {
                let data = rx.read_queue.pop();
                if data.is_some() {
                    return Ok(data);
                }
            }
        }

        self.poll_queue(que_id, POLL_BUDGET)?;

        let mut node = MCSNode::new();
        let mut rx = que.rx.lock(&mut node);
        if let Some(rx) = rx.as_mut() {
            Ok(rx.read_queue.pop())
        } else {
            Ok(None)
        }
    }

    fn send(&self, data: EtherFrameRef, que_id: usize) -> Result<(), NetDevError> {
        self.send_frame(&data, que_id).map_err(NetDevError::from)
    }

    fn poll(&self, que_id: usize, budget: usize) -> Result<usize, NetDevError> {
        self.poll_queue(que_id, budget).map_err(NetDevError::from)
    }

    fn up(&self) -> Result<(), NetDevError> {
        let mut inner = self.config_lock_write().map_err(NetDevError::from)?;

        if inner.state != AdapterState::Down {
            return Err(NetDevError::AlreadyUp);
        }

        inner.state = AdapterState::BringingUp;

        if let Err(err_init) = inner.init(&self.que) {
            inner.stop(&self.que);
            inner.state = AdapterState::Down;

            log::error!("{DEVICE_SHORT_NAME}: init failed: {err_init}");
            Err(NetDevError::DeviceError)
        } else {
            inner.state = AdapterState::Up;
            inner.flags.insert(NetFlags::UP);
            Ok(())
        }
    }

    fn down(&self) -> Result<(), NetDevError> {
        self.closing.store(true, Ordering::Release);

        let result = {
            let mut inner = self.inner.write();

            if inner.state != AdapterState::Up {
                Err(NetDevError::AlreadyDown)
            } else {
                inner.state = AdapterState::BringingDown;
                // Concurrent operations observe not-up before teardown
                // begins.
                inner.flags.remove(NetFlags::UP);

                inner.stop(&self.que);
                inner.state = AdapterState::Down;
                Ok(())
            }
        };

        self.closing.store(false, Ordering::Release);
        result
    }

    fn interrupt(&self, irq: u16) -> Result<(), NetDevError> {
        self.intr(irq).map_err(NetDevError::from)
    }

    fn irqs(&self) -> Vec<u16> {
        let inner = self.inner.read();

        let mut result = Vec::new();
        for irq in inner.irq_to_role.keys() {
            if *irq != 0 {
                result.push(*irq);
            }
        }

        result
    }

    fn rx_irq_to_que_id(&self, irq: u16) -> Option<usize> {
        let inner = self.inner.read();
        match inner.irq_to_role.get(&irq) {
            Some(IrqRole::Queue(q)) => Some(*q),
            Some(IrqRole::Shared) => Some(0),
            _ => None,
        }
    }

    fn poll_mode(&self) -> bool {
        self.inner.read().is_poll_mode
    }

    fn tick_msec(&self) -> Option<u64> {
        Some(100)
    }

    /// Service tick: run a deferred reset if one was requested, watch the
    /// link, poll error sources, and advance the TX watchdog.
    fn tick(&self) -> Result<(), NetDevError> {
        if self.reset_request.swap(false, Ordering::AcqRel) {
            if self.adapter_state() != AdapterState::Up {
                // The operator closed the adapter in the meantime; a
                // reset would bring it back against their intent.
                return Ok(());
            }

            log::warn!("{DEVICE_SHORT_NAME}: executing deferred adapter reset");
            if let Err(e) = NetDevice::down(self) {
                log::error!("{DEVICE_SHORT_NAME}: deferred reset: down failed: {e:?}");
            }
            if let Err(e) = NetDevice::up(self) {
                log::error!("{DEVICE_SHORT_NAME}: deferred reset: up failed: {e:?}");
            }
            return Ok(());
        }

        {
            let inner = self.inner.read();
            if !inner.flags.contains(NetFlags::RUNNING) {
                return Ok(());
            }

            self.events.collect(&*inner.hal, CollectMode::Polling);

            let link_now = inner.hal.link_up();
            if link_now != inner.link_active {
                drop(inner);
                let mut inner = self.inner.write();
                inner.update_link_status();
            }
        }

        let mut request_reset = false;

        {
            let mut inner = self.inner.write();

            for q in self.que.iter() {
                let mut node = MCSNode::new();
                let tx = q.tx.lock(&mut node);
                let Some(tx) = tx.as_ref() else {
                    continue;
                };

                let (ntu, ntc) = tx.cursors();
                let Some(wd) = inner.watchdog.get_mut(q.me) else {
                    continue;
                };

                if ntu != ntc && ntc == wd.last_clean {
                    wd.stalled += 1;
                } else {
                    wd.stalled = 0;
                }
                wd.last_clean = ntc;

                if wd.stalled >= TX_TIMEOUT_TICKS {
                    log::error!(
                        "{DEVICE_SHORT_NAME}: tx queue {} timeout, scheduling adapter reset",
                        q.me
                    );
                    wd.stalled = 0;
                    request_reset = true;
                }
            }
        }

        if request_reset {
            // Executed on a later tick, never in the detecting context.
            self.reset_request.store(true, Ordering::Release);
        }

        Ok(())
    }

    fn add_multicast_addr(&self, addr: &[u8; 6]) -> Result<(), NetDevError> {
        let restart;

        {
            let mut inner = self.config_lock_write().map_err(NetDevError::from)?;
            inner.multicast_addr.insert(*addr);

            restart = inner.flags.contains(NetFlags::UP);
        }

        if restart {
            NetDevice::down(self)?;
            NetDevice::up(self)?;
        }

        Ok(())
    }

    fn remove_multicast_addr(&self, addr: &[u8; 6]) -> Result<(), NetDevError> {
        let restart;

        {
            let mut inner = self.config_lock_write().map_err(NetDevError::from)?;
            inner.multicast_addr.remove(addr);

            restart = inner.flags.contains(NetFlags::UP);
        }

        if restart {
            NetDevice::down(self)?;
            NetDevice::up(self)?;
        }

        Ok(())
    }
}
