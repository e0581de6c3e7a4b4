use alloc::borrow::Cow;
use bitflags::bitflags;
use core::fmt::Display;

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

bitflags! {
    /// Per-packet metadata exchanged with the stack.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketHeaderFlags: u16 {
        const IPV4_CSUM_OUT = 0x0001; // IPv4 checksum needed
        const TCP_CSUM_OUT = 0x0002; // TCP checksum needed
        const UDP_CSUM_OUT = 0x0004; // UDP checksum needed
        const IPV4_CSUM_IN_OK = 0x0008; // IPv4 checksum verified
        const IPV4_CSUM_IN_BAD = 0x0010; // IPv4 checksum bad
        const TCP_CSUM_IN_OK = 0x0020; // TCP checksum verified
        const TCP_CSUM_IN_BAD = 0x0040; // TCP checksum bad
        const UDP_CSUM_IN_OK = 0x0080; // UDP checksum verified
        const UDP_CSUM_IN_BAD = 0x0100; // UDP checksum bad
        const FLOWID = 0x0200; // rx_hash is set
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NetFlags: u16 {
        const UP = 1 << 0; // interface is administratively up
        const BROADCAST = 1 << 1; // broadcast address valid
        const DEBUG = 1 << 2; // turn on debugging
        const RUNNING = 1 << 6; // resources allocated
        const PROMISC = 1 << 8; // receive all packets
        const ALLMULTI = 1 << 9; // receive all multicast packets
        const SIMPLEX = 1 << 11; // can't hear own transmissions
        const MULTICAST = 1 << 15; // supports multicast
    }

    /// Capabilities that interfaces can advertise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NetCapabilities: u32 {
        const CSUM_IPv4 = 1 << 0; // can do IPv4 header csum
        const CSUM_TCPv4 = 1 << 1; // can do IPv4/TCP csum
        const CSUM_UDPv4 = 1 << 2; // can do IPv4/UDP csum
        const VLAN_MTU = 1 << 4; // VLAN-compatible MTU
        const VLAN_HWTAGGING = 1 << 5; // hardware VLAN tag support
        const CSUM_TCPv6 = 1 << 7; // can do IPv6/TCP checksums
        const CSUM_UDPv6 = 1 << 8; // can do IPv6/UDP checksums
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    UpFullDuplex,
    UpHalfDuplex,
    Down,
    Unknown,
}

impl Display for LinkStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LinkStatus::Up => write!(f, "Up"),
            LinkStatus::UpFullDuplex => write!(f, "Up (Full Duplex)"),
            LinkStatus::UpHalfDuplex => write!(f, "Up (Half Duplex)"),
            LinkStatus::Down => write!(f, "Down"),
            LinkStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetDevError {
    AlreadyUp,
    AlreadyDown,
    /// No room to queue the frame right now; retry after completions.
    Busy,
    DeviceError,
    InvalidQueue,
    MulticastAddrError,
}

/// An outbound frame borrowed from the stack.
#[derive(Debug, Clone)]
pub struct EtherFrameRef<'a> {
    pub data: &'a [u8],
    pub vlan: Option<u16>,
    pub csum_flags: PacketHeaderFlags,
}

/// An inbound frame owned by the receiver, with completion metadata.
#[derive(Debug, Clone)]
pub struct EtherFrameBuf {
    pub data: Vec<u8>,
    pub vlan: Option<u16>,
    pub csum_flags: PacketHeaderFlags,
    pub rx_hash: Option<u32>,
}

/// A multi-queue network device.
///
/// Queues are processed in parallel, so implementations must be
/// thread-safe; no two `poll` activations for the same queue run
/// concurrently, but different queues' may.
pub trait NetDevice {
    fn recv(&self, que_id: usize) -> Result<Option<EtherFrameBuf>, NetDevError>;
    fn send(&self, data: EtherFrameRef, que_id: usize) -> Result<(), NetDevError>;

    fn flags(&self) -> NetFlags;
    fn capabilities(&self) -> NetCapabilities;

    /// Link speed in Mbps.
    fn link_speed(&self) -> u64;
    fn link_status(&self) -> LinkStatus;

    fn can_send(&self) -> bool;
    fn mac_address(&self) -> [u8; 6];

    fn device_short_name(&self) -> Cow<'static, str>;

    fn up(&self) -> Result<(), NetDevError>;
    fn down(&self) -> Result<(), NetDevError>;

    /// Interrupt handler entry point.
    fn interrupt(&self, irq: u16) -> Result<(), NetDevError>;
    fn irqs(&self) -> Vec<u16>;
    fn rx_irq_to_que_id(&self, irq: u16) -> Option<usize>;

    /// Number of queues the device exposes per direction.
    fn num_queues(&self) -> usize;

    /// Process up to `budget` completions on one queue, refilling RX and
    /// re-arming the queue's interrupt only if the budget was not
    /// exhausted. Returns the number of packets processed; callers keep
    /// polling while the budget comes back exhausted.
    fn poll(&self, que_id: usize, budget: usize) -> Result<usize, NetDevError>;

    /// Is the device serviced by platform polling instead of interrupts?
    fn poll_mode(&self) -> bool {
        false
    }

    /// Get the millisecond tick period.
    /// If `None`, the platform does not call `tick()`.
    fn tick_msec(&self) -> Option<u64> {
        None
    }

    /// Periodic service hook for watchdogs and link supervision.
    fn tick(&self) -> Result<(), NetDevError> {
        Ok(())
    }

    fn add_multicast_addr(&self, addr: &[u8; 6]) -> Result<(), NetDevError>;
    fn remove_multicast_addr(&self, addr: &[u8; 6]) -> Result<(), NetDevError>;
}
