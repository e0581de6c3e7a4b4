//! Device register interface of the Alpine Ethernet unit.
//!
//! The register-level HAL is a separate component; the driver core only
//! depends on this capability contract. An implementation translates these
//! calls into the unit's register writes, and the test suite substitutes a
//! software register file.

use alpine_lib::addr::phy_addr::PhyAddr;

/// RSS indirection table size, in hash buckets.
pub const RX_RSS_TABLE_SIZE: usize = 256;

/// Toeplitz hash key length, in 32-bit words.
pub const TOEPLITZ_KEY_WORDS: usize = 10;

/// Forwarding MAC table entries reachable by the driver.
pub const FWD_MAC_TABLE_ENTRIES: usize = 8;

/// User-definable flow-steering rule slots, beyond the built-in protocol
/// entries the unit resolves on its own.
pub const RX_FLOW_RULE_SLOTS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingDirection {
    Tx,
    Rx,
}

impl core::fmt::Display for RingDirection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Tx => write!(f, "tx"),
            Self::Rx => write!(f, "rx"),
        }
    }
}

/// Interrupt cause groups of the unit's interrupt controller.
///
/// Group A carries management and link causes, B per-RX-queue completion
/// bits, C per-TX-queue completion bits, and D error causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoficGroup {
    A,
    B,
    C,
    D,
}

/// Group A cause bit: link state changed.
pub const INT_GROUP_A_LINK_CHANGE: u32 = 1 << 0;

/// Group D cause bits, one per error source.
pub const INT_GROUP_D_MAC_PARITY: u32 = 1 << 0;
pub const INT_GROUP_D_UDMA_AXI: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacMode {
    Rgmii,
    Sgmii,
    Sgmii2G5,
    TenGSerial,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkParams {
    pub speed_mbps: u32,
    pub full_duplex: bool,
    pub autoneg: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FlowControlParams {
    pub rx_pause: bool,
    pub tx_pause: bool,
    /// Pause quanta advertised in generated pause frames.
    pub quanta: u16,
    /// Refresh threshold at which pause frames are re-sent.
    pub quanta_th: u16,
}

impl Default for FlowControlParams {
    fn default() -> Self {
        Self {
            rx_pause: true,
            tx_pause: true,
            quanta: 0xffff,
            quanta_th: 0x8000,
        }
    }
}

/// Descriptor ring placement pushed down when a queue is configured.
#[derive(Debug, Clone, Copy)]
pub struct QueueParams {
    pub base: PhyAddr,
    pub hw_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacCounter {
    FramesRxOk,
    FramesTxOk,
    OctetsRx,
    OctetsTx,
    CrcErrors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    MacParity,
    UdmaAxiError,
    FecCorrectable,
    FecUncorrectable,
}

pub const ERROR_SOURCES: [ErrorSource; 4] = [
    ErrorSource::MacParity,
    ErrorSource::UdmaAxiError,
    ErrorSource::FecCorrectable,
    ErrorSource::FecUncorrectable,
];

/// A forwarding MAC table entry: frames matching `addr` under `mask` are
/// steered to the given UDMA set and queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwdMacEntry {
    pub addr: [u8; 6],
    pub mask: [u8; 6],
    pub udma_mask: u8,
    pub queue: u8,
    pub rx_valid: bool,
}

impl FwdMacEntry {
    pub const fn invalid() -> Self {
        Self {
            addr: [0; 6],
            mask: [0; 6],
            udma_mask: 0,
            queue: 0,
            rx_valid: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowProto {
    Udp,
    /// Accepted at the management boundary, rejected by the rule table:
    /// the unit only resolves UDP destination-port rules.
    Tcp,
}

/// A user flow-steering rule: protocol plus masked destination port,
/// steered to an explicit queue and/or UDMA set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRule {
    pub proto: FlowProto,
    pub dport: u16,
    pub dport_mask: u16,
    pub queue: Option<u8>,
    pub udma_mask: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    Config,
    Reset,
    NotReady,
    Range,
}

impl core::fmt::Display for HalError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Config => write!(f, "register configuration failure"),
            Self::Reset => write!(f, "reset failure"),
            Self::NotReady => write!(f, "device not ready"),
            Self::Range => write!(f, "register index out of range"),
        }
    }
}

/// Capability contract over the Alpine Ethernet unit's registers.
///
/// Calls are non-reentrant for a given adapter: the driver issues them
/// either under its configuration lock or from the single activation of a
/// queue's poll path.
pub trait EthHal: Send + Sync {
    // Queue / ring plumbing

    fn configure_queue(
        &self,
        dir: RingDirection,
        id: usize,
        params: &QueueParams,
    ) -> Result<(), HalError>;

    /// Ring the queue's doorbell with the new producer tail, a
    /// free-running post count the hardware masks internally.
    fn set_ring_tail(&self, dir: RingDirection, id: usize, tail: u32) -> Result<(), HalError>;

    /// Read the consumer head the hardware has advanced to, as a
    /// free-running completion count.
    fn ring_head(&self, dir: RingDirection, id: usize) -> Result<u32, HalError>;

    // MAC / link

    fn set_mac_mode(&self, mode: MacMode) -> Result<(), HalError>;
    fn set_link_params(&self, params: &LinkParams) -> Result<(), HalError>;
    fn set_flow_control(&self, params: &FlowControlParams) -> Result<(), HalError>;
    fn mac_start(&self) -> Result<(), HalError>;
    fn mac_stop(&self) -> Result<(), HalError>;
    fn link_up(&self) -> bool;

    // Interrupt controller

    /// Read and clear the group's pending cause bits. Masking gates
    /// interrupt generation, not cause accumulation.
    fn read_cause(&self, group: IoficGroup) -> u32;
    fn mask(&self, group: IoficGroup, bits: u32);
    fn unmask(&self, group: IoficGroup, bits: u32);

    /// Program the coalescing interval of one queue, in microseconds.
    fn set_coalescing(&self, dir: RingDirection, id: usize, usec: u32) -> Result<(), HalError>;

    // Reset / counters

    fn function_level_reset(&self) -> Result<(), HalError>;
    fn read_counter(&self, counter: MacCounter) -> u64;

    // RX forwarding

    fn set_mac_table_entry(&self, idx: usize, entry: &FwdMacEntry) -> Result<(), HalError>;
    fn mac_table_entry(&self, idx: usize) -> Result<FwdMacEntry, HalError>;

    fn set_toeplitz_key(&self, key: &[u32; TOEPLITZ_KEY_WORDS]) -> Result<(), HalError>;
    fn toeplitz_key(&self) -> Result<[u32; TOEPLITZ_KEY_WORDS], HalError>;

    fn set_indirection_entry(&self, bucket: usize, queue: u8) -> Result<(), HalError>;
    fn indirection_entry(&self, bucket: usize) -> Result<u8, HalError>;

    /// Program both default-forwarding overrides at once; either may be
    /// absent. They are independent and combine when both are set.
    fn set_default_override(
        &self,
        udma_mask: Option<u8>,
        queue: Option<u8>,
    ) -> Result<(), HalError>;
    fn default_override(&self) -> Result<(Option<u8>, Option<u8>), HalError>;

    fn set_flow_rule(&self, slot: usize, rule: Option<&FlowRule>) -> Result<(), HalError>;
    fn flow_rule(&self, slot: usize) -> Result<Option<FlowRule>, HalError>;

    // Error sources

    /// Whether the source's counters have finished hardware self-init and
    /// read as meaningful values.
    fn error_source_ready(&self, src: ErrorSource) -> bool;

    /// Read and clear one error counter.
    fn read_and_clear_error(&self, src: ErrorSource) -> u64;
}
