//! RX forwarding and flow steering.
//!
//! Decides which UDMA and queue an inbound packet lands in: a Toeplitz
//! hash plus indirection table spreads the default load, explicit
//! overrides and user flow rules pin traffic, and the whole live
//! configuration can be carried across a function-level reset through an
//! adapter-owned shadow copy.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use alpine_lib::delay;

use super::hal::{
    EthHal, FlowProto, FlowRule, FwdMacEntry, HalError, FWD_MAC_TABLE_ENTRIES, RX_FLOW_RULE_SLOTS,
    RX_RSS_TABLE_SIZE, TOEPLITZ_KEY_WORDS,
};

// Fixed MAC table layout: one unicast entry, one broadcast entry, one
// catch-all used when promiscuous mode is on.
pub const FWD_MAC_IDX_UNICAST: usize = 0;
pub const FWD_MAC_IDX_BROADCAST: usize = 1;
pub const FWD_MAC_IDX_PROMISC: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteeringErr {
    /// Indirection bucket or queue out of range.
    Range,
    /// Only UDP rules are supported.
    UnsupportedProtocol,
    /// All user rule slots are valid already.
    NoFreeSlot,
    Hal(HalError),
}

impl core::fmt::Display for SteeringErr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Range => write!(f, "value out of range"),
            Self::UnsupportedProtocol => write!(f, "unsupported protocol"),
            Self::NoFreeSlot => write!(f, "no free flow rule slot"),
            Self::Hal(e) => write!(f, "register interface: {e}"),
        }
    }
}

impl From<HalError> for SteeringErr {
    fn from(value: HalError) -> Self {
        SteeringErr::Hal(value)
    }
}

/// Snapshot of the live hardware steering state.
#[derive(Debug, Clone)]
struct SteeringShadow {
    mac_table: [FwdMacEntry; FWD_MAC_TABLE_ENTRIES],
    key: [u32; TOEPLITZ_KEY_WORDS],
    indirection: [u8; RX_RSS_TABLE_SIZE],
    udma_override: Option<u8>,
    queue_override: Option<u8>,
    rules: [Option<FlowRule>; RX_FLOW_RULE_SLOTS],
}

/// Which half of the backup/restore pair ran last. The pair is guarded by
/// this flag so overlapping reset paths can call either side twice; the
/// second call is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Restored,
    Backed,
}

pub struct RxForwarding {
    /// Hash key, generated once at first bring-up and kept stable after.
    key: Option<[u32; TOEPLITZ_KEY_WORDS]>,
    udma_override: Option<u8>,
    queue_override: Option<u8>,
    rules: [Option<FlowRule>; RX_FLOW_RULE_SLOTS],
    shadow: Option<SteeringShadow>,
    phase: BackupPhase,
}

impl RxForwarding {
    pub fn new() -> Self {
        Self {
            key: None,
            udma_override: None,
            queue_override: None,
            rules: [None; RX_FLOW_RULE_SLOTS],
            shadow: None,
            phase: BackupPhase::Restored,
        }
    }

    #[inline(always)]
    pub fn phase(&self) -> BackupPhase {
        self.phase
    }

    #[inline(always)]
    pub fn udma_override(&self) -> Option<u8> {
        self.udma_override
    }

    #[inline(always)]
    pub fn queue_override(&self) -> Option<u8> {
        self.queue_override
    }

    /// Anything worth preserving across a reset?
    fn has_user_state(&self) -> bool {
        self.udma_override.is_some()
            || self.queue_override.is_some()
            || self.rules.iter().any(|r| r.is_some())
    }

    /// Program the default forwarding set: unicast and broadcast MAC
    /// entries, the hash key, and a round-robin indirection table over the
    /// available RX queues.
    pub fn configure_default(
        &mut self,
        hal: &dyn EthHal,
        mac_addr: &[u8; 6],
        num_queues: usize,
        promisc: bool,
    ) -> Result<(), SteeringErr> {
        let unicast = FwdMacEntry {
            addr: *mac_addr,
            mask: [0xff; 6],
            udma_mask: 1,
            queue: 0,
            rx_valid: true,
        };
        hal.set_mac_table_entry(FWD_MAC_IDX_UNICAST, &unicast)?;

        let broadcast = FwdMacEntry {
            addr: [0xff; 6],
            mask: [0xff; 6],
            udma_mask: 1,
            queue: 0,
            rx_valid: true,
        };
        hal.set_mac_table_entry(FWD_MAC_IDX_BROADCAST, &broadcast)?;

        let promisc_entry = FwdMacEntry {
            addr: [0; 6],
            mask: [0; 6],
            udma_mask: 1,
            queue: 0,
            rx_valid: promisc,
        };
        hal.set_mac_table_entry(FWD_MAC_IDX_PROMISC, &promisc_entry)?;

        let key = *self.key.get_or_insert_with(generate_toeplitz_key);
        hal.set_toeplitz_key(&key)?;

        for bucket in 0..RX_RSS_TABLE_SIZE {
            hal.set_indirection_entry(bucket, (bucket % num_queues) as u8)?;
        }

        hal.set_default_override(self.udma_override, self.queue_override)?;

        for (slot, rule) in self.rules.iter().enumerate() {
            hal.set_flow_rule(slot, rule.as_ref())?;
        }

        Ok(())
    }

    /// Pin one hash bucket to a queue.
    pub fn set_indirection_entry(
        &mut self,
        hal: &dyn EthHal,
        bucket: usize,
        queue: u8,
        num_queues: usize,
    ) -> Result<(), SteeringErr> {
        if bucket >= RX_RSS_TABLE_SIZE || queue as usize >= num_queues {
            return Err(SteeringErr::Range);
        }

        hal.set_indirection_entry(bucket, queue)?;
        Ok(())
    }

    /// Set or clear the UDMA override. The queue override, if any, is
    /// reasserted untouched: the two knobs are independent.
    pub fn set_udma_override(
        &mut self,
        hal: &dyn EthHal,
        mask: Option<u8>,
    ) -> Result<(), SteeringErr> {
        self.udma_override = mask;
        hal.set_default_override(self.udma_override, self.queue_override)?;
        Ok(())
    }

    pub fn set_queue_override(
        &mut self,
        hal: &dyn EthHal,
        queue: Option<u8>,
        num_queues: usize,
    ) -> Result<(), SteeringErr> {
        if let Some(q) = queue {
            if q as usize >= num_queues {
                return Err(SteeringErr::Range);
            }
        }

        self.queue_override = queue;
        hal.set_default_override(self.udma_override, self.queue_override)?;
        Ok(())
    }

    /// Install a user flow rule in the first free slot.
    pub fn add_flow_rule(
        &mut self,
        hal: &dyn EthHal,
        rule: FlowRule,
    ) -> Result<usize, SteeringErr> {
        match rule.proto {
            FlowProto::Udp => (),
            _ => return Err(SteeringErr::UnsupportedProtocol),
        }

        let Some(slot) = self.rules.iter().position(|r| r.is_none()) else {
            return Err(SteeringErr::NoFreeSlot);
        };

        hal.set_flow_rule(slot, Some(&rule))?;
        self.rules[slot] = Some(rule);

        Ok(slot)
    }

    pub fn remove_flow_rule(&mut self, hal: &dyn EthHal, slot: usize) -> Result<(), SteeringErr> {
        if slot >= RX_FLOW_RULE_SLOTS {
            return Err(SteeringErr::Range);
        }

        hal.set_flow_rule(slot, None)?;
        self.rules[slot] = None;

        Ok(())
    }

    /// Copy the live hardware steering state into the shadow. A second
    /// call before the matching restore is a no-op, and the pair is
    /// skipped entirely while no override or user rule is active.
    pub fn backup_before_reset(&mut self, hal: &dyn EthHal) -> Result<(), SteeringErr> {
        if self.phase == BackupPhase::Backed {
            return Ok(());
        }

        if !self.has_user_state() {
            return Ok(());
        }

        let mut mac_table = [FwdMacEntry::invalid(); FWD_MAC_TABLE_ENTRIES];
        for (idx, entry) in mac_table.iter_mut().enumerate() {
            *entry = hal.mac_table_entry(idx)?;
        }

        let key = hal.toeplitz_key()?;

        let mut indirection = [0u8; RX_RSS_TABLE_SIZE];
        for (bucket, entry) in indirection.iter_mut().enumerate() {
            *entry = hal.indirection_entry(bucket)?;
        }

        let (udma_override, queue_override) = hal.default_override()?;

        let mut rules = [None; RX_FLOW_RULE_SLOTS];
        for (slot, rule) in rules.iter_mut().enumerate() {
            *rule = hal.flow_rule(slot)?;
        }

        self.shadow = Some(SteeringShadow {
            mac_table,
            key,
            indirection,
            udma_override,
            queue_override,
            rules,
        });
        self.phase = BackupPhase::Backed;

        Ok(())
    }

    /// Write the shadow back to the hardware. No-op unless a backup is
    /// pending.
    pub fn restore_after_reset(&mut self, hal: &dyn EthHal) -> Result<(), SteeringErr> {
        if self.phase == BackupPhase::Restored {
            return Ok(());
        }
        self.phase = BackupPhase::Restored;

        let Some(shadow) = self.shadow.take() else {
            return Ok(());
        };

        for (idx, entry) in shadow.mac_table.iter().enumerate() {
            hal.set_mac_table_entry(idx, entry)?;
        }

        hal.set_toeplitz_key(&shadow.key)?;

        for (bucket, entry) in shadow.indirection.iter().enumerate() {
            hal.set_indirection_entry(bucket, *entry)?;
        }

        hal.set_default_override(shadow.udma_override, shadow.queue_override)?;

        for (slot, rule) in shadow.rules.iter().enumerate() {
            hal.set_flow_rule(slot, rule.as_ref())?;
        }

        self.udma_override = shadow.udma_override;
        self.queue_override = shadow.queue_override;
        self.rules = shadow.rules;

        Ok(())
    }
}

impl Default for RxForwarding {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_toeplitz_key() -> [u32; TOEPLITZ_KEY_WORDS] {
    let mut rng = SmallRng::seed_from_u64(delay::uptime() ^ 0x416c_7069_6e65);

    let mut key = [0u32; TOEPLITZ_KEY_WORDS];
    for word in &mut key {
        *word = rng.gen::<u32>();
    }

    key
}
