//! Software register file implementing `EthHal`, plus a small device
//! model: it consumes posted descriptors, writes completions back into
//! ring memory, and raises cause bits, so the driver core can be driven
//! end to end without silicon.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once};

use alpine_drivers::eth::hal::{
    ErrorSource, EthHal, FlowRule, FwdMacEntry, HalError, IoficGroup, LinkParams, MacCounter,
    MacMode, QueueParams, RingDirection, FlowControlParams, FWD_MAC_TABLE_ENTRIES,
    INT_GROUP_A_LINK_CHANGE, RX_FLOW_RULE_SLOTS, RX_RSS_TABLE_SIZE, TOEPLITZ_KEY_WORDS,
};
use alpine_drivers::eth::ring::{
    UdmaRxDesc, UdmaTxDesc, RXD_STAT_DD, RXD_STAT_EOP, RXD_STAT_HASH, RXD_STAT_IPV4_CSUM_OK,
    RXD_STAT_L4_CSUM_OK, RXD_STAT_L4_UDP, RXD_STAT_VLAN,
};
use alpine_drivers::eth::AdapterRuntimeConfig;
use alpine_lib::addr::Addr;
use alpine_lib::net::ether::{ETHER_TYPE_IP, IPPROTO_UDP};
use alpine_lib::paging::PAGESIZE;

static SEED: Once = Once::new();

pub fn seed_dma_pool() {
    SEED.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        alpine_lib::dma_pool::init_dma_pool_from_heap(0, 8192 * PAGESIZE);
    });
}

/// Small rings keep the test footprint on the DMA pool reasonable.
pub fn test_config(num_queues: usize) -> AdapterRuntimeConfig {
    let mut cfg = AdapterRuntimeConfig::new();
    cfg.num_queues = num_queues;
    cfg.rx_descs_sw = 64;
    cfg.rx_descs_hw = 64;
    cfg.tx_descs_sw = 64;
    cfg.tx_descs_hw = 64;
    cfg
}

/// A minimal, valid IPv4/UDP frame for steering and offload tests.
pub fn udp_frame(dport: u16, payload_len: usize) -> Vec<u8> {
    let mut frame = Vec::new();

    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]);
    frame.extend_from_slice(&ETHER_TYPE_IP.to_be_bytes());

    let ip_len = 20 + 8 + payload_len;
    frame.push(0x45);
    frame.push(0);
    frame.extend_from_slice(&(ip_len as u16).to_be_bytes());
    frame.extend_from_slice(&[0; 4]);
    frame.push(64);
    frame.push(IPPROTO_UDP);
    frame.extend_from_slice(&[0; 2]);
    frame.extend_from_slice(&[10, 0, 0, 1]);
    frame.extend_from_slice(&[10, 0, 0, 2]);

    frame.extend_from_slice(&4000u16.to_be_bytes());
    frame.extend_from_slice(&dport.to_be_bytes());
    frame.extend_from_slice(&((8 + payload_len) as u16).to_be_bytes());
    frame.extend_from_slice(&[0; 2]);

    frame.resize(frame.len() + payload_len, 0xa5);
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOp {
    SetMacMode,
    ConfigureQueue,
    MacStart,
    SetCoalescing,
    Flr,
    SetFlowRule,
}

#[derive(Debug, Clone, Copy, Default)]
struct SimQueue {
    base: usize,
    hw_count: u32,
    tail: u32,
    head: u32,
    configured: bool,
    coalescing_usec: u32,
}

struct State {
    tx: Vec<SimQueue>,
    rx: Vec<SimQueue>,

    mac_table: [FwdMacEntry; FWD_MAC_TABLE_ENTRIES],
    key: [u32; TOEPLITZ_KEY_WORDS],
    indirection: [u8; RX_RSS_TABLE_SIZE],
    overrides: (Option<u8>, Option<u8>),
    rules: [Option<FlowRule>; RX_FLOW_RULE_SLOTS],

    cause: [u32; 4],
    mask: [u32; 4],

    mac_started: bool,
    mac_mode: Option<MacMode>,

    err_counts: [u64; 4],
    err_ready: [bool; 4],

    flr_count: u32,
    frames_tx_ok: u64,
    frames_rx_ok: u64,
}

impl State {
    fn new(num_queues: usize) -> Self {
        Self {
            tx: vec![SimQueue::default(); num_queues],
            rx: vec![SimQueue::default(); num_queues],
            mac_table: [FwdMacEntry::invalid(); FWD_MAC_TABLE_ENTRIES],
            key: [0; TOEPLITZ_KEY_WORDS],
            indirection: [0; RX_RSS_TABLE_SIZE],
            overrides: (None, None),
            rules: [None; RX_FLOW_RULE_SLOTS],
            cause: [0; 4],
            mask: [!0; 4],
            mac_started: false,
            mac_mode: None,
            err_counts: [0; 4],
            err_ready: [true; 4],
            flr_count: 0,
            frames_tx_ok: 0,
            frames_rx_ok: 0,
        }
    }

    fn wipe_config(&mut self) {
        for q in self.tx.iter_mut().chain(self.rx.iter_mut()) {
            *q = SimQueue::default();
        }
        self.mac_table = [FwdMacEntry::invalid(); FWD_MAC_TABLE_ENTRIES];
        self.key = [0; TOEPLITZ_KEY_WORDS];
        self.indirection = [0; RX_RSS_TABLE_SIZE];
        self.overrides = (None, None);
        self.rules = [None; RX_FLOW_RULE_SLOTS];
        self.cause = [0; 4];
        self.mask = [!0; 4];
        self.mac_started = false;
        self.mac_mode = None;
    }
}

fn gidx(group: IoficGroup) -> usize {
    match group {
        IoficGroup::A => 0,
        IoficGroup::B => 1,
        IoficGroup::C => 2,
        IoficGroup::D => 3,
    }
}

fn eidx(src: ErrorSource) -> usize {
    match src {
        ErrorSource::MacParity => 0,
        ErrorSource::UdmaAxiError => 1,
        ErrorSource::FecCorrectable => 2,
        ErrorSource::FecUncorrectable => 3,
    }
}

pub struct SimHal {
    st: Mutex<State>,
    link: AtomicBool,
    fail: Mutex<Option<FailOp>>,
}

impl SimHal {
    pub fn new(num_queues: usize) -> Self {
        Self {
            st: Mutex::new(State::new(num_queues)),
            link: AtomicBool::new(true),
            fail: Mutex::new(None),
        }
    }

    fn should_fail(&self, op: FailOp) -> bool {
        *self.fail.lock().unwrap() == Some(op)
    }

    pub fn set_fail(&self, op: Option<FailOp>) {
        *self.fail.lock().unwrap() = op;
    }

    pub fn set_link(&self, up: bool) {
        let prev = self.link.swap(up, Ordering::SeqCst);
        if prev != up {
            let mut st = self.st.lock().unwrap();
            st.cause[gidx(IoficGroup::A)] |= INT_GROUP_A_LINK_CHANGE;
        }
    }

    pub fn flr_count(&self) -> u32 {
        self.st.lock().unwrap().flr_count
    }

    pub fn queue_configured(&self, dir: RingDirection, id: usize) -> bool {
        let st = self.st.lock().unwrap();
        match dir {
            RingDirection::Tx => st.tx.get(id).is_some_and(|q| q.configured),
            RingDirection::Rx => st.rx.get(id).is_some_and(|q| q.configured),
        }
    }

    pub fn coalescing(&self, dir: RingDirection, id: usize) -> u32 {
        let st = self.st.lock().unwrap();
        match dir {
            RingDirection::Tx => st.tx[id].coalescing_usec,
            RingDirection::Rx => st.rx[id].coalescing_usec,
        }
    }

    pub fn hw_indirection(&self) -> [u8; RX_RSS_TABLE_SIZE] {
        self.st.lock().unwrap().indirection
    }

    pub fn hw_key(&self) -> [u32; TOEPLITZ_KEY_WORDS] {
        self.st.lock().unwrap().key
    }

    pub fn hw_overrides(&self) -> (Option<u8>, Option<u8>) {
        self.st.lock().unwrap().overrides
    }

    pub fn hw_rules(&self) -> [Option<FlowRule>; RX_FLOW_RULE_SLOTS] {
        self.st.lock().unwrap().rules
    }

    pub fn hw_mac_table(&self) -> [FwdMacEntry; FWD_MAC_TABLE_ENTRIES] {
        self.st.lock().unwrap().mac_table
    }

    pub fn push_error(&self, src: ErrorSource, count: u64) {
        let mut st = self.st.lock().unwrap();
        st.err_counts[eidx(src)] += count;
        st.cause[gidx(IoficGroup::D)] |= 1 << eidx(src);
    }

    pub fn set_error_ready(&self, src: ErrorSource, ready: bool) {
        self.st.lock().unwrap().err_ready[eidx(src)] = ready;
    }

    /// Posted-but-unconsumed RX descriptors of one queue.
    pub fn pending_rx_slots(&self, q: usize) -> u32 {
        let st = self.st.lock().unwrap();
        st.rx[q].tail.wrapping_sub(st.rx[q].head)
    }

    /// Play the device: fill the next posted RX buffer of queue `q` with
    /// `data` and complete its descriptor.
    pub fn inject_rx(
        &self,
        q: usize,
        data: &[u8],
        vlan: Option<u16>,
        hash: Option<u32>,
        csum_ok: bool,
    ) -> bool {
        let mut st = self.st.lock().unwrap();
        let rq = &mut st.rx[q];

        if !rq.configured || rq.tail == rq.head {
            return false;
        }

        let idx = (rq.head & (rq.hw_count - 1)) as usize;
        let dp = (rq.base as *mut UdmaRxDesc).wrapping_add(idx);
        let mut d = unsafe { std::ptr::read_volatile(dp) };

        if data.len() > d.len as usize {
            return false;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), d.buf as usize as *mut u8, data.len());
        }

        d.len = data.len() as u16;
        d.error = 0;
        d.status = RXD_STAT_DD | RXD_STAT_EOP;
        if let Some(tag) = vlan {
            d.status |= RXD_STAT_VLAN;
            d.vlan = tag;
        }
        if let Some(h) = hash {
            d.status |= RXD_STAT_HASH;
            d.hash = h;
        }
        if csum_ok {
            d.status |= RXD_STAT_IPV4_CSUM_OK | RXD_STAT_L4_CSUM_OK | RXD_STAT_L4_UDP;
        }

        unsafe { std::ptr::write_volatile(dp, d) };

        rq.head = rq.head.wrapping_add(1);
        st.frames_rx_ok += 1;
        st.cause[gidx(IoficGroup::B)] |= 1 << q;

        true
    }

    /// Complete up to `n` pending TX descriptors of queue `q`.
    pub fn complete_tx(&self, q: usize, n: u32) -> u32 {
        let mut st = self.st.lock().unwrap();
        let tq = &mut st.tx[q];

        let pending = tq.tail.wrapping_sub(tq.head);
        let n = n.min(pending);
        tq.head = tq.head.wrapping_add(n);

        st.frames_tx_ok += n as u64;
        if n > 0 {
            st.cause[gidx(IoficGroup::C)] |= 1 << q;
        }

        n
    }

    pub fn last_tx_desc(&self, q: usize) -> Option<UdmaTxDesc> {
        let st = self.st.lock().unwrap();
        let tq = &st.tx[q];

        if !tq.configured || tq.tail == 0 {
            return None;
        }

        let idx = (tq.tail.wrapping_sub(1) & (tq.hw_count - 1)) as usize;
        let dp = (tq.base as *const UdmaTxDesc).wrapping_add(idx);
        Some(unsafe { std::ptr::read_volatile(dp) })
    }

    pub fn last_tx_frame(&self, q: usize) -> Option<Vec<u8>> {
        let d = self.last_tx_desc(q)?;
        let len = (d.len_flags & 0xffff) as usize;
        let mut data = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(d.buf as usize as *const u8, data.as_mut_ptr(), len);
        }
        Some(data)
    }
}

impl EthHal for SimHal {
    fn configure_queue(
        &self,
        dir: RingDirection,
        id: usize,
        params: &QueueParams,
    ) -> Result<(), HalError> {
        if self.should_fail(FailOp::ConfigureQueue) {
            return Err(HalError::Config);
        }

        let mut st = self.st.lock().unwrap();
        let q = match dir {
            RingDirection::Tx => st.tx.get_mut(id),
            RingDirection::Rx => st.rx.get_mut(id),
        }
        .ok_or(HalError::Range)?;

        q.base = params.base.as_usize();
        q.hw_count = params.hw_count;
        q.tail = 0;
        q.head = 0;
        q.configured = true;

        Ok(())
    }

    fn set_ring_tail(&self, dir: RingDirection, id: usize, tail: u32) -> Result<(), HalError> {
        let mut st = self.st.lock().unwrap();
        let q = match dir {
            RingDirection::Tx => st.tx.get_mut(id),
            RingDirection::Rx => st.rx.get_mut(id),
        }
        .ok_or(HalError::Range)?;

        q.tail = tail;
        Ok(())
    }

    fn ring_head(&self, dir: RingDirection, id: usize) -> Result<u32, HalError> {
        let st = self.st.lock().unwrap();
        let q = match dir {
            RingDirection::Tx => st.tx.get(id),
            RingDirection::Rx => st.rx.get(id),
        }
        .ok_or(HalError::Range)?;

        Ok(q.head)
    }

    fn set_mac_mode(&self, mode: MacMode) -> Result<(), HalError> {
        if self.should_fail(FailOp::SetMacMode) {
            return Err(HalError::Config);
        }
        self.st.lock().unwrap().mac_mode = Some(mode);
        Ok(())
    }

    fn set_link_params(&self, _params: &LinkParams) -> Result<(), HalError> {
        Ok(())
    }

    fn set_flow_control(&self, _params: &FlowControlParams) -> Result<(), HalError> {
        Ok(())
    }

    fn mac_start(&self) -> Result<(), HalError> {
        if self.should_fail(FailOp::MacStart) {
            return Err(HalError::Config);
        }
        self.st.lock().unwrap().mac_started = true;
        Ok(())
    }

    fn mac_stop(&self) -> Result<(), HalError> {
        self.st.lock().unwrap().mac_started = false;
        Ok(())
    }

    fn link_up(&self) -> bool {
        self.link.load(Ordering::SeqCst)
    }

    fn read_cause(&self, group: IoficGroup) -> u32 {
        let mut st = self.st.lock().unwrap();
        let g = gidx(group);
        let v = st.cause[g];
        st.cause[g] = 0;
        v
    }

    fn mask(&self, group: IoficGroup, bits: u32) {
        self.st.lock().unwrap().mask[gidx(group)] |= bits;
    }

    fn unmask(&self, group: IoficGroup, bits: u32) {
        self.st.lock().unwrap().mask[gidx(group)] &= !bits;
    }

    fn set_coalescing(&self, dir: RingDirection, id: usize, usec: u32) -> Result<(), HalError> {
        if self.should_fail(FailOp::SetCoalescing) {
            return Err(HalError::Config);
        }

        let mut st = self.st.lock().unwrap();
        let q = match dir {
            RingDirection::Tx => st.tx.get_mut(id),
            RingDirection::Rx => st.rx.get_mut(id),
        }
        .ok_or(HalError::Range)?;

        q.coalescing_usec = usec;
        Ok(())
    }

    fn function_level_reset(&self) -> Result<(), HalError> {
        if self.should_fail(FailOp::Flr) {
            return Err(HalError::Reset);
        }

        let mut st = self.st.lock().unwrap();
        st.wipe_config();
        st.flr_count += 1;
        Ok(())
    }

    fn read_counter(&self, counter: MacCounter) -> u64 {
        let st = self.st.lock().unwrap();
        match counter {
            MacCounter::FramesTxOk => st.frames_tx_ok,
            MacCounter::FramesRxOk => st.frames_rx_ok,
            _ => 0,
        }
    }

    fn set_mac_table_entry(&self, idx: usize, entry: &FwdMacEntry) -> Result<(), HalError> {
        let mut st = self.st.lock().unwrap();
        *st.mac_table.get_mut(idx).ok_or(HalError::Range)? = *entry;
        Ok(())
    }

    fn mac_table_entry(&self, idx: usize) -> Result<FwdMacEntry, HalError> {
        let st = self.st.lock().unwrap();
        st.mac_table.get(idx).copied().ok_or(HalError::Range)
    }

    fn set_toeplitz_key(&self, key: &[u32; TOEPLITZ_KEY_WORDS]) -> Result<(), HalError> {
        self.st.lock().unwrap().key = *key;
        Ok(())
    }

    fn toeplitz_key(&self) -> Result<[u32; TOEPLITZ_KEY_WORDS], HalError> {
        Ok(self.st.lock().unwrap().key)
    }

    fn set_indirection_entry(&self, bucket: usize, queue: u8) -> Result<(), HalError> {
        let mut st = self.st.lock().unwrap();
        *st.indirection.get_mut(bucket).ok_or(HalError::Range)? = queue;
        Ok(())
    }

    fn indirection_entry(&self, bucket: usize) -> Result<u8, HalError> {
        let st = self.st.lock().unwrap();
        st.indirection.get(bucket).copied().ok_or(HalError::Range)
    }

    fn set_default_override(
        &self,
        udma_mask: Option<u8>,
        queue: Option<u8>,
    ) -> Result<(), HalError> {
        self.st.lock().unwrap().overrides = (udma_mask, queue);
        Ok(())
    }

    fn default_override(&self) -> Result<(Option<u8>, Option<u8>), HalError> {
        Ok(self.st.lock().unwrap().overrides)
    }

    fn set_flow_rule(&self, slot: usize, rule: Option<&FlowRule>) -> Result<(), HalError> {
        if self.should_fail(FailOp::SetFlowRule) {
            return Err(HalError::Config);
        }

        let mut st = self.st.lock().unwrap();
        *st.rules.get_mut(slot).ok_or(HalError::Range)? = rule.copied();
        Ok(())
    }

    fn flow_rule(&self, slot: usize) -> Result<Option<FlowRule>, HalError> {
        let st = self.st.lock().unwrap();
        st.rules.get(slot).copied().ok_or(HalError::Range)
    }

    fn error_source_ready(&self, src: ErrorSource) -> bool {
        self.st.lock().unwrap().err_ready[eidx(src)]
    }

    fn read_and_clear_error(&self, src: ErrorSource) -> u64 {
        let mut st = self.st.lock().unwrap();
        let v = st.err_counts[eidx(src)];
        st.err_counts[eidx(src)] = 0;
        v
    }
}
