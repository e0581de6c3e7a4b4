//! Hardware error and event collection.
//!
//! Error indications arrive either as interrupt causes or by periodic
//! polling, depending on what each source supports. Counts accumulate
//! under a lock shared with the statistics reader. Sources whose counters
//! have not finished hardware self-initialization are skipped until they
//! report ready, so the collector never turns init noise into errors.

use alpine_lib::sync::{mcs::MCSNode, mutex::Mutex};

use super::hal::{ErrorSource, EthHal, ERROR_SOURCES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectMode {
    Interrupt,
    Polling,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorCounters {
    pub mac_parity: u64,
    pub udma_axi: u64,
    pub fec_correctable: u64,
    pub fec_uncorrectable: u64,
}

pub struct ErrEvents {
    counters: Mutex<ErrorCounters>,
}

impl ErrEvents {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(ErrorCounters::default()),
        }
    }

    /// Read and clear the hardware cause counters, folding them into the
    /// in-memory totals. Polled sources defer until they report ready.
    pub fn collect(&self, hal: &dyn EthHal, mode: CollectMode) {
        for src in ERROR_SOURCES {
            if mode == CollectMode::Polling && !hal.error_source_ready(src) {
                continue;
            }

            let delta = hal.read_and_clear_error(src);
            if delta == 0 {
                continue;
            }

            let mut node = MCSNode::new();
            let mut counters = self.counters.lock(&mut node);

            match src {
                ErrorSource::MacParity => counters.mac_parity += delta,
                ErrorSource::UdmaAxiError => counters.udma_axi += delta,
                ErrorSource::FecCorrectable => counters.fec_correctable += delta,
                ErrorSource::FecUncorrectable => counters.fec_uncorrectable += delta,
            }
        }
    }

    pub fn counters(&self) -> ErrorCounters {
        let mut node = MCSNode::new();
        let counters = *self.counters.lock(&mut node);
        counters
    }

    pub fn clear(&self) {
        let mut node = MCSNode::new();
        *self.counters.lock(&mut node) = ErrorCounters::default();
    }
}

impl Default for ErrEvents {
    fn default() -> Self {
        Self::new()
    }
}
