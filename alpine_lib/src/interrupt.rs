//! Interrupt vector registry.
//!
//! The platform owns the real interrupt controller; this module models the
//! part the drivers need: a bounded budget of message-signalled vectors,
//! handler registration that hands back an owned [`IRQ`], and a `trigger`
//! entry point the platform (or a simulated device) calls on delivery.
//! Dropping an [`IRQ`] releases its vector, so a failed multi-vector
//! allocation rolls back by dropping what it acquired.

use alloc::{borrow::Cow, boxed::Box, collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use crate::sync::{mcs::MCSNode, mutex::Mutex};

type IrqHandler = Arc<dyn Fn(u16) + Send + Sync>;

struct Entry {
    #[allow(dead_code)]
    name: Cow<'static, str>,
    handler: IrqHandler,
    enabled: bool,
}

static HANDLERS: Mutex<BTreeMap<u16, Entry>> = Mutex::new(BTreeMap::new());
static NEXT_IRQ: AtomicU16 = AtomicU16::new(1);
static VECTOR_BUDGET: AtomicUsize = AtomicUsize::new(usize::MAX);
static ACTIVE_HANDLERS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    NoVectors,
}

impl core::fmt::Display for IrqError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoVectors => write!(f, "no interrupt vectors left"),
        }
    }
}

/// An owned interrupt vector. Dropping it unbinds the handler.
#[derive(Debug)]
pub struct IRQ {
    irq: u16,
}

impl IRQ {
    #[inline(always)]
    pub fn get_irq(&self) -> u16 {
        self.irq
    }

    pub fn enable(&mut self) {
        set_enabled(self.irq, true);
    }

    pub fn disable(&mut self) {
        set_enabled(self.irq, false);
    }
}

impl Drop for IRQ {
    fn drop(&mut self) {
        let mut node = MCSNode::new();
        let mut handlers = HANDLERS.lock(&mut node);
        handlers.remove(&self.irq);
    }
}

fn set_enabled(irq: u16, enabled: bool) {
    let mut node = MCSNode::new();
    let mut handlers = HANDLERS.lock(&mut node);
    if let Some(entry) = handlers.get_mut(&irq) {
        entry.enabled = enabled;
    }
}

/// Limit how many vectors `register_handler` will hand out. The platform
/// sets this from what the interrupt controller actually offers.
pub fn set_vector_budget(n: usize) {
    VECTOR_BUDGET.store(n, Ordering::Relaxed);
}

pub fn register_handler(
    name: Cow<'static, str>,
    handler: Box<dyn Fn(u16) + Send + Sync>,
) -> Result<IRQ, IrqError> {
    let mut node = MCSNode::new();
    let mut handlers = HANDLERS.lock(&mut node);

    if handlers.len() >= VECTOR_BUDGET.load(Ordering::Relaxed) {
        return Err(IrqError::NoVectors);
    }

    let irq = NEXT_IRQ.fetch_add(1, Ordering::Relaxed);
    handlers.insert(
        irq,
        Entry {
            name,
            handler: Arc::from(handler),
            enabled: false,
        },
    );

    Ok(IRQ { irq })
}

/// Deliver interrupt `irq`. Returns `true` if an enabled handler ran.
pub fn trigger(irq: u16) -> bool {
    let handler = {
        let mut node = MCSNode::new();
        let handlers = HANDLERS.lock(&mut node);
        match handlers.get(&irq) {
            Some(entry) if entry.enabled => Some(entry.handler.clone()),
            _ => None,
        }
    };

    if let Some(handler) = handler {
        ACTIVE_HANDLERS.fetch_add(1, Ordering::Acquire);
        handler(irq);
        ACTIVE_HANDLERS.fetch_sub(1, Ordering::Release);
        true
    } else {
        false
    }
}

/// Wait until no handler is executing. Callers mask their vectors first,
/// so no new activation can begin once this returns.
pub fn synchronize() {
    while ACTIVE_HANDLERS.load(Ordering::Acquire) > 0 {
        core::hint::spin_loop();
    }
}
