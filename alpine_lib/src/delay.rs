//! Delay and uptime helpers.
//!
//! Hosted builds (the `std` feature) use the process clock. Bare builds
//! count time with a platform-advanced tick so the driver's watchdog and
//! log timestamps stay monotonic without an architecture layer.

#[cfg(feature = "std")]
mod imp {
    use std::sync::OnceLock;
    use std::time::{Duration, Instant};

    static START: OnceLock<Instant> = OnceLock::new();

    pub fn uptime() -> u64 {
        START.get_or_init(Instant::now).elapsed().as_micros() as u64
    }

    pub fn wait_microsec(usec: u64) {
        std::thread::sleep(Duration::from_micros(usec));
    }
}

#[cfg(not(feature = "std"))]
mod imp {
    use core::sync::atomic::{AtomicU64, Ordering};

    static UPTIME_USEC: AtomicU64 = AtomicU64::new(0);

    // Rough spin calibration; platforms that care call `advance_uptime`
    // from their timer interrupt and replace busy-waits with real sleeps.
    const SPINS_PER_USEC: u64 = 64;

    pub fn uptime() -> u64 {
        UPTIME_USEC.load(Ordering::Relaxed)
    }

    pub fn wait_microsec(usec: u64) {
        for _ in 0..usec.saturating_mul(SPINS_PER_USEC) {
            core::hint::spin_loop();
        }
        UPTIME_USEC.fetch_add(usec, Ordering::Relaxed);
    }

    /// Advance the uptime counter. Called by the platform timer.
    pub fn advance_uptime(usec: u64) {
        UPTIME_USEC.fetch_add(usec, Ordering::Relaxed);
    }
}

#[cfg(not(feature = "std"))]
pub use imp::advance_uptime;

pub use imp::{uptime, wait_microsec};

pub fn wait_millisec(msec: u64) {
    assert!(msec < u64::MAX / 1000);
    wait_microsec(msec * 1000);
}
