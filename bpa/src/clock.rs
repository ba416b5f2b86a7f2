use tern_bpv7::DtnTime;

/// Source of DTN time for the agent.
///
/// The default implementation reads the system clock; simulations and tests
/// drive a [`ManualClock`] instead.
pub trait Clock: Send {
    /// Current DTN time in milliseconds.
    fn now_ms(&self) -> u64;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        DtnTime::now().millisecs()
    }
}

/// An externally stepped clock.
#[derive(Debug, Default)]
pub struct ManualClock(std::sync::Arc<std::sync::atomic::AtomicU64>);

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self(std::sync::Arc::new(std::sync::atomic::AtomicU64::new(
            start_ms,
        )))
    }

    /// A handle that can advance the clock from outside the agent.
    pub fn handle(&self) -> ManualClock {
        ManualClock(self.0.clone())
    }

    pub fn set(&self, now_ms: u64) {
        self.0.store(now_ms, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.0
            .fetch_add(delta_ms, std::sync::atomic::Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}
