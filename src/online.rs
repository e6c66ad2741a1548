use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Platform network-online signal, consulted before each chunk request.
///
/// The engine only reads the flag; reacting to connectivity restoration
/// (calling `start()` on errored tasks) is the caller's business.
pub trait NetworkMonitor: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Default monitor for environments without a connectivity source.
#[derive(Debug, Default)]
pub struct AlwaysOnline;

impl NetworkMonitor for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Flag-backed monitor, settable from outside the engine.
#[derive(Debug, Default)]
pub struct SharedOnlineFlag {
    online: AtomicBool,
}

impl SharedOnlineFlag {
    pub fn new(online: bool) -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(online),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }
}

impl NetworkMonitor for SharedOnlineFlag {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }
}
