use std::sync::Arc;

use ahash::AHashSet;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use rand::{thread_rng, Rng};

/// Source of process-unique, nonzero SSRC identifiers.
///
/// The sender borrows two identifiers (media and RTX) at construction
/// and returns them on drop. Tests substitute a deterministic
/// implementation; everything else shares [`global`].
pub trait SsrcAllocator: Send + Sync {
    /// Draw an unused nonzero identifier and mark it in use.
    fn allocate(&self) -> u32;

    /// Mark an externally chosen identifier in use.
    fn register(&self, ssrc: u32);

    /// Return an identifier to the pool.
    fn release(&self, ssrc: u32);
}

/// The default registry: a process-wide set of identifiers in use.
#[derive(Default)]
pub struct SsrcRegistry {
    in_use: Mutex<AHashSet<u32>>,
}

impl SsrcAllocator for SsrcRegistry {
    fn allocate(&self) -> u32 {
        let mut rng = thread_rng();
        let mut in_use = self.in_use.lock();
        loop {
            let ssrc = rng.gen::<u32>();
            if ssrc != 0 && in_use.insert(ssrc) {
                return ssrc;
            }
        }
    }

    fn register(&self, ssrc: u32) {
        self.in_use.lock().insert(ssrc);
    }

    fn release(&self, ssrc: u32) {
        self.in_use.lock().remove(&ssrc);
    }
}

lazy_static! {
    static ref REGISTRY: Arc<SsrcRegistry> = Arc::new(SsrcRegistry::default());
}

/// Handle to the process-wide registry.
pub fn global() -> Arc<SsrcRegistry> {
    REGISTRY.clone()
}
