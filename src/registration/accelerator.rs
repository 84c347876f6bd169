use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

/// Counting semaphore over accelerator slots, shared by every run in the
/// process. A slot is held for the duration of one backend invocation.
#[derive(Debug)]
pub struct AcceleratorPool {
    slots: usize,
    release: Sender<()>,
    acquire: Receiver<()>,
}

impl AcceleratorPool {
    pub fn new(slots: usize) -> Arc<Self> {
        let slots = slots.max(1);
        let (release, acquire) = bounded(slots);
        for _ in 0..slots {
            let _ = release.try_send(());
        }
        Arc::new(Self {
            slots,
            release,
            acquire,
        })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.acquire.len()
    }

    /// Blocks until a slot is free.
    pub fn acquire(self: &Arc<Self>) -> AcceleratorPermit {
        // the pool owns a sender, so the channel can never disconnect here
        let _ = self.acquire.recv();
        AcceleratorPermit {
            pool: Arc::clone(self),
        }
    }

    /// Waits at most `timeout` for a slot.
    pub fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> Option<AcceleratorPermit> {
        self.acquire.recv_timeout(timeout).ok().map(|_| AcceleratorPermit {
            pool: Arc::clone(self),
        })
    }
}

/// Returns its slot to the pool on drop.
#[derive(Debug)]
pub struct AcceleratorPermit {
    pool: Arc<AcceleratorPool>,
}

impl Drop for AcceleratorPermit {
    fn drop(&mut self) {
        let _ = self.pool.release.try_send(());
    }
}
