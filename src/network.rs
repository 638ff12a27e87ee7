//! Inter-core message transport: one mutex-protected inbound queue per core
//! plus a global counter of in-flight messages. Any thread may enqueue; only
//! the owning core drains its queue. Queue order per sender is preserved,
//! timestamp order is restored by the receiving core's pending scheduler.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use log::trace;

use crate::message::Message;

pub struct Network<P> {
    queues: Vec<Mutex<Vec<Message<P>>>>,
    transient: AtomicI64,
}

impl<P> Network<P> {
    pub fn new(cores: usize) -> Self {
        let mut queues = Vec::with_capacity(cores);
        for _ in 0..cores {
            queues.push(Mutex::new(Vec::new()));
        }
        Self {
            queues,
            transient: AtomicI64::new(0),
        }
    }

    pub fn cores(&self) -> usize {
        self.queues.len()
    }

    /// Queue a message for its destination core.
    pub fn accept(&self, msg: Message<P>) {
        trace!("network: accept {:?}", msg);
        let queue = &self.queues[msg.dst.core];
        let mut guard = queue.lock().unwrap_or_else(|e| e.into_inner());
        guard.push(msg);
        self.transient.fetch_add(1, Ordering::SeqCst);
    }

    /// Atomically take everything queued for `core`.
    ///
    /// Panics when the transient counter would go negative: that means a
    /// message was drained that was never accepted.
    pub fn drain(&self, core: usize) -> Vec<Message<P>> {
        let batch = {
            let mut guard = self.queues[core].lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        if !batch.is_empty() {
            let left = self
                .transient
                .fetch_sub(batch.len() as i64, Ordering::SeqCst)
                - batch.len() as i64;
            assert!(
                left >= 0,
                "network transient count underflow: {} after draining {}",
                left,
                batch.len()
            );
            trace!("network: core {} drained {} messages", core, batch.len());
        }
        batch
    }

    /// Best-effort check for queued messages, used by termination and GVT.
    pub fn pending(&self, core: usize) -> bool {
        let guard = self.queues[core].lock().unwrap_or_else(|e| e.into_inner());
        !guard.is_empty()
    }

    /// True when no message is in flight anywhere.
    pub fn empty(&self) -> bool {
        self.transient.load(Ordering::SeqCst) == 0
    }

    pub fn transient_count(&self) -> i64 {
        self.transient.load(Ordering::SeqCst)
    }
}
