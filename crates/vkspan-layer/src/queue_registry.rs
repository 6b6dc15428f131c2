//! Queue handle bookkeeping.
//!
//! Several intercepted calls receive only a VkQueue and must recover the
//! owning device. Queues are registered when the application retrieves them
//! and never re-parented; entries are dropped only when the device goes away.

use dashmap::DashMap;

use crate::error::{LayerError, LayerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRecord {
    pub device: u64,
    pub family: u32,
    pub index: u32,
}

#[derive(Default)]
pub struct QueueRegistry {
    queues: DashMap<u64, QueueRecord>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, queue: u64, device: u64, family: u32, index: u32) {
        self.queues.insert(
            queue,
            QueueRecord {
                device,
                family,
                index,
            },
        );
    }

    /// An unknown queue means the application used a handle the layer never
    /// observed being retrieved, which the API contract rules out. Fatal.
    pub fn lookup(&self, queue: u64) -> LayerResult<QueueRecord> {
        self.queues
            .get(&queue)
            .map(|r| *r)
            .ok_or(LayerError::UnknownHandle {
                kind: "queue",
                handle: queue,
            })
    }

    pub fn invalidate_device(&self, device: u64) {
        self.queues.retain(|_, record| record.device != device);
    }
}
