//! Query slot management.
//!
//! Timestamp query slots are a scarce device resource with a strict
//! reset-before-reuse rule. This module keeps a per-device recyclable pool:
//! slots are carved out of `VkQueryPool` blocks allocated with geometric
//! growth, handed out from a free list, and host-reset eagerly when they are
//! released so an acquired slot is always in the reset state.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, warn};

use crate::device_ops::DeviceBackend;

/// One timestamp slot: a query index within one of the device's pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub pool: vk::QueryPool,
    pub query: u32,
}

/// Outcome of a single non-blocking readback attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotReadback {
    Pending,
    /// Timestamp in nanoseconds on the device timeline.
    Ready(u64),
}

pub struct QuerySlotPool {
    backend: Arc<dyn DeviceBackend>,
    blocks: Vec<vk::QueryPool>,
    free: Vec<SlotId>,
    total: u32,
    next_block_size: u32,
    exhausted_reported: bool,
}

impl QuerySlotPool {
    pub fn new(backend: Arc<dyn DeviceBackend>, initial_block_size: u32) -> Self {
        Self {
            backend,
            blocks: Vec::new(),
            free: Vec::new(),
            total: 0,
            next_block_size: initial_block_size.max(1),
            exhausted_reported: false,
        }
    }

    /// Hand out a reset slot, growing the pool if the free list is empty.
    /// Returns None once the device budget is exhausted; the caller records
    /// the region uninstrumented.
    pub fn acquire(&mut self) -> Option<SlotId> {
        if self.free.is_empty() && !self.grow() {
            if !self.exhausted_reported {
                warn!(
                    total = self.total,
                    "timestamp query budget exhausted, tracing gaps will follow"
                );
                self.exhausted_reported = true;
            }
            return None;
        }
        self.free.pop()
    }

    /// Return a slot to the free list. The slot is host-reset here, not at
    /// acquire time, so handing it out later needs no device synchronization.
    pub fn release(&mut self, slot: SlotId) {
        self.backend.reset_queries(slot.pool, slot.query, 1);
        self.free.push(slot);
    }

    pub fn release_all<I: IntoIterator<Item = SlotId>>(&mut self, slots: I) {
        for slot in slots {
            self.release(slot);
        }
    }

    /// Record the write-timestamp command for `slot` into a recording buffer.
    pub fn write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        slot: SlotId,
        stage: vk::PipelineStageFlags,
    ) {
        self.backend
            .write_timestamp(command_buffer, stage, slot.pool, slot.query);
    }

    /// Single non-blocking poll of a slot, converting a ready value to
    /// nanoseconds via the device timestamp period and valid-bits mask.
    pub fn read(&self, slot: SlotId) -> Result<SlotReadback, vk::Result> {
        match self.backend.query_result(slot.pool, slot.query)? {
            Some(ticks) => {
                let valid_bits = self.backend.timestamp_valid_bits();
                let masked = if valid_bits >= 64 {
                    ticks
                } else {
                    ticks & ((1u64 << valid_bits) - 1)
                };
                let ns = (masked as f64 * self.backend.timestamp_period() as f64) as u64;
                Ok(SlotReadback::Ready(ns))
            }
            None => Ok(SlotReadback::Pending),
        }
    }

    pub fn slots_in_flight(&self) -> u32 {
        self.total - self.free.len() as u32
    }

    fn grow(&mut self) -> bool {
        let budget = self.backend.max_timestamp_queries();
        if self.total >= budget {
            return false;
        }
        let size = self.next_block_size.min(budget - self.total);
        let pool = match self.backend.create_query_pool(size) {
            Ok(pool) => pool,
            Err(err) => {
                warn!(?err, size, "query pool allocation failed");
                return false;
            }
        };
        // A fresh pool's queries start in an undefined state; reset the whole
        // block once before any slot from it is handed out.
        self.backend.reset_queries(pool, 0, size);
        for query in 0..size {
            self.free.push(SlotId { pool, query });
        }
        self.blocks.push(pool);
        self.total += size;
        self.next_block_size = self.next_block_size.saturating_mul(2);
        debug!(size, total = self.total, "grew timestamp query pool");
        true
    }
}

impl Drop for QuerySlotPool {
    fn drop(&mut self) {
        for &pool in &self.blocks {
            self.backend.destroy_query_pool(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeState {
        next_pool: u64,
        reset: HashSet<(u64, u32)>,
        created: Vec<u32>,
        destroyed: Vec<u64>,
    }

    struct Fake {
        state: Mutex<FakeState>,
        max: u32,
    }

    impl Fake {
        fn new(max: u32) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(FakeState::default()),
                max,
            })
        }
    }

    impl DeviceBackend for Fake {
        fn create_query_pool(&self, query_count: u32) -> Result<vk::QueryPool, vk::Result> {
            let mut state = self.state.lock();
            state.next_pool += 1;
            state.created.push(query_count);
            Ok(vk::QueryPool::from_raw(state.next_pool))
        }

        fn destroy_query_pool(&self, pool: vk::QueryPool) {
            self.state.lock().destroyed.push(pool.as_raw());
        }

        fn reset_queries(&self, pool: vk::QueryPool, first_query: u32, query_count: u32) {
            let mut state = self.state.lock();
            for q in first_query..first_query + query_count {
                state.reset.insert((pool.as_raw(), q));
            }
        }

        fn write_timestamp(
            &self,
            _command_buffer: vk::CommandBuffer,
            _stage: vk::PipelineStageFlags,
            pool: vk::QueryPool,
            query: u32,
        ) {
            // Writing consumes the reset state.
            assert!(
                self.state.lock().reset.remove(&(pool.as_raw(), query)),
                "timestamp written into an unreset slot"
            );
        }

        fn query_result(&self, _pool: vk::QueryPool, _query: u32) -> Result<Option<u64>, vk::Result> {
            Ok(None)
        }

        fn fence_signaled(&self, _fence: vk::Fence) -> Result<bool, vk::Result> {
            Ok(false)
        }

        fn timestamp_period(&self) -> f32 {
            1.0
        }

        fn timestamp_valid_bits(&self) -> u32 {
            64
        }

        fn max_timestamp_queries(&self) -> u32 {
            self.max
        }
    }

    use ash::vk::Handle;

    #[test]
    fn grows_geometrically_up_to_budget() {
        let fake = Fake::new(14);
        let mut pool = QuerySlotPool::new(fake.clone(), 2);
        let mut held = Vec::new();
        while let Some(slot) = pool.acquire() {
            held.push(slot);
        }
        assert_eq!(held.len(), 14);
        // 2, 4, 8 capped to the remaining budget.
        assert_eq!(fake.state.lock().created, vec![2, 4, 8]);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn released_slots_are_reset_before_reuse() {
        let fake = Fake::new(8);
        let mut pool = QuerySlotPool::new(fake.clone(), 4);
        let slots: Vec<_> = (0..4).map(|_| pool.acquire().expect("slot")).collect();
        for &slot in &slots {
            // Consume the reset state as a recording would.
            pool.write_timestamp(
                vk::CommandBuffer::from_raw(1),
                slot,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            );
        }
        pool.release_all(slots.iter().copied());
        assert_eq!(pool.slots_in_flight(), 0);
        // Re-acquiring and writing again must not trip the unreset assertion.
        for _ in 0..4 {
            let slot = pool.acquire().expect("slot");
            pool.write_timestamp(
                vk::CommandBuffer::from_raw(1),
                slot,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            );
        }
    }

    #[test]
    fn never_hands_out_a_slot_twice() {
        let fake = Fake::new(8);
        let mut pool = QuerySlotPool::new(fake, 8);
        let mut seen = HashSet::new();
        while let Some(slot) = pool.acquire() {
            assert!(seen.insert(slot), "slot handed out twice: {slot:?}");
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn drop_destroys_all_blocks() {
        let fake = Fake::new(8);
        {
            let mut pool = QuerySlotPool::new(fake.clone(), 2);
            let _a = pool.acquire();
            let _b = pool.acquire();
            let _c = pool.acquire();
        }
        assert_eq!(fake.state.lock().destroyed.len(), 2);
    }
}
