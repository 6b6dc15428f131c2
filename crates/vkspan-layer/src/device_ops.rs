//! The seam between the timing core and the driver.
//!
//! Everything the core needs from the device goes through [`DeviceBackend`]:
//! query pool lifecycle, timestamp command injection, non-blocking readback
//! and fence polling. The production implementation calls through the
//! dispatch table; tests substitute an in-memory fake.

use std::sync::Arc;

use ash::vk;

use crate::dispatch::DeviceDispatch;

pub trait DeviceBackend: Send + Sync {
    /// Create a timestamp query pool with `query_count` slots.
    fn create_query_pool(&self, query_count: u32) -> Result<vk::QueryPool, vk::Result>;

    fn destroy_query_pool(&self, pool: vk::QueryPool);

    /// Host-side reset of a query range. Must be callable without the device
    /// being idle (VK_EXT_host_query_reset semantics).
    fn reset_queries(&self, pool: vk::QueryPool, first_query: u32, query_count: u32);

    /// Record a write-timestamp command into `command_buffer`. Only valid
    /// while the buffer is in the recording state.
    fn write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    );

    /// Single non-blocking poll of one query. `Ok(None)` means the GPU has
    /// not produced the value yet.
    fn query_result(&self, pool: vk::QueryPool, query: u32) -> Result<Option<u64>, vk::Result>;

    /// Non-blocking fence status poll.
    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool, vk::Result>;

    /// Nanoseconds per timestamp tick, from the device limits.
    fn timestamp_period(&self) -> f32;

    /// Number of meaningful bits in a timestamp value.
    fn timestamp_valid_bits(&self) -> u32;

    /// Upper bound on concurrently live timestamp slots for this device.
    /// Zero disables instrumentation entirely.
    fn max_timestamp_queries(&self) -> u32;
}

/// Production backend: forwards every operation to the next layer through
/// the device dispatch table.
pub struct DriverBackend {
    device: vk::Device,
    dispatch: Arc<DeviceDispatch>,
    timestamp_period: f32,
    timestamp_valid_bits: u32,
    max_queries: u32,
}

impl DriverBackend {
    pub fn new(
        device: vk::Device,
        dispatch: Arc<DeviceDispatch>,
        timestamp_period: f32,
        timestamp_valid_bits: u32,
        max_queries: u32,
    ) -> Self {
        Self {
            device,
            dispatch,
            timestamp_period,
            timestamp_valid_bits,
            max_queries,
        }
    }
}

impl DeviceBackend for DriverBackend {
    fn create_query_pool(&self, query_count: u32) -> Result<vk::QueryPool, vk::Result> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(query_count);
        let mut pool = vk::QueryPool::null();
        let result = unsafe {
            (self.dispatch.create_query_pool)(
                self.device,
                &create_info,
                std::ptr::null(),
                &mut pool,
            )
        };
        if result == vk::Result::SUCCESS {
            Ok(pool)
        } else {
            Err(result)
        }
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { (self.dispatch.destroy_query_pool)(self.device, pool, std::ptr::null()) };
    }

    fn reset_queries(&self, pool: vk::QueryPool, first_query: u32, query_count: u32) {
        if let Some(reset) = self.dispatch.reset_query_pool {
            unsafe { reset(self.device, pool, first_query, query_count) };
        }
    }

    fn write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    ) {
        unsafe { (self.dispatch.cmd_write_timestamp)(command_buffer, stage, pool, query) };
    }

    fn query_result(&self, pool: vk::QueryPool, query: u32) -> Result<Option<u64>, vk::Result> {
        // value + availability, no WAIT bit: a single poll, never a stall.
        let mut data = [0u64; 2];
        let result = unsafe {
            (self.dispatch.get_query_pool_results)(
                self.device,
                pool,
                query,
                1,
                std::mem::size_of_val(&data),
                data.as_mut_ptr().cast(),
                (std::mem::size_of::<u64>() * 2) as vk::DeviceSize,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WITH_AVAILABILITY,
            )
        };
        match result {
            vk::Result::SUCCESS if data[1] != 0 => Ok(Some(data[0])),
            vk::Result::SUCCESS | vk::Result::NOT_READY => Ok(None),
            err => Err(err),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool, vk::Result> {
        let result = unsafe { (self.dispatch.get_fence_status)(self.device, fence) };
        match result {
            vk::Result::SUCCESS => Ok(true),
            vk::Result::NOT_READY => Ok(false),
            err => Err(err),
        }
    }

    fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }

    fn timestamp_valid_bits(&self) -> u32 {
        self.timestamp_valid_bits
    }

    fn max_timestamp_queries(&self) -> u32 {
        // Host query reset is required for slot recycling; without it the
        // pool must not hand out anything.
        if self.dispatch.reset_query_pool.is_none() {
            0
        } else {
            self.max_queries
        }
    }
}
