//! Per-device orchestration.
//!
//! One [`DeviceState`] exists per logical device. It composes the command
//! buffer tracker, the query slot pool and the submission tracker behind a
//! single per-device lock: two queues of the same device may submit from
//! different threads and both need slots from the same pool. All driver
//! access goes through the [`DeviceBackend`] seam, so the whole object runs
//! against a fake in tests. No method here blocks on GPU completion.

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use vkspan_events::TraceEvent;

use crate::command_tracker::{CommandBufferTracker, SliceEvent};
use crate::device_ops::DeviceBackend;
use crate::error::{LayerError, LayerResult};
use crate::query_slots::{QuerySlotPool, SlotId};
use crate::submission::{SpanRef, SubmissionTracker};

struct DeviceInner {
    tracker: CommandBufferTracker,
    slots: QuerySlotPool,
    submissions: SubmissionTracker,
}

pub struct DeviceState {
    device: u64,
    backend: Arc<dyn DeviceBackend>,
    inner: Mutex<DeviceInner>,
    events: Sender<TraceEvent>,
}

impl DeviceState {
    pub fn new(
        device: u64,
        backend: Arc<dyn DeviceBackend>,
        events: Sender<TraceEvent>,
        initial_slots: u32,
    ) -> Self {
        Self {
            device,
            backend: backend.clone(),
            inner: Mutex::new(DeviceInner {
                tracker: CommandBufferTracker::new(),
                slots: QuerySlotPool::new(backend, initial_slots),
                submissions: SubmissionTracker::new(),
            }),
            events,
        }
    }

    pub fn raw(&self) -> u64 {
        self.device
    }

    pub fn on_allocate_command_buffers(&self, pool: u64, buffers: &[u64]) {
        self.inner.lock().tracker.on_allocate(pool, buffers);
    }

    /// Post-call of begin-recording: clear stale state and open the
    /// whole-buffer span with a top-of-pipe timestamp.
    pub fn on_begin_command_buffer(&self, buffer: u64) -> LayerResult<()> {
        let inner = &mut *self.inner.lock();
        let stale = inner.tracker.begin_recording(buffer)?;
        Self::reclaim(inner, buffer, stale);
        let slot = inner.slots.acquire();
        if let Some(slot) = slot {
            inner.slots.write_timestamp(
                vk::CommandBuffer::from_raw(buffer),
                slot,
                vk::PipelineStageFlags::TOP_OF_PIPE,
            );
        }
        inner.tracker.push_slice(buffer, SliceEvent::QueryBegin { slot })
    }

    /// Pre-call of end-recording: close the whole-buffer span while the
    /// buffer still accepts commands, then freeze the sequence.
    pub fn on_end_command_buffer(&self, buffer: u64) -> LayerResult<()> {
        let inner = &mut *self.inner.lock();
        let slot = inner.slots.acquire();
        if let Some(slot) = slot {
            inner.slots.write_timestamp(
                vk::CommandBuffer::from_raw(buffer),
                slot,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            );
        }
        if let Err(err) = inner.tracker.push_slice(buffer, SliceEvent::QueryEnd { slot }) {
            // The buffer was never in recording; nothing references the slot.
            if let Some(slot) = slot {
                inner.slots.release(slot);
            }
            return Err(err);
        }
        inner.tracker.end_recording(buffer)
    }

    pub fn on_marker_begin(&self, buffer: u64, label: &str) -> LayerResult<()> {
        let inner = &mut *self.inner.lock();
        let slot = inner.slots.acquire();
        if let Some(slot) = slot {
            inner.slots.write_timestamp(
                vk::CommandBuffer::from_raw(buffer),
                slot,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            );
        }
        let result = inner.tracker.push_slice(
            buffer,
            SliceEvent::MarkerBegin {
                label: label.to_string(),
                slot,
            },
        );
        if result.is_err() {
            if let Some(slot) = slot {
                inner.slots.release(slot);
            }
        }
        result
    }

    /// Pre-call of marker end. An unbalanced end is caller misuse: reported,
    /// recorded as nothing, and the slot is never taken.
    pub fn on_marker_end(&self, buffer: u64) -> LayerResult<()> {
        let inner = &mut *self.inner.lock();
        let slot = inner.slots.acquire();
        if let Some(slot) = slot {
            inner.slots.write_timestamp(
                vk::CommandBuffer::from_raw(buffer),
                slot,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            );
        }
        let result = inner.tracker.push_slice(buffer, SliceEvent::MarkerEnd { slot });
        if result.is_err() {
            // The timestamp command is already recorded, but nothing will
            // reference the slot; take it back.
            if let Some(slot) = slot {
                inner.slots.release(slot);
            }
        }
        result
    }

    pub fn on_reset_command_buffer(&self, buffer: u64) -> LayerResult<()> {
        let inner = &mut *self.inner.lock();
        let outcome = inner.tracker.reset_buffer(buffer)?;
        Self::reclaim(inner, buffer, outcome.slots);
        Ok(())
    }

    pub fn on_reset_pool(&self, pool: u64) {
        let inner = &mut *self.inner.lock();
        for outcome in inner.tracker.reset_pool(pool) {
            Self::reclaim(inner, outcome.command_buffer, outcome.slots);
        }
    }

    /// Free command buffers. A buffer freed while a submission is still in
    /// flight is a use-after-submit bug in the application: reported loudly,
    /// degraded to the lost path, never fatal.
    pub fn on_free_command_buffers(&self, buffers: &[u64]) -> Vec<u64> {
        let inner = &mut *self.inner.lock();
        let mut freed_while_pending = Vec::new();
        for outcome in inner.tracker.free(buffers) {
            if outcome.was_pending {
                error!(
                    "{}",
                    LayerError::FreedWhilePending(outcome.command_buffer)
                );
                freed_while_pending.push(outcome.command_buffer);
            }
            Self::reclaim(inner, outcome.command_buffer, outcome.slots);
        }
        freed_while_pending
    }

    /// Post-call of queue-submit: snapshot the span set of every submitted
    /// buffer against the CPU timestamp taken pre-call, then run one
    /// retirement pass for earlier submissions.
    pub fn on_queue_submit(
        &self,
        queue: u64,
        command_buffers: &[u64],
        fence: Option<vk::Fence>,
        cpu_submit_ns: u64,
    ) -> LayerResult<()> {
        let inner = &mut *self.inner.lock();
        let mut spans = Vec::new();
        for &buffer in command_buffers {
            for snapshot in inner.tracker.snapshot_spans(buffer)? {
                spans.push(SpanRef {
                    command_buffer: buffer,
                    snapshot,
                });
            }
        }
        // Marked only after every buffer snapshotted: a rejection above must
        // leave no buffer counted against a submission that never recorded.
        for &buffer in command_buffers {
            inner.tracker.mark_submitted(buffer)?;
        }
        inner.submissions.record(
            queue,
            fence,
            cpu_submit_ns,
            command_buffers.to_vec(),
            spans,
        );
        inner.submissions.poll(
            self.backend.as_ref(),
            &mut inner.slots,
            &mut inner.tracker,
            &self.events,
        );
        Ok(())
    }

    /// Presentation: no queries of its own, just a frame boundary tied to
    /// the queue, plus a retirement pass.
    pub fn on_queue_present(&self, queue: u64, cpu_ns: u64) {
        if self
            .events
            .send(TraceEvent::FrameBoundary { queue, cpu_ns })
            .is_err()
        {
            debug!("trace event consumer is gone, dropping frame boundary");
        }
        self.poll_retirement();
    }

    /// One non-blocking retirement pass; callable from any sync point.
    pub fn poll_retirement(&self) -> usize {
        let inner = &mut *self.inner.lock();
        inner.submissions.poll(
            self.backend.as_ref(),
            &mut inner.slots,
            &mut inner.tracker,
            &self.events,
        )
    }

    /// Device teardown: retire what can be retired, report the rest as lost.
    pub fn drain(&self) {
        let inner = &mut *self.inner.lock();
        inner.submissions.drain(
            self.backend.as_ref(),
            &mut inner.slots,
            &mut inner.tracker,
            &self.events,
        );
    }

    pub fn slots_in_flight(&self) -> u32 {
        self.inner.lock().slots.slots_in_flight()
    }

    pub fn pending_submissions(&self) -> usize {
        self.inner.lock().submissions.pending_count()
    }

    pub fn buffer_state(&self, buffer: u64) -> Option<crate::command_tracker::BufferState> {
        self.inner.lock().tracker.state_of(buffer)
    }

    /// Route reclaimed slots: straight back to the free list, or parked with
    /// a still-pending submission that references the buffer.
    fn reclaim(inner: &mut DeviceInner, buffer: u64, slots: Vec<SlotId>) {
        if slots.is_empty() {
            // Still tell the submission tracker: a slot-less buffer reset
            // must orphan its pending submissions too.
            if inner.submissions.orphan_buffer(buffer, Vec::new()).is_none() {
                warn!(
                    buffer = format_args!("{buffer:#x}"),
                    "buffer reset or freed while its submission is pending"
                );
            }
            return;
        }
        match inner.submissions.orphan_buffer(buffer, slots) {
            Some(free_now) => inner.slots.release_all(free_now),
            None => warn!(
                buffer = format_args!("{buffer:#x}"),
                "buffer reset or freed while its submission is pending, deferring slot release"
            ),
        }
    }
}
