//! End-to-end scenarios over the per-device timing core, driven through a
//! fake GPU backend: recording, submission, retirement, and the degraded
//! paths (exhaustion, early free, teardown).

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;

use vkspan_events::{GapReason, TraceEvent};
use vkspan_layer::device::DeviceState;
use vkspan_layer::device_ops::DeviceBackend;

#[derive(Default)]
struct GpuState {
    next_pool: u64,
    /// Timestamp writes recorded into command buffers, in recording order.
    written: Vec<(u64, u32)>,
    /// Values produced by completed GPU work.
    results: HashMap<(u64, u32), u64>,
    signaled_fences: Vec<u64>,
    clock: u64,
}

/// A GPU that completes work only when the test says so.
struct FakeGpu {
    state: Mutex<GpuState>,
    max: u32,
}

impl FakeGpu {
    fn new(max: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GpuState::default()),
            max,
        })
    }

    /// Execute everything recorded so far: each written slot gets a value
    /// 10ns after the previous one, preserving recording order.
    fn complete_all(&self) {
        let state = &mut *self.state.lock();
        for (pool, query) in state.written.drain(..) {
            state.clock += 10;
            let value = state.clock;
            state.results.insert((pool, query), value);
        }
    }

    fn signal_fence(&self, fence: u64) {
        self.state.lock().signaled_fences.push(fence);
    }
}

impl DeviceBackend for FakeGpu {
    fn create_query_pool(&self, _query_count: u32) -> Result<vk::QueryPool, vk::Result> {
        let mut state = self.state.lock();
        state.next_pool += 1;
        Ok(vk::QueryPool::from_raw(state.next_pool))
    }

    fn destroy_query_pool(&self, _pool: vk::QueryPool) {}

    fn reset_queries(&self, pool: vk::QueryPool, first_query: u32, query_count: u32) {
        let mut state = self.state.lock();
        for q in first_query..first_query + query_count {
            state.results.remove(&(pool.as_raw(), q));
        }
    }

    fn write_timestamp(
        &self,
        _command_buffer: vk::CommandBuffer,
        _stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    ) {
        self.state.lock().written.push((pool.as_raw(), query));
    }

    fn query_result(&self, pool: vk::QueryPool, query: u32) -> Result<Option<u64>, vk::Result> {
        Ok(self.state.lock().results.get(&(pool.as_raw(), query)).copied())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool, vk::Result> {
        Ok(self.state.lock().signaled_fences.contains(&fence.as_raw()))
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

const POOL: u64 = 0x100;
const QUEUE: u64 = 0x20;

fn device_with(gpu: Arc<FakeGpu>, initial_slots: u32) -> (DeviceState, Receiver<TraceEvent>) {
    let (sender, receiver) = unbounded();
    (DeviceState::new(0x1, gpu, sender, initial_slots), receiver)
}

/// Record begin / marker "Frame" / marker end / end into `cb`.
fn record_frame(device: &DeviceState, cb: u64) {
    device.on_allocate_command_buffers(POOL, &[cb]);
    device.on_begin_command_buffer(cb).expect("begin");
    device.on_marker_begin(cb, "Frame").expect("marker begin");
    device.on_marker_end(cb).expect("marker end");
    device.on_end_command_buffer(cb).expect("end");
}

fn drain_events(receiver: &Receiver<TraceEvent>) -> Vec<TraceEvent> {
    receiver.try_iter().collect()
}

#[test]
fn frame_marker_retires_with_ordered_timestamps() {
    let gpu = FakeGpu::new(64);
    let (device, events) = device_with(gpu.clone(), 8);

    record_frame(&device, 0x10);
    device
        .on_queue_submit(QUEUE, &[0x10], Some(vk::Fence::from_raw(0x30)), 5)
        .expect("submit");

    // Nothing retires while the GPU is still working.
    assert_eq!(device.poll_retirement(), 0);
    assert_eq!(device.pending_submissions(), 1);
    assert!(drain_events(&events).is_empty());

    gpu.complete_all();
    gpu.signal_fence(0x30);
    assert_eq!(device.poll_retirement(), 1);

    let emitted = drain_events(&events);
    assert_eq!(emitted.len(), 2);
    let TraceEvent::GpuSpan {
        label: marker_label,
        gpu_begin_ns: marker_begin,
        gpu_end_ns: marker_end,
        cpu_submit_ns,
        ..
    } = &emitted[0]
    else {
        panic!("expected a span, got {:?}", emitted[0]);
    };
    assert_eq!(marker_label.as_deref(), Some("Frame"));
    assert!(marker_begin < marker_end);
    assert_eq!(*cpu_submit_ns, 5);
    assert!(cpu_submit_ns <= marker_begin);

    // The whole-buffer span encloses the marker span.
    let TraceEvent::GpuSpan {
        label: None,
        gpu_begin_ns,
        gpu_end_ns,
        ..
    } = &emitted[1]
    else {
        panic!("expected the whole-buffer span, got {:?}", emitted[1]);
    };
    assert!(gpu_begin_ns < marker_begin);
    assert!(marker_end < gpu_end_ns);
}

#[test]
fn fenceless_submission_retires_on_query_availability() {
    let gpu = FakeGpu::new(64);
    let (device, events) = device_with(gpu.clone(), 8);

    record_frame(&device, 0x10);
    device
        .on_queue_submit(QUEUE, &[0x10], None, 2000)
        .expect("submit");
    assert_eq!(device.poll_retirement(), 0);

    gpu.complete_all();
    assert_eq!(device.poll_retirement(), 1);
    assert_eq!(drain_events(&events).len(), 2);
}

#[test]
fn slot_exhaustion_degrades_to_gaps() {
    let gpu = FakeGpu::new(2);
    let (device, events) = device_with(gpu.clone(), 2);

    // The first buffer takes the whole budget.
    device.on_allocate_command_buffers(POOL, &[0x10, 0x11]);
    device.on_begin_command_buffer(0x10).expect("begin");
    device.on_end_command_buffer(0x10).expect("end");
    assert_eq!(device.slots_in_flight(), 2);

    // The second records uninstrumented but records and submits fine.
    device.on_begin_command_buffer(0x11).expect("begin");
    device.on_end_command_buffer(0x11).expect("end");
    device
        .on_queue_submit(QUEUE, &[0x11], None, 3000)
        .expect("submit");

    // A span with no slots needs no GPU progress to resolve.
    gpu.complete_all();
    device.poll_retirement();
    let emitted = drain_events(&events);
    assert_eq!(emitted.len(), 1);
    assert!(matches!(
        emitted[0],
        TraceEvent::Gap {
            command_buffer: 0x11,
            reason: GapReason::SlotsExhausted,
            ..
        }
    ));
}

#[test]
fn free_while_pending_defers_slot_release_until_safe() {
    let gpu = FakeGpu::new(64);
    let (device, events) = device_with(gpu.clone(), 8);

    record_frame(&device, 0x10);
    device
        .on_queue_submit(QUEUE, &[0x10], Some(vk::Fence::from_raw(0x30)), 4000)
        .expect("submit");

    let freed = device.on_free_command_buffers(&[0x10]);
    assert_eq!(freed, vec![0x10]);
    let in_flight = device.slots_in_flight();
    assert!(in_flight > 0, "orphaned slots must stay parked");

    // The GPU may still write those slots; nothing retires yet.
    assert_eq!(device.poll_retirement(), 0);
    assert_eq!(device.slots_in_flight(), in_flight);

    gpu.signal_fence(0x30);
    assert_eq!(device.poll_retirement(), 1);
    assert_eq!(device.slots_in_flight(), 0);

    let emitted = drain_events(&events);
    assert!(!emitted.is_empty());
    assert!(emitted.iter().all(|event| matches!(
        event,
        TraceEvent::Gap {
            reason: GapReason::SubmissionLost,
            ..
        }
    )));
}

#[test]
fn pool_reset_reclaims_slots_from_all_buffers() {
    let gpu = FakeGpu::new(8);
    let (device, _events) = device_with(gpu.clone(), 4);

    for cb in [0x10u64, 0x11] {
        device.on_allocate_command_buffers(POOL, &[cb]);
        device.on_begin_command_buffer(cb).expect("begin");
        device.on_end_command_buffer(cb).expect("end");
    }
    device
        .on_queue_submit(QUEUE, &[0x10, 0x11], None, 5000)
        .expect("submit");
    gpu.complete_all();
    assert_eq!(device.poll_retirement(), 1);
    assert_eq!(device.slots_in_flight(), 4);

    device.on_reset_pool(POOL);
    assert_eq!(device.slots_in_flight(), 0);

    // Reclaimed slots are immediately reusable.
    device.on_begin_command_buffer(0x10).expect("re-begin");
    device.on_end_command_buffer(0x10).expect("re-end");
    assert_eq!(device.slots_in_flight(), 2);
}

#[test]
fn reusable_buffer_yields_a_span_per_submission() {
    let gpu = FakeGpu::new(64);
    let (device, events) = device_with(gpu.clone(), 8);

    device.on_allocate_command_buffers(POOL, &[0x10]);
    device.on_begin_command_buffer(0x10).expect("begin");
    device.on_end_command_buffer(0x10).expect("end");

    gpu.complete_all();
    device
        .on_queue_submit(QUEUE, &[0x10], None, 6000)
        .expect("first submit");
    device
        .on_queue_submit(QUEUE, &[0x10], None, 6100)
        .expect("second submit");
    device.poll_retirement();
    assert_eq!(device.pending_submissions(), 0);

    let spans: Vec<_> = drain_events(&events)
        .into_iter()
        .filter(|e| matches!(e, TraceEvent::GpuSpan { .. }))
        .collect();
    assert_eq!(spans.len(), 2);
}

#[test]
fn rebegin_reclaims_stale_slots() {
    let gpu = FakeGpu::new(8);
    let (device, _events) = device_with(gpu, 4);

    device.on_allocate_command_buffers(POOL, &[0x10]);
    device.on_begin_command_buffer(0x10).expect("begin");
    device.on_end_command_buffer(0x10).expect("end");
    assert_eq!(device.slots_in_flight(), 2);

    // Re-begin of an executable, unsubmitted buffer frees its old slots and
    // takes one for the new opening timestamp.
    device.on_begin_command_buffer(0x10).expect("re-begin");
    assert_eq!(device.slots_in_flight(), 1);
}

#[test]
fn end_without_begin_releases_its_slot() {
    let gpu = FakeGpu::new(8);
    let (device, _events) = device_with(gpu, 4);

    device.on_allocate_command_buffers(POOL, &[0x10]);
    for _ in 0..3 {
        device
            .on_end_command_buffer(0x10)
            .expect_err("end without begin must be rejected");
    }
    assert_eq!(device.slots_in_flight(), 0, "slot leaked on the misuse path");

    // Same misuse shape on the marker path.
    device
        .on_marker_begin(0x10, "Frame")
        .expect_err("marker outside recording must be rejected");
    assert_eq!(device.slots_in_flight(), 0);

    // The budget is fully intact afterwards.
    device.on_begin_command_buffer(0x10).expect("begin");
    device.on_end_command_buffer(0x10).expect("end");
    assert_eq!(device.slots_in_flight(), 2);
}

#[test]
fn rejected_submit_leaves_no_pending_marks() {
    let gpu = FakeGpu::new(16);
    let (device, _events) = device_with(gpu, 8);

    device.on_allocate_command_buffers(POOL, &[0x10, 0x11]);
    device.on_begin_command_buffer(0x10).expect("begin");
    device.on_end_command_buffer(0x10).expect("end");
    // The second buffer is still recording when the submit arrives.
    device.on_begin_command_buffer(0x11).expect("begin");
    device
        .on_queue_submit(QUEUE, &[0x10, 0x11], None, 100)
        .expect_err("a non-executable buffer rejects the whole snapshot");
    assert_eq!(device.pending_submissions(), 0);

    // The first buffer carries no stale pending mark: freeing it is not
    // freed-while-pending and its slots come straight back.
    let before = device.slots_in_flight();
    let freed = device.on_free_command_buffers(&[0x10]);
    assert!(freed.is_empty());
    assert_eq!(device.slots_in_flight(), before - 2);
}

#[test]
fn unbalanced_marker_end_is_reported_and_leaks_nothing() {
    let gpu = FakeGpu::new(8);
    let (device, _events) = device_with(gpu, 4);

    device.on_allocate_command_buffers(POOL, &[0x10]);
    device.on_begin_command_buffer(0x10).expect("begin");
    let before = device.slots_in_flight();
    device
        .on_marker_end(0x10)
        .expect_err("unbalanced end must be rejected");
    assert_eq!(device.slots_in_flight(), before);
    device.on_end_command_buffer(0x10).expect("end");
}

#[test]
fn present_emits_a_frame_boundary() {
    let gpu = FakeGpu::new(8);
    let (device, events) = device_with(gpu, 4);

    device.on_queue_present(QUEUE, 7000);
    let emitted = drain_events(&events);
    assert_eq!(
        emitted,
        vec![TraceEvent::FrameBoundary {
            queue: QUEUE,
            cpu_ns: 7000
        }]
    );
}

#[test]
fn drain_reports_unfinished_submissions_as_lost() {
    let gpu = FakeGpu::new(64);
    let (device, events) = device_with(gpu, 8);

    record_frame(&device, 0x10);
    device
        .on_queue_submit(QUEUE, &[0x10], Some(vk::Fence::from_raw(0x30)), 8000)
        .expect("submit");

    device.drain();
    assert_eq!(device.pending_submissions(), 0);
    let emitted = drain_events(&events);
    assert_eq!(emitted.len(), 2);
    assert!(emitted.iter().all(|event| matches!(
        event,
        TraceEvent::Gap {
            reason: GapReason::SubmissionLost,
            ..
        }
    )));
}
