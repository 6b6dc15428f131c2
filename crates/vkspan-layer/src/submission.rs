//! Per-submission state machine.
//!
//! A submission enters here after the real queue-submit has been forwarded
//! (Issued and Forwarded have already happened on the calling thread) and
//! sits in Pending until a non-blocking poll finds its GPU work complete.
//! Terminal states: Retired (spans resolved and emitted) or Lost (a buffer
//! was reset or freed first; spans are emitted as gaps and any orphaned
//! slots released once the GPU is provably done with them).

use ash::vk;
use crossbeam_channel::Sender;
use tracing::{debug, warn};

use vkspan_events::{GapReason, TraceEvent};

use crate::command_tracker::{CommandBufferTracker, SpanSnapshot};
use crate::device_ops::DeviceBackend;
use crate::query_slots::{QuerySlotPool, SlotId, SlotReadback};

/// A span belonging to one pending submission: the snapshot plus the buffer
/// it came from. Slot references are non-owning; the command buffer record
/// owns them.
#[derive(Debug)]
pub struct SpanRef {
    pub command_buffer: u64,
    pub snapshot: SpanSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubmissionState {
    Pending,
    Lost,
}

#[derive(Debug)]
struct PendingSubmission {
    queue: u64,
    fence: Option<vk::Fence>,
    cpu_submit_ns: u64,
    command_buffers: Vec<u64>,
    spans: Vec<SpanRef>,
    state: SubmissionState,
    /// Slots orphaned by an early reset/free, to be released at retirement.
    deferred_slots: Vec<SlotId>,
}

#[derive(Default)]
pub struct SubmissionTracker {
    pending: Vec<PendingSubmission>,
}

enum SpanOutcome {
    Resolved { begin_ns: u64, end_ns: u64 },
    Missing(GapReason),
}

impl SubmissionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        queue: u64,
        fence: Option<vk::Fence>,
        cpu_submit_ns: u64,
        command_buffers: Vec<u64>,
        spans: Vec<SpanRef>,
    ) {
        self.pending.push(PendingSubmission {
            queue,
            fence,
            cpu_submit_ns,
            command_buffers,
            spans,
            state: SubmissionState::Pending,
            deferred_slots: Vec::new(),
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// A buffer was reset or freed. If any pending submission references it,
    /// those submissions become Lost and `slots` are parked with one of them
    /// for release at retirement; the caller gets the slots back for
    /// immediate release otherwise.
    pub fn orphan_buffer(&mut self, buffer: u64, slots: Vec<SlotId>) -> Option<Vec<SlotId>> {
        let mut last_hit: Option<usize> = None;
        for (i, sub) in self.pending.iter_mut().enumerate() {
            if sub.command_buffers.contains(&buffer) {
                sub.state = SubmissionState::Lost;
                last_hit = Some(i);
            }
        }
        match last_hit {
            Some(i) => {
                self.pending[i].deferred_slots.extend(slots);
                None
            }
            None => Some(slots),
        }
    }

    /// One non-blocking retirement pass. Never stalls: a submission whose
    /// fence or query values are not yet available stays Pending.
    pub fn poll(
        &mut self,
        backend: &dyn DeviceBackend,
        slots: &mut QuerySlotPool,
        tracker: &mut CommandBufferTracker,
        events: &Sender<TraceEvent>,
    ) -> usize {
        let mut retired = 0;
        let mut i = 0;
        while i < self.pending.len() {
            let ready = match self.pending[i].state {
                SubmissionState::Pending => Self::resolve_pending(&self.pending[i], backend, slots),
                SubmissionState::Lost => {
                    if Self::lost_is_safe(&self.pending[i], backend, slots) {
                        Some(Vec::new())
                    } else {
                        None
                    }
                }
            };
            match ready {
                Some(outcomes) => {
                    let sub = self.pending.swap_remove(i);
                    Self::retire(sub, outcomes, slots, tracker, events);
                    retired += 1;
                }
                None => i += 1,
            }
        }
        retired
    }

    /// Final pass at device destruction: whatever a last poll cannot retire
    /// is force-retired as lost. The device is going away, so deferred slots
    /// are released unconditionally.
    pub fn drain(
        &mut self,
        backend: &dyn DeviceBackend,
        slots: &mut QuerySlotPool,
        tracker: &mut CommandBufferTracker,
        events: &Sender<TraceEvent>,
    ) {
        self.poll(backend, slots, tracker, events);
        let leftovers = std::mem::take(&mut self.pending);
        if !leftovers.is_empty() {
            warn!(
                count = leftovers.len(),
                "submissions still pending at device destruction, reporting as lost"
            );
        }
        for mut sub in leftovers {
            sub.state = SubmissionState::Lost;
            Self::retire(sub, Vec::new(), slots, tracker, events);
        }
    }

    /// Resolve every span of a pending submission, or None if the GPU is not
    /// done. Readiness is the fence when the application supplied one, plus
    /// availability of every instrumented slot.
    fn resolve_pending(
        sub: &PendingSubmission,
        backend: &dyn DeviceBackend,
        slots: &QuerySlotPool,
    ) -> Option<Vec<SpanOutcome>> {
        if let Some(fence) = sub.fence {
            match backend.fence_signaled(fence) {
                Ok(true) => {}
                Ok(false) => return None,
                Err(err) => {
                    // Fence may already be destroyed by the application; fall
                    // back to query availability alone.
                    debug!(?err, "fence status poll failed, using query availability");
                }
            }
        }

        let mut outcomes = Vec::with_capacity(sub.spans.len());
        for span in &sub.spans {
            let (Some(begin), Some(end)) = (span.snapshot.begin, span.snapshot.end) else {
                outcomes.push(SpanOutcome::Missing(GapReason::SlotsExhausted));
                continue;
            };
            match (Self::read_slot(slots, begin), Self::read_slot(slots, end)) {
                (Some(SlotReadback::Ready(b)), Some(SlotReadback::Ready(e))) => {
                    outcomes.push(SpanOutcome::Resolved {
                        begin_ns: b,
                        end_ns: e,
                    });
                }
                (Some(SlotReadback::Pending), _) | (_, Some(SlotReadback::Pending)) => {
                    return None;
                }
                // Readback error: the interval is unrecoverable.
                _ => outcomes.push(SpanOutcome::Missing(GapReason::SubmissionLost)),
            }
        }
        Some(outcomes)
    }

    /// A lost submission's slots may only be recycled once the GPU can no
    /// longer write them: fence signaled, or every orphaned slot available.
    fn lost_is_safe(
        sub: &PendingSubmission,
        backend: &dyn DeviceBackend,
        slots: &QuerySlotPool,
    ) -> bool {
        if let Some(fence) = sub.fence {
            if let Ok(signaled) = backend.fence_signaled(fence) {
                return signaled;
            }
        }
        sub.deferred_slots
            .iter()
            .all(|&slot| !matches!(Self::read_slot(slots, slot), Some(SlotReadback::Pending)))
    }

    fn read_slot(slots: &QuerySlotPool, slot: SlotId) -> Option<SlotReadback> {
        match slots.read(slot) {
            Ok(readback) => Some(readback),
            Err(err) => {
                warn!(?err, ?slot, "query readback failed");
                None
            }
        }
    }

    fn retire(
        sub: PendingSubmission,
        outcomes: Vec<SpanOutcome>,
        slots: &mut QuerySlotPool,
        tracker: &mut CommandBufferTracker,
        events: &Sender<TraceEvent>,
    ) {
        match sub.state {
            SubmissionState::Pending => {
                for (span, outcome) in sub.spans.iter().zip(outcomes) {
                    let event = match outcome {
                        SpanOutcome::Resolved { begin_ns, end_ns } => TraceEvent::GpuSpan {
                            queue: sub.queue,
                            command_buffer: span.command_buffer,
                            label: span.snapshot.label.clone(),
                            gpu_begin_ns: begin_ns,
                            gpu_end_ns: end_ns,
                            cpu_submit_ns: sub.cpu_submit_ns,
                        },
                        SpanOutcome::Missing(reason) => TraceEvent::Gap {
                            queue: sub.queue,
                            command_buffer: span.command_buffer,
                            label: span.snapshot.label.clone(),
                            cpu_submit_ns: sub.cpu_submit_ns,
                            reason,
                        },
                    };
                    if events.send(event).is_err() {
                        debug!("trace event consumer is gone, dropping event");
                    }
                }
            }
            SubmissionState::Lost => {
                debug!(
                    queue = format_args!("{:#x}", sub.queue),
                    spans = sub.spans.len(),
                    "submission lost before retirement"
                );
                for span in &sub.spans {
                    let event = TraceEvent::Gap {
                        queue: sub.queue,
                        command_buffer: span.command_buffer,
                        label: span.snapshot.label.clone(),
                        cpu_submit_ns: sub.cpu_submit_ns,
                        reason: GapReason::SubmissionLost,
                    };
                    if events.send(event).is_err() {
                        debug!("trace event consumer is gone, dropping event");
                    }
                }
            }
        }
        slots.release_all(sub.deferred_slots);
        for buffer in sub.command_buffers {
            tracker.mark_retired(buffer);
        }
    }
}
