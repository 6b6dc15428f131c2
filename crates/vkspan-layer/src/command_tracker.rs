//! Command buffer lifecycle tracking.
//!
//! One record per live command buffer: its allocation pool, its recording
//! state mirroring the Vulkan lifecycle, and the ordered slice sequence
//! (whole-buffer query begin/end plus nested marker regions) recorded into
//! it. A reverse pool index supports the cascading pool reset. The tracker
//! never touches the driver; slots it releases are handed back to the caller
//! for return to the query slot pool.

use std::collections::HashMap;

use tracing::warn;

use crate::error::{LayerError, LayerResult};
use crate::query_slots::SlotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Initial,
    Recording,
    Executable,
    Invalid,
}

/// One entry of a buffer's ordered slice sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceEvent {
    /// Whole-buffer timestamp written at begin-recording.
    QueryBegin { slot: Option<SlotId> },
    /// Whole-buffer timestamp written at end-recording.
    QueryEnd { slot: Option<SlotId> },
    MarkerBegin {
        label: String,
        slot: Option<SlotId>,
    },
    MarkerEnd { slot: Option<SlotId> },
}

impl SliceEvent {
    fn slot(&self) -> Option<SlotId> {
        match self {
            SliceEvent::QueryBegin { slot }
            | SliceEvent::QueryEnd { slot }
            | SliceEvent::MarkerBegin { slot, .. }
            | SliceEvent::MarkerEnd { slot } => *slot,
        }
    }
}

/// A span extracted from an executable buffer's slice sequence. Begin or end
/// may be missing when slot acquisition failed at record time; such spans
/// become trace gaps at retirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanSnapshot {
    pub label: Option<String>,
    pub begin: Option<SlotId>,
    pub end: Option<SlotId>,
}

#[derive(Debug)]
pub struct CommandBufferRecord {
    pub pool: u64,
    pub state: BufferState,
    pub slices: Vec<SliceEvent>,
    /// Indices into `slices` of MarkerBegin entries not yet matched.
    open_markers: Vec<usize>,
    /// Submissions forwarded but not yet retired that reference this buffer.
    pub pending_submissions: u32,
}

impl CommandBufferRecord {
    fn new(pool: u64) -> Self {
        Self {
            pool,
            state: BufferState::Initial,
            slices: Vec::new(),
            open_markers: Vec::new(),
            pending_submissions: 0,
        }
    }

    fn take_slots(&mut self) -> Vec<SlotId> {
        let slots = self.slices.iter().filter_map(SliceEvent::slot).collect();
        self.slices.clear();
        self.open_markers.clear();
        slots
    }
}

/// Slots recovered by a reset or free, with the flag telling the caller
/// whether they may be released immediately or must wait for retirement of a
/// still-pending submission.
#[derive(Debug)]
pub struct ReclaimedSlots {
    pub command_buffer: u64,
    pub slots: Vec<SlotId>,
    pub was_pending: bool,
}

#[derive(Default)]
pub struct CommandBufferTracker {
    records: HashMap<u64, CommandBufferRecord>,
    pools: HashMap<u64, Vec<u64>>,
}

impl CommandBufferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_allocate(&mut self, pool: u64, buffers: &[u64]) {
        for &buffer in buffers {
            self.records.insert(buffer, CommandBufferRecord::new(pool));
            self.pools.entry(pool).or_default().push(buffer);
        }
    }

    /// Begin recording: clears any stale slice sequence (returning its slots
    /// for release) and moves the buffer to Recording. Re-begin of an
    /// executable buffer is the API's simultaneous-use/reuse path and is
    /// allowed; only Recording itself is rejected.
    pub fn begin_recording(&mut self, buffer: u64) -> LayerResult<Vec<SlotId>> {
        let record = self.record_mut(buffer)?;
        if record.state == BufferState::Recording {
            return Err(LayerError::InvalidBufferState(buffer));
        }
        let slots = record.take_slots();
        record.state = BufferState::Recording;
        Ok(slots)
    }

    /// Append a slice to a recording buffer. Marker ends must match an open
    /// begin; a mismatch is caller misuse, rejected without mutating state.
    pub fn push_slice(&mut self, buffer: u64, slice: SliceEvent) -> LayerResult<()> {
        let record = self.record_mut(buffer)?;
        if record.state != BufferState::Recording {
            return Err(LayerError::InvalidBufferState(buffer));
        }
        match &slice {
            SliceEvent::MarkerBegin { .. } => {
                record.open_markers.push(record.slices.len());
            }
            SliceEvent::MarkerEnd { .. } => {
                if record.open_markers.pop().is_none() {
                    return Err(LayerError::UnbalancedMarker(buffer));
                }
            }
            SliceEvent::QueryBegin { .. } | SliceEvent::QueryEnd { .. } => {}
        }
        record.slices.push(slice);
        Ok(())
    }

    /// End recording: Recording -> Executable. The slice sequence is frozen
    /// until the next reset. Markers still open are logged and will simply
    /// produce no span.
    pub fn end_recording(&mut self, buffer: u64) -> LayerResult<()> {
        let record = self.record_mut(buffer)?;
        if record.state != BufferState::Recording {
            return Err(LayerError::InvalidBufferState(buffer));
        }
        if !record.open_markers.is_empty() {
            warn!(
                buffer = format_args!("{buffer:#x}"),
                open = record.open_markers.len(),
                "command buffer ended with unclosed marker regions"
            );
        }
        record.state = BufferState::Executable;
        Ok(())
    }

    /// Read the span set of an executable buffer for one submission. The
    /// sequence is re-read, never consumed: a reusable buffer submitted many
    /// times yields the same snapshot each time.
    pub fn snapshot_spans(&self, buffer: u64) -> LayerResult<Vec<SpanSnapshot>> {
        let record = self.record(buffer)?;
        if record.state != BufferState::Executable {
            return Err(LayerError::InvalidBufferState(buffer));
        }

        let mut spans = Vec::new();
        let mut buffer_begin: Option<Option<SlotId>> = None;
        let mut marker_stack: Vec<(String, Option<SlotId>)> = Vec::new();
        for slice in &record.slices {
            match slice {
                SliceEvent::QueryBegin { slot } => buffer_begin = Some(*slot),
                SliceEvent::QueryEnd { slot } => {
                    spans.push(SpanSnapshot {
                        label: None,
                        begin: buffer_begin.take().unwrap_or(None),
                        end: *slot,
                    });
                }
                SliceEvent::MarkerBegin { label, slot } => {
                    marker_stack.push((label.clone(), *slot));
                }
                SliceEvent::MarkerEnd { slot } => {
                    // Well-nestedness is enforced at record time, so the
                    // stack cannot underflow here.
                    if let Some((label, begin)) = marker_stack.pop() {
                        spans.push(SpanSnapshot {
                            label: Some(label),
                            begin,
                            end: *slot,
                        });
                    }
                }
            }
        }
        Ok(spans)
    }

    pub fn mark_submitted(&mut self, buffer: u64) -> LayerResult<()> {
        let record = self.record_mut(buffer)?;
        record.pending_submissions += 1;
        Ok(())
    }

    pub fn mark_retired(&mut self, buffer: u64) {
        // The buffer may have been freed before its submission retired.
        if let Some(record) = self.records.get_mut(&buffer) {
            record.pending_submissions = record.pending_submissions.saturating_sub(1);
        }
    }

    /// Buffer reset: back to Initial, slice sequence cleared. Slots come
    /// back flagged with whether a submission still references them.
    pub fn reset_buffer(&mut self, buffer: u64) -> LayerResult<ReclaimedSlots> {
        let record = self.record_mut(buffer)?;
        let slots = record.take_slots();
        let was_pending = record.pending_submissions > 0;
        record.state = BufferState::Initial;
        Ok(ReclaimedSlots {
            command_buffer: buffer,
            slots,
            was_pending,
        })
    }

    /// Pool reset cascades to every buffer allocated from the pool.
    pub fn reset_pool(&mut self, pool: u64) -> Vec<ReclaimedSlots> {
        let buffers = self.pools.get(&pool).cloned().unwrap_or_default();
        let mut reclaimed = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            if let Ok(outcome) = self.reset_buffer(buffer) {
                reclaimed.push(outcome);
            }
        }
        reclaimed
    }

    /// Remove records entirely. Freeing a buffer that still has a pending
    /// submission is reported through `was_pending`; the caller logs it
    /// loudly and routes the slots through the deferred-release path.
    pub fn free(&mut self, buffers: &[u64]) -> Vec<ReclaimedSlots> {
        let mut reclaimed = Vec::with_capacity(buffers.len());
        for &buffer in buffers {
            let Some(mut record) = self.records.remove(&buffer) else {
                continue;
            };
            if let Some(siblings) = self.pools.get_mut(&record.pool) {
                siblings.retain(|&b| b != buffer);
            }
            reclaimed.push(ReclaimedSlots {
                command_buffer: buffer,
                slots: record.take_slots(),
                was_pending: record.pending_submissions > 0,
            });
        }
        reclaimed
    }

    pub fn state_of(&self, buffer: u64) -> Option<BufferState> {
        self.records.get(&buffer).map(|r| r.state)
    }

    pub fn contains(&self, buffer: u64) -> bool {
        self.records.contains_key(&buffer)
    }

    fn record(&self, buffer: u64) -> LayerResult<&CommandBufferRecord> {
        self.records
            .get(&buffer)
            .ok_or(LayerError::UnknownHandle {
                kind: "command buffer",
                handle: buffer,
            })
    }

    fn record_mut(&mut self, buffer: u64) -> LayerResult<&mut CommandBufferRecord> {
        self.records
            .get_mut(&buffer)
            .ok_or(LayerError::UnknownHandle {
                kind: "command buffer",
                handle: buffer,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::{self, Handle};

    fn slot(n: u64) -> Option<SlotId> {
        Some(SlotId {
            pool: vk::QueryPool::from_raw(1),
            query: n as u32,
        })
    }

    fn record_simple(tracker: &mut CommandBufferTracker, cb: u64) {
        tracker.on_allocate(0x100, &[cb]);
        tracker.begin_recording(cb).expect("begin");
        tracker
            .push_slice(cb, SliceEvent::QueryBegin { slot: slot(0) })
            .expect("slice");
        tracker
            .push_slice(
                cb,
                SliceEvent::MarkerBegin {
                    label: "Frame".to_string(),
                    slot: slot(1),
                },
            )
            .expect("slice");
        tracker
            .push_slice(cb, SliceEvent::MarkerEnd { slot: slot(2) })
            .expect("slice");
        tracker
            .push_slice(cb, SliceEvent::QueryEnd { slot: slot(3) })
            .expect("slice");
        tracker.end_recording(cb).expect("end");
    }

    #[test]
    fn marker_end_without_begin_is_rejected_as_no_op() {
        let mut tracker = CommandBufferTracker::new();
        tracker.on_allocate(0x100, &[0x1]);
        tracker.begin_recording(0x1).expect("begin");
        let err = tracker
            .push_slice(0x1, SliceEvent::MarkerEnd { slot: slot(0) })
            .expect_err("unbalanced end must fail");
        assert!(matches!(err, LayerError::UnbalancedMarker(0x1)));
        // No slice was appended.
        tracker.end_recording(0x1).expect("end");
        assert!(tracker.snapshot_spans(0x1).expect("snapshot").is_empty());
    }

    #[test]
    fn nested_markers_pair_innermost_first() {
        let mut tracker = CommandBufferTracker::new();
        tracker.on_allocate(0x100, &[0x1]);
        tracker.begin_recording(0x1).expect("begin");
        for (label, s) in [("outer", 0), ("inner", 1)] {
            tracker
                .push_slice(
                    0x1,
                    SliceEvent::MarkerBegin {
                        label: label.to_string(),
                        slot: slot(s),
                    },
                )
                .expect("begin slice");
        }
        tracker
            .push_slice(0x1, SliceEvent::MarkerEnd { slot: slot(2) })
            .expect("inner end");
        tracker
            .push_slice(0x1, SliceEvent::MarkerEnd { slot: slot(3) })
            .expect("outer end");
        tracker.end_recording(0x1).expect("end");

        let spans = tracker.snapshot_spans(0x1).expect("snapshot");
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].label.as_deref(), Some("inner"));
        assert_eq!(spans[0].begin, slot(1));
        assert_eq!(spans[0].end, slot(2));
        assert_eq!(spans[1].label.as_deref(), Some("outer"));
        assert_eq!(spans[1].begin, slot(0));
        assert_eq!(spans[1].end, slot(3));
    }

    #[test]
    fn snapshot_does_not_consume_the_sequence() {
        let mut tracker = CommandBufferTracker::new();
        record_simple(&mut tracker, 0x1);
        let first = tracker.snapshot_spans(0x1).expect("first");
        let second = tracker.snapshot_spans(0x1).expect("second");
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn snapshot_requires_executable_state() {
        let mut tracker = CommandBufferTracker::new();
        tracker.on_allocate(0x100, &[0x1]);
        assert!(matches!(
            tracker.snapshot_spans(0x1),
            Err(LayerError::InvalidBufferState(0x1))
        ));
        tracker.begin_recording(0x1).expect("begin");
        assert!(matches!(
            tracker.snapshot_spans(0x1),
            Err(LayerError::InvalidBufferState(0x1))
        ));
    }

    #[test]
    fn pool_reset_cascades_to_all_buffers() {
        let mut tracker = CommandBufferTracker::new();
        record_simple(&mut tracker, 0x1);
        tracker.on_allocate(0x100, &[0x2]);
        tracker.begin_recording(0x2).expect("begin");
        tracker
            .push_slice(0x2, SliceEvent::QueryBegin { slot: slot(9) })
            .expect("slice");
        tracker.end_recording(0x2).expect("end");

        let reclaimed = tracker.reset_pool(0x100);
        assert_eq!(reclaimed.len(), 2);
        let total_slots: usize = reclaimed.iter().map(|r| r.slots.len()).sum();
        assert_eq!(total_slots, 5);
        assert_eq!(tracker.state_of(0x1), Some(BufferState::Initial));
        assert_eq!(tracker.state_of(0x2), Some(BufferState::Initial));
    }

    #[test]
    fn free_while_pending_is_flagged() {
        let mut tracker = CommandBufferTracker::new();
        record_simple(&mut tracker, 0x1);
        tracker.mark_submitted(0x1).expect("submit");
        let reclaimed = tracker.free(&[0x1]);
        assert_eq!(reclaimed.len(), 1);
        assert!(reclaimed[0].was_pending);
        assert!(!tracker.contains(0x1));
    }

    #[test]
    fn rebegin_clears_stale_slices_and_returns_slots() {
        let mut tracker = CommandBufferTracker::new();
        record_simple(&mut tracker, 0x1);
        let stale = tracker.begin_recording(0x1).expect("re-begin");
        assert_eq!(stale.len(), 4);
        assert_eq!(tracker.state_of(0x1), Some(BufferState::Recording));
        tracker.end_recording(0x1).expect("end");
        assert!(tracker.snapshot_spans(0x1).expect("snapshot").is_empty());
    }
}
