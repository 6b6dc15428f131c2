use serde::{Deserialize, Serialize};

/// A single correlated timing event emitted by the layer.
///
/// Handles are the raw Vulkan handle values, opaque to the consumer but
/// stable for the lifetime of the traced object. GPU timestamps are in
/// nanoseconds on the device timeline (timestamp ticks scaled by the
/// device's timestamp period); CPU timestamps are monotonic process-local
/// nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceEvent {
    /// A completed GPU interval attributed to one command buffer, and to a
    /// named marker region within it if `label` is set. An unlabeled span
    /// covers the whole command buffer execution.
    GpuSpan {
        queue: u64,
        command_buffer: u64,
        label: Option<String>,
        gpu_begin_ns: u64,
        gpu_end_ns: u64,
        cpu_submit_ns: u64,
    },
    /// A region that was submitted but for which no timing could be
    /// recovered. The trace has a hole here, not corrupted data.
    Gap {
        queue: u64,
        command_buffer: u64,
        label: Option<String>,
        cpu_submit_ns: u64,
        reason: GapReason,
    },
    /// A presentation call on `queue`. Carries no GPU interval of its own;
    /// the consumer correlates it against the queue's prior spans.
    FrameBoundary { queue: u64, cpu_ns: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapReason {
    /// The query slot budget was exhausted when the region was recorded.
    SlotsExhausted,
    /// The command buffer was reset or freed before the submission retired.
    SubmissionLost,
}

impl TraceEvent {
    /// The queue the event is attributed to.
    pub fn queue(&self) -> u64 {
        match self {
            TraceEvent::GpuSpan { queue, .. }
            | TraceEvent::Gap { queue, .. }
            | TraceEvent::FrameBoundary { queue, .. } => *queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_round_trip() {
        let event = TraceEvent::GpuSpan {
            queue: 0x10,
            command_buffer: 0x20,
            label: Some("Frame".to_string()),
            gpu_begin_ns: 100,
            gpu_end_ns: 250,
            cpu_submit_ns: 90,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        let back: TraceEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(event, back);
    }

    #[test]
    fn gap_keeps_reason() {
        let event = TraceEvent::Gap {
            queue: 1,
            command_buffer: 2,
            label: None,
            cpu_submit_ns: 5,
            reason: GapReason::SubmissionLost,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("SubmissionLost"));
    }
}
