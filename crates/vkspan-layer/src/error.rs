use ash::vk;

/// Failure classes for the layer's own bookkeeping. None of these ever leak
/// into the return value of a forwarded Vulkan call; fatal ones abort the
/// process at the entry shim, the rest degrade tracing fidelity only.
#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    /// A lookup for a handle this layer never saw created. Either a layer bug
    /// or an upstream API-contract violation; not recoverable.
    #[error("unknown {kind} handle {handle:#x}")]
    UnknownHandle { kind: &'static str, handle: u64 },

    #[error("command buffer {0:#x} is in the wrong state for this call")]
    InvalidBufferState(u64),

    #[error("marker end without a matching begin on command buffer {0:#x}")]
    UnbalancedMarker(u64),

    #[error("command buffer {0:#x} freed while a submission is still pending")]
    FreedWhilePending(u64),

    #[error("driver call failed: {0:?}")]
    Driver(vk::Result),
}

impl LayerError {
    /// Consistency violations cannot be recovered from; everything else is a
    /// degraded-but-alive path (trace gaps, skipped instrumentation).
    pub fn is_fatal(&self) -> bool {
        matches!(self, LayerError::UnknownHandle { .. })
    }
}

pub type LayerResult<T> = Result<T, LayerError>;
