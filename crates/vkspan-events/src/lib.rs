//! Trace event data model shared between the vkspan layer and the
//! profiler consumer. The layer produces these events; how they travel to
//! the consumer is up to the embedding (the crate ships a simple JSON-lines
//! stream writer).

pub mod event;
pub mod stream;

pub use event::{GapReason, TraceEvent};
pub use stream::EventWriter;
