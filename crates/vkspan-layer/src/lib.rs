//! An implicit Vulkan layer that measures GPU execution time of submitted
//! command buffers with timestamp queries and streams the resulting spans
//! as trace events.
//!
//! The crate splits into a thin loader-facing shim ([`entry`]) and a core
//! that never touches process-global state: [`context::LayerContext`]
//! composes the dispatch tables, per-device timing state, and the queue
//! registry, and every intercepted call flows through it. The core is
//! exercised in tests through the [`device_ops::DeviceBackend`] seam
//! without a driver.

pub mod command_tracker;
pub mod context;
pub mod device;
pub mod device_ops;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod metadata;
pub mod query_slots;
pub mod queue_registry;
pub mod submission;
