//! Shared ambient pieces for the vkspan layer: logging bootstrap, the
//! monotonic CPU clock used to timestamp submissions, and configuration.

pub mod clock;
pub mod config;
pub mod logging;

pub use config::VkspanConfig;
