//! display-coordinator - display controller control plane
//!
//! Arbitrates a display engine between a primary compositor client and a
//! virtual console, validates and applies layer configurations, and paces
//! vsync delivery to clients.

pub mod config;
pub mod coordinator;
pub mod display;
pub mod engine;
pub mod fence;
pub mod image;
pub mod layer;
pub mod session;
pub mod status;
pub mod types;

#[cfg(test)]
mod test_util;

// Re-exports
pub use config::{Config, CoordinatorConfig};
pub use coordinator::{spawn, Coordinator, CoordinatorHandle, SessionHandle, Snapshot};
pub use engine::{BufferAllocator, DisplayEngine, HeadlessAllocator, HeadlessEngine};
pub use session::{Reply, Request, SessionEvent};
pub use status::Status;
