//! Capability Registry and Router.

mod registry;
mod router;

pub use registry::{CapabilityRegistry, WorkerDescriptor, WorkerLoad};
pub use router::Router;
