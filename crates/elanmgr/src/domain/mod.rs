//! Domain registry and tag lifecycle.

mod registry;

pub use registry::{Admission, DomainRegistry, DomainState, InterfaceOp, PendingInterface};
