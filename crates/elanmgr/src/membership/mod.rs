//! Per-switch domain membership.

mod store;

pub use store::MembershipStore;
