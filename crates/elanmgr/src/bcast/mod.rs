//! Broadcast (flood) group synchronization.

mod sync;

pub use sync::{local_buckets, BroadcastGroupSync};
