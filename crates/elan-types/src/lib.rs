//! Common value types for the ELAN control plane.
//!
//! This crate provides type-safe representations of the primitives shared by
//! the membership, broadcast-group and MAC-learning logic:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`DatapathId`]: numeric switch (datapath) identifiers
//! - [`AdminState`] / [`OperState`]: interface states
//! - [`EtreeRole`]: root/leaf role of an interface in an etree domain
//! - [`SegmentationType`] / [`SegmentKind`]: overlay segmentation and the
//!   base/leaf sub-segment of a domain

mod datapath;
mod mac;
mod port;
mod segment;

pub use datapath::DatapathId;
pub use mac::MacAddress;
pub use port::{AdminState, EtreeRole, OperState};
pub use segment::{SegmentKind, SegmentationType};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid datapath id: {0}")]
    InvalidDatapathId(String),

    #[error("invalid segmentation type: {0}")]
    InvalidSegmentationType(String),

    #[error("invalid interface state: {0}")]
    InvalidState(String),

    #[error("invalid etree role: {0}")]
    InvalidEtreeRole(String),
}
