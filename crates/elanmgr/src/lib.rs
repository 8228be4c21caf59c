//! ELAN Manager - L2 overlay control-plane core
//!
//! Keeps one logical broadcast domain ("ELAN") consistent across many
//! switches: tracks which switches carry member ports, programs local and
//! remote flood groups, and maintains unicast MAC forwarding state learned
//! from the data plane.
//!
//! # Architecture
//!
//! ```text
//! [config API] ──> [ElanManager] ──> [MembershipStore] ──> [BroadcastGroupSync] ─┐
//!                        │                                                       ├──> [SwitchProgrammer]
//! [packet-in] ───> [PacketLearner] ──> [MacTable] ──> [MacFlowProgrammer] ───────┘
//! ```
//!
//! Every mutation runs as a keyed job on a [`JobCoordinator`](elan_orch_common::JobCoordinator):
//!
//! - `elan:<domain>`: domain lifecycle, switch join and leave
//! - `port:<port>`: interface add and remove
//! - `mac:<domain>:<mac>`: MAC ownership decisions
//! - `mac:<domain>:<mac>:<dpn>`: MAC rule programming on one switch

#[macro_use]
pub mod audit;

pub mod bcast;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod interfaces;
pub mod keys;
pub mod learning;
pub mod mac;
pub mod manager;
pub mod memory;
pub mod membership;
pub mod programming;
pub mod types;

pub use config::ElanConfig;
pub use error::{ElanError, Result};
pub use manager::{ElanCollaborators, ElanManager};
