//! MAC forwarding state machine.
//!
//! [`MacTable`] owns who holds each MAC; [`MacFlowProgrammer`] turns that
//! ownership into per-switch forwarding rules.

mod flows;
mod table;

pub use flows::{local_dmac_flows, smac_flow, MacFlowProgrammer, SwitchMacState};
pub use table::{MacTable, MacTransition};
