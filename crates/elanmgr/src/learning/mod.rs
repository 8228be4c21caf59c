//! Packet-in driven MAC learning.

mod handler;

pub use handler::{
    DomainRef, LearnDecision, LearningStats, LearningStatsSnapshot, PacketLearner,
    UnknownSourceEvent,
};
