//! Interface state and role definitions.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Administrative state of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminState {
    /// Interface is administratively down (default for new interfaces).
    #[default]
    Down,
    /// Interface is administratively up.
    Up,
}

impl AdminState {
    pub const fn is_up(&self) -> bool {
        matches!(self, AdminState::Up)
    }
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminState::Up => write!(f, "up"),
            AdminState::Down => write!(f, "down"),
        }
    }
}

impl FromStr for AdminState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "up" => Ok(AdminState::Up),
            "down" => Ok(AdminState::Down),
            _ => Err(ParseError::InvalidState(s.to_string())),
        }
    }
}

/// Operational state of an interface as reported by the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperState {
    #[default]
    Down,
    Up,
    /// State not (yet) reported.
    Unknown,
}

impl OperState {
    pub const fn is_up(&self) -> bool {
        matches!(self, OperState::Up)
    }
}

impl fmt::Display for OperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperState::Up => write!(f, "up"),
            OperState::Down => write!(f, "down"),
            OperState::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for OperState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "up" => Ok(OperState::Up),
            "down" => Ok(OperState::Down),
            "unknown" => Ok(OperState::Unknown),
            _ => Err(ParseError::InvalidState(s.to_string())),
        }
    }
}

/// Role of an interface inside an etree (rooted multipoint) domain.
///
/// Leaves may reach roots but never each other. Interfaces of a plain domain
/// carry [`EtreeRole::None`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EtreeRole {
    #[default]
    None,
    Root,
    Leaf,
}

impl EtreeRole {
    pub const fn is_leaf(&self) -> bool {
        matches!(self, EtreeRole::Leaf)
    }

    /// Returns true if the interface may flood toward leaves.
    ///
    /// In a plain domain every interface behaves as a root.
    pub const fn is_root_like(&self) -> bool {
        !self.is_leaf()
    }
}

impl fmt::Display for EtreeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EtreeRole::None => write!(f, "none"),
            EtreeRole::Root => write!(f, "root"),
            EtreeRole::Leaf => write!(f, "leaf"),
        }
    }
}

impl FromStr for EtreeRole {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(EtreeRole::None),
            "root" => Ok(EtreeRole::Root),
            "leaf" => Ok(EtreeRole::Leaf),
            _ => Err(ParseError::InvalidEtreeRole(s.to_string())),
        }
    }
}
