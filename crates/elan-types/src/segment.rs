//! Segmentation of an ELAN domain.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Overlay/provider segmentation of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentationType {
    #[default]
    Flat,
    Vlan,
    Vxlan,
}

impl SegmentationType {
    pub const fn is_vxlan(&self) -> bool {
        matches!(self, SegmentationType::Vxlan)
    }
}

impl fmt::Display for SegmentationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentationType::Flat => write!(f, "flat"),
            SegmentationType::Vlan => write!(f, "vlan"),
            SegmentationType::Vxlan => write!(f, "vxlan"),
        }
    }
}

impl FromStr for SegmentationType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "flat" => Ok(SegmentationType::Flat),
            "vlan" => Ok(SegmentationType::Vlan),
            "vxlan" => Ok(SegmentationType::Vxlan),
            _ => Err(ParseError::InvalidSegmentationType(s.to_string())),
        }
    }
}

/// Sub-segment of a domain that a group or flow is computed for.
///
/// Every domain has a [`SegmentKind::Base`] segment. Etree domains add a
/// [`SegmentKind::Leaf`] segment identified by the leaf tag; traffic entering
/// from a leaf interface is tagged with it and may only reach roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Base,
    Leaf,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentKind::Base => write!(f, "base"),
            SegmentKind::Leaf => write!(f, "leaf"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segmentation_parse() {
        assert_eq!(
            "VXLAN".parse::<SegmentationType>().unwrap(),
            SegmentationType::Vxlan
        );
        assert!("gre".parse::<SegmentationType>().is_err());
        assert!(SegmentationType::Vxlan.is_vxlan());
        assert!(!SegmentationType::Vlan.is_vxlan());
    }

    #[test]
    fn test_segment_kind_order() {
        assert!(SegmentKind::Base < SegmentKind::Leaf);
        assert_eq!(SegmentKind::Leaf.to_string(), "leaf");
    }
}
