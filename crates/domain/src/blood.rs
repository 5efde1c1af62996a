//! Blood product value objects.

use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// ABO/Rh blood group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum BloodGroup {
    #[serde(rename = "A+")]
    APositive,
    #[serde(rename = "A-")]
    ANegative,
    #[serde(rename = "B+")]
    BPositive,
    #[serde(rename = "B-")]
    BNegative,
    #[serde(rename = "AB+")]
    AbPositive,
    #[serde(rename = "AB-")]
    AbNegative,
    #[default]
    #[serde(rename = "O+")]
    OPositive,
    #[serde(rename = "O-")]
    ONegative,
}

impl BloodGroup {
    pub const ALL: [BloodGroup; 8] = [
        BloodGroup::APositive,
        BloodGroup::ANegative,
        BloodGroup::BPositive,
        BloodGroup::BNegative,
        BloodGroup::AbPositive,
        BloodGroup::AbNegative,
        BloodGroup::OPositive,
        BloodGroup::ONegative,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BloodGroup::APositive => "A+",
            BloodGroup::ANegative => "A-",
            BloodGroup::BPositive => "B+",
            BloodGroup::BNegative => "B-",
            BloodGroup::AbPositive => "AB+",
            BloodGroup::AbNegative => "AB-",
            BloodGroup::OPositive => "O+",
            BloodGroup::ONegative => "O-",
        }
    }
}

impl std::fmt::Display for BloodGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown blood group or component.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised {kind}: {value}")]
pub struct ParseBloodError {
    kind: &'static str,
    value: String,
}

impl FromStr for BloodGroup {
    type Err = ParseBloodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        BloodGroup::ALL
            .into_iter()
            .find(|group| group.as_str() == normalized)
            .ok_or_else(|| ParseBloodError {
                kind: "blood group",
                value: s.to_string(),
            })
    }
}

/// Blood component carried by a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    #[default]
    WholeBlood,
    RedCells,
    Platelets,
    Plasma,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::WholeBlood => "whole_blood",
            Component::RedCells => "red_cells",
            Component::Platelets => "platelets",
            Component::Plasma => "plasma",
        }
    }

    /// Storage life of a freshly collected unit.
    pub fn shelf_life(&self) -> Duration {
        match self {
            Component::WholeBlood => Duration::days(35),
            Component::RedCells => Duration::days(42),
            Component::Platelets => Duration::days(5),
            Component::Plasma => Duration::days(365),
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = ParseBloodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whole_blood" => Ok(Component::WholeBlood),
            "red_cells" => Ok(Component::RedCells),
            "platelets" => Ok(Component::Platelets),
            "plasma" => Ok(Component::Plasma),
            _ => Err(ParseBloodError {
                kind: "component",
                value: s.to_string(),
            }),
        }
    }
}

/// Clinical urgency of a request. Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn is_critical(&self) -> bool {
        matches!(self, Urgency::Critical)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
