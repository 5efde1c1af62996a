//! Cold-chain policy and transport incidents.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Minor => "minor",
            Severity::Major => "major",
            Severity::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minor" => Ok(Severity::Minor),
            "major" => Ok(Severity::Major),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    TemperatureExcursion,
    Delay,
    Damage,
    Other,
}

/// An incident recorded against a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub description: String,
    pub reported_at: DateTime<Utc>,
}

impl TransportIssue {
    pub fn new(
        kind: IssueKind,
        severity: Severity,
        description: impl Into<String>,
        reported_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
            reported_at,
        }
    }

    pub fn is_cold_chain(&self) -> bool {
        self.kind == IssueKind::TemperatureExcursion
    }
}

/// One temperature log entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub celsius: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Safe storage range and the thresholds that turn incidents into failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColdChainPolicy {
    pub min_celsius: f64,
    pub max_celsius: f64,
    /// An excursion lasting this long is escalated to a critical issue.
    pub max_excursion: Duration,
    /// Issues at or above this severity fail the job.
    pub fail_severity: Severity,
}

impl Default for ColdChainPolicy {
    fn default() -> Self {
        Self {
            min_celsius: 1.0,
            max_celsius: 10.0,
            max_excursion: Duration::minutes(30),
            fail_severity: Severity::Critical,
        }
    }
}

impl ColdChainPolicy {
    pub fn in_range(&self, celsius: f64) -> bool {
        (self.min_celsius..=self.max_celsius).contains(&celsius)
    }

    pub fn should_fail(&self, issue: &TransportIssue) -> bool {
        issue.severity >= self.fail_severity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_range_is_one_to_ten() {
        let policy = ColdChainPolicy::default();
        assert!(policy.in_range(1.0));
        assert!(policy.in_range(10.0));
        assert!(!policy.in_range(0.5));
        assert!(!policy.in_range(12.0));
    }

    #[test]
    fn only_severe_issues_fail_jobs() {
        let policy = ColdChainPolicy::default();
        let now = Utc::now();
        let minor = TransportIssue::new(IssueKind::Delay, Severity::Minor, "traffic", now);
        let critical =
            TransportIssue::new(IssueKind::Damage, Severity::Critical, "crushed box", now);

        assert!(!policy.should_fail(&minor));
        assert!(policy.should_fail(&critical));
    }

    #[test]
    fn severity_parses() {
        assert_eq!("Major".parse::<Severity>().unwrap(), Severity::Major);
        assert!("severe".parse::<Severity>().is_err());
    }
}
