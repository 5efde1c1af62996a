//! Orchestrator tuning loaded from environment variables.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use domain::{ColdChainPolicy, Severity, Urgency};

/// Escalation timing, search radius and cold-chain thresholds.
///
/// Reads from environment variables:
/// - `SEARCH_RADIUS_KM` (default: `50.0`)
/// - `ESCALATION_FRACTION` (default: `0.5`)
/// - `CRITICAL_DONOR_WINDOW_MINUTES` (default: `30`)
/// - `HIGH_DONOR_WINDOW_MINUTES` (default: `240`)
/// - `INSTITUTION_WINDOW_MINUTES` (default: `180`)
/// - `CLOSING_WINDOW_MINUTES` (default: `60`)
/// - `COLD_CHAIN_MIN_C` / `COLD_CHAIN_MAX_C` (default: `1.0` / `10.0`)
/// - `COLD_CHAIN_MAX_EXCURSION_MINUTES` (default: `30`)
/// - `COLD_CHAIN_FAIL_SEVERITY` (default: `critical`)
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub search_radius_km: f64,
    /// Share of the submit-to-deadline budget after which institutions are
    /// brought in. Critical requests escalate at once.
    pub escalation_fraction: f64,
    pub critical_donor_window: Duration,
    pub high_donor_window: Duration,
    pub institution_window: Duration,
    /// How close to the deadline a partly served request reads as
    /// `partially_fulfilled`.
    pub closing_window: Duration,
    pub cold_chain: ColdChainPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            search_radius_km: 50.0,
            escalation_fraction: 0.5,
            critical_donor_window: Duration::minutes(30),
            high_donor_window: Duration::minutes(240),
            institution_window: Duration::minutes(180),
            closing_window: Duration::minutes(60),
            cold_chain: ColdChainPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables. Unparseable values
    /// are logged and replaced by their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let fraction: f64 = env_or("ESCALATION_FRACTION", defaults.escalation_fraction);
        let fraction = if (0.0..=1.0).contains(&fraction) {
            fraction
        } else {
            tracing::warn!(fraction, "ESCALATION_FRACTION outside 0..=1, using default");
            defaults.escalation_fraction
        };

        Self {
            search_radius_km: env_or("SEARCH_RADIUS_KM", defaults.search_radius_km),
            escalation_fraction: fraction,
            critical_donor_window: env_minutes(
                "CRITICAL_DONOR_WINDOW_MINUTES",
                defaults.critical_donor_window,
            ),
            high_donor_window: env_minutes("HIGH_DONOR_WINDOW_MINUTES", defaults.high_donor_window),
            institution_window: env_minutes(
                "INSTITUTION_WINDOW_MINUTES",
                defaults.institution_window,
            ),
            closing_window: env_minutes("CLOSING_WINDOW_MINUTES", defaults.closing_window),
            cold_chain: ColdChainPolicy {
                min_celsius: env_or("COLD_CHAIN_MIN_C", defaults.cold_chain.min_celsius),
                max_celsius: env_or("COLD_CHAIN_MAX_C", defaults.cold_chain.max_celsius),
                max_excursion: env_minutes(
                    "COLD_CHAIN_MAX_EXCURSION_MINUTES",
                    defaults.cold_chain.max_excursion,
                ),
                fail_severity: env_or::<Severity>(
                    "COLD_CHAIN_FAIL_SEVERITY",
                    defaults.cold_chain.fail_severity,
                ),
            },
        }
    }

    /// When institutional escalation becomes due for a request.
    pub fn escalation_at(
        &self,
        urgency: Urgency,
        submitted_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if urgency.is_critical() {
            return submitted_at;
        }
        let budget = (deadline - submitted_at).num_seconds() as f64;
        submitted_at + Duration::seconds((budget * self.escalation_fraction) as i64)
    }

    /// Response deadline for a donor mobilization opened at `now`.
    pub fn donor_respond_by(
        &self,
        urgency: Urgency,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let respond_by = match urgency {
            Urgency::Critical => now + self.critical_donor_window,
            Urgency::High => now + self.high_donor_window,
            Urgency::Medium | Urgency::Low => deadline,
        };
        respond_by.min(deadline)
    }

    /// Sub-deadline for an institution pledge opened at `now`.
    pub fn institution_due_by(&self, now: DateTime<Utc>, deadline: DateTime<Utc>) -> DateTime<Utc> {
        (now + self.institution_window).min(deadline)
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "invalid configuration value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_minutes(key: &str, default: Duration) -> Duration {
    Duration::minutes(env_or(key, default.num_minutes()))
}
