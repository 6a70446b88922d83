use std::fmt;

use serde::Serialize;

use crate::adapter::SeverityStatistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateVerdict {
    Pass,
    /// Threshold exceeded.
    Fail,
    /// The lifecycle broke off before statistics were available.
    Inconclusive,
}

impl fmt::Display for GateVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateVerdict::Pass => write!(f, "pass"),
            GateVerdict::Fail => write!(f, "fail"),
            GateVerdict::Inconclusive => write!(f, "inconclusive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GatePolicy {
    /// Negative disables the gate entirely.
    pub high_threshold: i64,
    /// Only consulted while the gate is enabled.
    pub medium_threshold: Option<i64>,
}

impl GatePolicy {
    pub fn disabled() -> Self {
        Self {
            high_threshold: -1,
            medium_threshold: None,
        }
    }

    pub fn high(threshold: i64) -> Self {
        Self {
            high_threshold: threshold,
            medium_threshold: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.high_threshold >= 0
    }
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Compare severity counts against the policy.
///
/// Fails only when a count is strictly greater than its threshold.
pub fn evaluate(stats: &SeverityStatistics, policy: &GatePolicy) -> GateVerdict {
    if !policy.is_enabled() {
        return GateVerdict::Pass;
    }
    if exceeds(stats.high, policy.high_threshold) {
        return GateVerdict::Fail;
    }
    match policy.medium_threshold {
        Some(limit) if limit >= 0 && exceeds(stats.medium, limit) => GateVerdict::Fail,
        _ => GateVerdict::Pass,
    }
}

fn exceeds(count: u64, threshold: i64) -> bool {
    // threshold is non-negative here
    count > threshold as u64
}
