//! Readiness markers and timing policy.

use serde::{Deserialize, Serialize};

/// Log lines that signal a phase of a resource's boot.
///
/// Matching is a case-insensitive substring search over the log tail.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadinessMarkers {
    /// The main service accepts traffic.
    pub primary: &'static [&'static str],
    /// The control channel is up. Empty when the kind has none.
    pub control: &'static [&'static str],
    /// A dependency installation began (slow first boot).
    pub install_started: &'static [&'static str],
    /// The installation finished.
    pub install_finished: &'static [&'static str],
}

/// Readiness timing, in checks and milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    /// Log scan period.
    pub log_interval_ms: u64,
    /// Status poll period.
    pub status_interval_ms: u64,
    /// Status checks before giving up.
    pub base_budget: u32,
    /// Budget once a dependency installation is seen.
    pub extended_budget: u32,
    /// Checks after which a running container with a ready primary service
    /// is accepted without its control channel.
    pub degraded_readiness_after_checks: u32,
    /// Log lines fetched per scan.
    pub log_tail: u32,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            log_interval_ms: 2000,
            status_interval_ms: 3000,
            base_budget: 40,
            extended_budget: 240,
            degraded_readiness_after_checks: 15,
            log_tail: 200,
        }
    }
}

/// What one log scan found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogSignals {
    pub primary_ready: bool,
    pub control_ready: bool,
    pub install_started: bool,
    pub install_finished: bool,
}

/// Per-resource readiness rules.
#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    primary: Vec<String>,
    control: Vec<String>,
    install_started: Vec<String>,
    install_finished: Vec<String>,
    pub base_budget: u32,
    pub extended_budget: u32,
    pub degraded_after: u32,
}

fn lowered(markers: &[&str]) -> Vec<String> {
    markers.iter().map(|m| m.to_lowercase()).collect()
}

impl ReadinessPolicy {
    pub fn new(markers: ReadinessMarkers, settings: &ReadinessSettings) -> Self {
        Self {
            primary: lowered(markers.primary),
            control: lowered(markers.control),
            install_started: lowered(markers.install_started),
            install_finished: lowered(markers.install_finished),
            base_budget: settings.base_budget,
            extended_budget: settings.extended_budget.max(settings.base_budget),
            degraded_after: settings.degraded_readiness_after_checks,
        }
    }

    /// Whether the kind has a control channel to wait for.
    pub fn has_control_channel(&self) -> bool {
        !self.control.is_empty()
    }

    /// Scan a log tail for phase markers.
    pub fn scan(&self, logs: &str) -> LogSignals {
        let logs = logs.to_lowercase();
        let any = |markers: &[String]| markers.iter().any(|m| logs.contains(m.as_str()));

        LogSignals {
            primary_ready: any(&self.primary),
            control_ready: any(&self.control),
            install_started: any(&self.install_started),
            install_finished: any(&self.install_finished),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKERS: ReadinessMarkers = ReadinessMarkers {
        primary: &["Server Listening"],
        control: &["control channel ready"],
        install_started: &["npm install"],
        install_finished: &["added packages"],
    };

    #[test]
    fn test_scan_is_case_insensitive() {
        let policy = ReadinessPolicy::new(MARKERS, &ReadinessSettings::default());
        let signals = policy.scan("boot\nSERVER LISTENING on :8080\n");

        assert!(signals.primary_ready);
        assert!(!signals.control_ready);
        assert!(!signals.install_started);
    }

    #[test]
    fn test_scan_install_markers() {
        let policy = ReadinessPolicy::new(MARKERS, &ReadinessSettings::default());
        let signals = policy.scan("running npm install\nadded packages in 3s");

        assert!(signals.install_started);
        assert!(signals.install_finished);
    }

    #[test]
    fn test_extended_budget_never_below_base() {
        let settings = ReadinessSettings {
            base_budget: 50,
            extended_budget: 10,
            ..Default::default()
        };
        let policy = ReadinessPolicy::new(MARKERS, &settings);
        assert_eq!(policy.extended_budget, 50);
        assert!(policy.has_control_channel());
        assert!(!ReadinessPolicy::new(ReadinessMarkers::default(), &settings).has_control_channel());
    }
}
