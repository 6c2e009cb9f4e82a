//! Core domain model and counting rules for the Byteon registrant tracker.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "byteon-core";

/// Cadence between observation cycles while nothing is changing.
pub const NORMAL_INTERVAL: Duration = Duration::from_millis(3000);
/// Cadence used right after an observed increase.
pub const QUICK_INTERVAL: Duration = Duration::from_millis(2000);
/// Quick-cadence cycles performed before relaxing back to the normal cadence.
pub const MAX_QUICK_CHECKS: u32 = 2;

/// A record (event, announcement) whose registrant count is read from a CSV export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub id: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub cached_count: Option<u64>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sync_error: Option<String>,
}

impl TrackedEntity {
    pub fn new(id: impl Into<String>, source_url: Option<String>) -> Self {
        Self {
            id: id.into(),
            source_url,
            cached_count: None,
            last_synced_at: None,
            last_sync_error: None,
        }
    }

    /// The configured source, ignoring blank values.
    pub fn source_url(&self) -> Option<&str> {
        self.source_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn tracking_enabled(&self) -> bool {
        self.source_url().is_some()
    }

    pub fn record_success(&mut self, count: u64, at: DateTime<Utc>) {
        self.cached_count = Some(count);
        self.last_synced_at = Some(at);
        self.last_sync_error = None;
    }

    /// Failed attempts keep the previous count.
    pub fn record_failure(&mut self, message: impl Into<String>, at: DateTime<Utc>) {
        self.last_synced_at = Some(at);
        self.last_sync_error = Some(message.into());
    }
}

/// Counts data rows in a CSV export.
///
/// Blank lines are ignored, the first remaining line is treated as the header,
/// and rows made only of commas and whitespace do not count.
pub fn count_rows(text: &str) -> u64 {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    if lines.next().is_none() {
        return 0;
    }
    lines.filter(|line| has_field_content(line)).count() as u64
}

fn has_field_content(line: &str) -> bool {
    line.chars().any(|c| c != ',' && !c.is_whitespace())
}

/// Keeps the larger of the observed and previous counts.
///
/// Display-layer smoothing: a transiently truncated export never makes the
/// shown count go down within a session.
pub fn reconcile(observed: u64, previous: u64) -> u64 {
    if observed > previous {
        observed
    } else {
        previous
    }
}

/// Cadence state of the adaptive poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "phase", rename_all = "kebab-case")]
pub enum PollingPhase {
    #[default]
    Normal,
    QuickConfirm { checks_remaining: u32 },
}

impl PollingPhase {
    /// Phase to use after a cycle on this phase's cadence has committed.
    ///
    /// Increases seen during quick-confirm do not extend it.
    pub fn after_cycle(self, increased: bool, max_quick_checks: u32) -> Self {
        match self {
            PollingPhase::Normal if increased && max_quick_checks > 0 => {
                PollingPhase::QuickConfirm {
                    checks_remaining: max_quick_checks,
                }
            }
            PollingPhase::Normal => PollingPhase::Normal,
            PollingPhase::QuickConfirm { checks_remaining } => {
                match checks_remaining.saturating_sub(1) {
                    0 => PollingPhase::Normal,
                    left => PollingPhase::QuickConfirm {
                        checks_remaining: left,
                    },
                }
            }
        }
    }

    pub fn is_quick(&self) -> bool {
        matches!(self, PollingPhase::QuickConfirm { .. })
    }
}

/// Immutable snapshot of one tracking session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Observation {
    /// Highest count observed this session; `None` until the first success.
    pub live_count: Option<u64>,
    /// Persisted count the session was seeded with. It stays a floor for the
    /// shown count, so a stale or truncated first fetch never lowers it.
    pub fallback_count: Option<u64>,
    pub last_error: Option<String>,
    pub phase: PollingPhase,
    pub cycles: u64,
}

impl Observation {
    pub fn seeded(fallback_count: Option<u64>) -> Self {
        Self {
            fallback_count,
            ..Self::default()
        }
    }

    pub fn displayed_count(&self) -> u64 {
        match (self.live_count, self.fallback_count) {
            (Some(live), Some(fallback)) => reconcile(live, fallback),
            (live, fallback) => live.or(fallback).unwrap_or(0),
        }
    }

    /// Applies a successful count. Returns true when the live count went up
    /// from an existing baseline; the first success only sets the baseline.
    pub fn apply_count(&mut self, observed: u64) -> bool {
        self.cycles += 1;
        self.last_error = None;
        match self.live_count {
            Some(previous) => {
                let next = reconcile(observed, previous);
                self.live_count = Some(next);
                next > previous
            }
            None => {
                self.live_count = Some(observed);
                false
            }
        }
    }

    /// Records a failed cycle without touching the live count.
    pub fn apply_error(&mut self, message: impl Into<String>) {
        self.cycles += 1;
        self.last_error = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_only_and_empty_exports_count_zero() {
        assert_eq!(count_rows(""), 0);
        assert_eq!(count_rows("name,email\n"), 0);
        assert_eq!(count_rows("\n\n  \n"), 0);
    }

    #[test]
    fn data_rows_are_counted_without_header() {
        assert_eq!(count_rows("name,email\nAda,a@x.com\nGrace,g@x.com\n"), 2);
    }

    #[test]
    fn comma_only_rows_are_not_data() {
        assert_eq!(count_rows("name,email\n,,\nAda,a@x.com\n"), 1);
        assert_eq!(count_rows("name,email\n , ,\t\nAda,a@x.com"), 1);
    }

    #[test]
    fn crlf_and_trailing_blank_lines_do_not_inflate() {
        assert_eq!(count_rows("name,email\r\nAda,a@x.com\r\n\r\n\r\n"), 1);
        assert_eq!(count_rows("\n\nname,email\n\nAda,a@x.com\n\n"), 1);
    }

    #[test]
    fn single_populated_field_counts() {
        assert_eq!(count_rows("name,email,team\n,,Rustaceans\nAda,,\n"), 2);
    }

    #[test]
    fn reconcile_never_decreases_and_ends_at_max() {
        let sequences: [&[u64]; 4] = [
            &[3, 1, 4, 1, 5, 9, 2, 6],
            &[10, 9, 8, 7],
            &[0, 0, 0],
            &[1, 2, 3, 2, 1, 7, 7],
        ];
        for seq in sequences {
            let mut shown = 0;
            let mut history = Vec::new();
            for &observed in seq {
                shown = reconcile(observed, shown);
                history.push(shown);
            }
            assert!(history.windows(2).all(|w| w[0] <= w[1]), "{history:?}");
            assert_eq!(shown, *seq.iter().max().unwrap());
        }
    }

    #[test]
    fn reconcile_is_idempotent() {
        for x in [0, 1, 42, u64::MAX] {
            assert_eq!(reconcile(x, x), x);
        }
        assert_eq!(reconcile(4, 7), 7);
        assert_eq!(reconcile(8, 7), 8);
    }

    #[test]
    fn increase_enters_quick_confirm_then_relaxes() {
        let phase = PollingPhase::Normal.after_cycle(false, MAX_QUICK_CHECKS);
        assert_eq!(phase, PollingPhase::Normal);

        let phase = phase.after_cycle(true, MAX_QUICK_CHECKS);
        assert_eq!(phase, PollingPhase::QuickConfirm { checks_remaining: 2 });

        let phase = phase.after_cycle(true, MAX_QUICK_CHECKS);
        assert_eq!(phase, PollingPhase::QuickConfirm { checks_remaining: 1 });

        let phase = phase.after_cycle(false, MAX_QUICK_CHECKS);
        assert_eq!(phase, PollingPhase::Normal);
    }

    #[test]
    fn zero_quick_checks_stays_normal() {
        assert_eq!(PollingPhase::Normal.after_cycle(true, 0), PollingPhase::Normal);
    }

    #[test]
    fn first_success_sets_baseline_without_increase() {
        let mut obs = Observation::seeded(None);
        assert!(!obs.apply_count(5));
        assert_eq!(obs.displayed_count(), 5);
        assert!(!obs.apply_count(3));
        assert_eq!(obs.live_count, Some(5));
        assert!(obs.apply_count(6));
        assert_eq!(obs.displayed_count(), 6);
    }

    #[test]
    fn lower_live_count_never_drops_below_seeded_fallback() {
        let mut obs = Observation::seeded(Some(40));
        assert_eq!(obs.displayed_count(), 40);

        assert!(!obs.apply_count(5));
        assert_eq!(obs.live_count, Some(5));
        assert_eq!(obs.displayed_count(), 40);

        obs.apply_count(41);
        assert_eq!(obs.displayed_count(), 41);
    }

    #[test]
    fn errors_keep_count_and_are_cleared_by_success() {
        let mut obs = Observation::default();
        obs.apply_count(7);
        obs.apply_error("http status 500");
        assert_eq!(obs.live_count, Some(7));
        assert_eq!(obs.last_error.as_deref(), Some("http status 500"));

        obs.apply_count(7);
        assert_eq!(obs.last_error, None);
        assert_eq!(obs.cycles, 3);
    }

    #[test]
    fn entity_failure_keeps_cached_count() {
        let at = DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let mut entity = TrackedEntity::new("hack-day", Some("https://x/export.csv".into()));
        entity.record_success(12, at);
        entity.record_failure("http status 500", at);
        assert_eq!(entity.cached_count, Some(12));
        assert_eq!(entity.last_sync_error.as_deref(), Some("http status 500"));

        entity.record_success(10, at);
        assert_eq!(entity.cached_count, Some(10));
        assert_eq!(entity.last_sync_error, None);
    }

    #[test]
    fn blank_source_disables_tracking() {
        assert!(!TrackedEntity::new("a", Some("   ".into())).tracking_enabled());
        assert!(!TrackedEntity::new("a", None).tracking_enabled());
        assert!(TrackedEntity::new("a", Some("https://x".into())).tracking_enabled());
    }

    #[test]
    fn phase_serializes_as_tagged_union() {
        let json = serde_json::to_value(PollingPhase::QuickConfirm { checks_remaining: 1 })
            .expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({"phase": "quick-confirm", "checks_remaining": 1})
        );
    }
}
