use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::errors::DownloadError;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Proof that a caller may make one upstream request right now.
#[derive(Debug)]
pub struct Permit(());

/// Process-wide guard in front of the extraction engine. Upstream
/// punishes burst traffic with bot-detection throttling that degrades
/// service for everyone, so every engine call must pass `admit()`
/// first: a rolling admission window, plus an escalating cooldown that
/// doubles after each consecutive throttle signal.
///
/// The clock is a parameter of the internal methods so tests drive a
/// fake timeline.
pub struct RateGovernor {
    max_admissions: usize,
    window: Duration,
    state: Mutex<GovernorState>,
}

struct GovernorState {
    admissions: VecDeque<Instant>,
    consecutive_throttles: u32,
    cooldown_until: Option<Instant>,
}

/// Counters for the diagnostics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GovernorSnapshot {
    pub admissions_in_window: usize,
    pub max_admissions: usize,
    pub window_secs: u64,
    pub consecutive_throttles: u32,
    pub cooldown_remaining_secs: Option<u64>,
}

impl RateGovernor {
    pub fn new(max_admissions: usize, window: Duration) -> Self {
        Self {
            max_admissions,
            window,
            state: Mutex::new(GovernorState {
                admissions: VecDeque::new(),
                consecutive_throttles: 0,
                cooldown_until: None,
            }),
        }
    }

    /// Admit one upstream request or deny with a retry hint. Denials
    /// surface immediately; nothing queues here.
    pub fn admit(&self) -> Result<Permit, DownloadError> {
        self.admit_at(Instant::now())
    }

    pub fn admit_at(&self, now: Instant) -> Result<Permit, DownloadError> {
        let mut state = self.state.lock();

        if let Some(until) = state.cooldown_until {
            if until > now {
                return Err(DownloadError::UpstreamThrottled {
                    retry_after: secs_ceil(until - now),
                });
            }
            state.cooldown_until = None;
        }

        while let Some(&oldest) = state.admissions.front() {
            if oldest + self.window <= now {
                state.admissions.pop_front();
            } else {
                break;
            }
        }

        if state.admissions.len() >= self.max_admissions {
            // Oldest admission rolling out of the window frees a slot.
            let retry_after = state
                .admissions
                .front()
                .map(|&oldest| secs_ceil(oldest + self.window - now))
                .unwrap_or(1);
            return Err(DownloadError::UpstreamThrottled { retry_after });
        }

        state.admissions.push_back(now);
        Ok(Permit(()))
    }

    /// Engine reported a throttle response; escalate the cooldown. The
    /// upstream hint wins when it asks for longer than our ladder.
    pub fn record_throttled(&self, upstream_hint: Option<Duration>) -> Duration {
        self.record_throttled_at(Instant::now(), upstream_hint)
    }

    pub fn record_throttled_at(&self, now: Instant, upstream_hint: Option<Duration>) -> Duration {
        let mut state = self.state.lock();
        state.consecutive_throttles += 1;
        let ladder = INITIAL_BACKOFF
            .checked_mul(1u32 << (state.consecutive_throttles - 1).min(16))
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF);
        let backoff = upstream_hint.map_or(ladder, |hint| hint.max(ladder));
        state.cooldown_until = Some(now + backoff);
        log::warn!(
            "Upstream throttled ({} consecutive), backing off for {:?}",
            state.consecutive_throttles,
            backoff
        );
        backoff
    }

    /// A successful upstream call resets the ladder.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_throttles = 0;
        state.cooldown_until = None;
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> GovernorSnapshot {
        let state = self.state.lock();
        let in_window = state
            .admissions
            .iter()
            .filter(|&&t| t + self.window > now)
            .count();
        GovernorSnapshot {
            admissions_in_window: in_window,
            max_admissions: self.max_admissions,
            window_secs: self.window.as_secs(),
            consecutive_throttles: state.consecutive_throttles,
            cooldown_remaining_secs: state
                .cooldown_until
                .filter(|&until| until > now)
                .map(|until| secs_ceil(until - now)),
        }
    }
}

fn secs_ceil(d: Duration) -> u64 {
    (d.as_millis() as u64).div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(max: usize, window_secs: u64) -> RateGovernor {
        RateGovernor::new(max, Duration::from_secs(window_secs))
    }

    #[test]
    fn test_admissions_within_budget() {
        let gov = governor(3, 300);
        let t0 = Instant::now();
        assert!(gov.admit_at(t0).is_ok());
        assert!(gov.admit_at(t0 + Duration::from_secs(1)).is_ok());
        assert!(gov.admit_at(t0 + Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_denial_when_window_is_full() {
        let gov = governor(2, 300);
        let t0 = Instant::now();
        gov.admit_at(t0).unwrap();
        gov.admit_at(t0 + Duration::from_secs(10)).unwrap();

        let denied = gov.admit_at(t0 + Duration::from_secs(20)).unwrap_err();
        match denied {
            DownloadError::UpstreamThrottled { retry_after } => {
                // Oldest admission leaves the window at t0+300.
                assert_eq!(retry_after, 280);
            }
            other => panic!("expected throttled, got {:?}", other),
        }
    }

    #[test]
    fn test_window_rolls_over() {
        let gov = governor(1, 300);
        let t0 = Instant::now();
        gov.admit_at(t0).unwrap();
        assert!(gov.admit_at(t0 + Duration::from_secs(10)).is_err());
        assert!(gov.admit_at(t0 + Duration::from_secs(301)).is_ok());
    }

    #[test]
    fn test_backoff_escalates_on_consecutive_throttles() {
        let gov = governor(10, 300);
        let t0 = Instant::now();
        let first = gov.record_throttled_at(t0, None);
        let second = gov.record_throttled_at(t0 + Duration::from_secs(2), None);
        assert!(second > first);
        assert_eq!(first, Duration::from_secs(1));
        assert_eq!(second, Duration::from_secs(2));
    }

    #[test]
    fn test_cooldown_blocks_admissions() {
        let gov = governor(10, 300);
        let t0 = Instant::now();
        gov.record_throttled_at(t0, Some(Duration::from_secs(60)));

        let denied = gov.admit_at(t0 + Duration::from_secs(30)).unwrap_err();
        assert_eq!(denied, DownloadError::UpstreamThrottled { retry_after: 30 });

        assert!(gov.admit_at(t0 + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn test_upstream_hint_wins_when_longer() {
        let gov = governor(10, 300);
        let t0 = Instant::now();
        let backoff = gov.record_throttled_at(t0, Some(Duration::from_secs(120)));
        assert_eq!(backoff, Duration::from_secs(120));
    }

    #[test]
    fn test_success_resets_ladder() {
        let gov = governor(10, 300);
        let t0 = Instant::now();
        gov.record_throttled_at(t0, None);
        gov.record_throttled_at(t0, None);
        gov.record_success();
        let again = gov.record_throttled_at(t0 + Duration::from_secs(1), None);
        assert_eq!(again, Duration::from_secs(1));
        assert!(gov.admit_at(t0 + Duration::from_secs(3)).is_ok());
    }

    #[test]
    fn test_snapshot_counters() {
        let gov = governor(5, 300);
        let t0 = Instant::now();
        gov.admit_at(t0).unwrap();
        gov.admit_at(t0).unwrap();
        let snap = gov.snapshot_at(t0 + Duration::from_secs(1));
        assert_eq!(snap.admissions_in_window, 2);
        assert_eq!(snap.max_admissions, 5);
        assert_eq!(snap.cooldown_remaining_secs, None);
    }
}
