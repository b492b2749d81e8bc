//! Outage tracking for pollers that must ride out unreachability
//!
//! The tracker measures how long an endpoint has been failing without a
//! single success in between. Transient failures are tolerated until that
//! continuous window reaches the ceiling; any success closes the window.
//! States:
//! - Healthy: no failure since the last success
//! - Failing: failing continuously since `since`

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// State of the tracked endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutageState {
    Healthy,
    Failing { since: Instant, failures: usize },
}

/// Configuration for outage tolerance
#[derive(Debug, Clone)]
pub struct OutageConfig {
    /// Longest continuous failure window tolerated
    pub ceiling: Duration,
}

impl Default for OutageConfig {
    fn default() -> Self {
        Self {
            ceiling: Duration::from_secs(15 * 60),
        }
    }
}

/// What the caller should do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry { elapsed: Duration, failures: usize },
    GiveUp { elapsed: Duration, failures: usize },
}

/// Tracks a continuous failure window against a ceiling
///
/// # Example
/// ```no_run
/// use virtmgmt_core_resilience::{OutageConfig, OutageTracker, Verdict};
///
/// # async fn example() {
/// let tracker = OutageTracker::new(OutageConfig::default());
/// // the host did not answer this poll
/// if let Verdict::GiveUp { elapsed, .. } = tracker.record_failure().await {
///     println!("unreachable for {:?}", elapsed);
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct OutageTracker {
    config: Arc<OutageConfig>,
    state: Arc<Mutex<OutageState>>,
}

impl OutageTracker {
    pub fn new(config: OutageConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(OutageState::Healthy)),
        }
    }

    pub async fn state(&self) -> OutageState {
        *self.state.lock().await
    }

    /// Length of the current failure window (zero when healthy)
    pub async fn elapsed(&self) -> Duration {
        match *self.state.lock().await {
            OutageState::Healthy => Duration::ZERO,
            OutageState::Failing { since, .. } => since.elapsed(),
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        if let OutageState::Failing { failures, .. } = *state {
            tracing::debug!("Endpoint reachable again after {} failed attempts", failures);
        }
        *state = OutageState::Healthy;
    }

    /// Record a transient failure and decide whether to keep trying
    pub async fn record_failure(&self) -> Verdict {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let (since, failures) = match *state {
            OutageState::Healthy => (now, 1),
            OutageState::Failing { since, failures } => (since, failures + 1),
        };
        *state = OutageState::Failing { since, failures };

        let elapsed = now.duration_since(since);
        if elapsed >= self.config.ceiling {
            Verdict::GiveUp { elapsed, failures }
        } else {
            Verdict::Retry { elapsed, failures }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(ceiling_secs: u64) -> OutageTracker {
        OutageTracker::new(OutageConfig {
            ceiling: Duration::from_secs(ceiling_secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_starts_at_first_failure() {
        let tracker = tracker(60);
        assert_eq!(tracker.state().await, OutageState::Healthy);

        assert!(matches!(
            tracker.record_failure().await,
            Verdict::Retry { failures: 1, .. }
        ));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(
            tracker.record_failure().await,
            Verdict::Retry { failures: 2, .. }
        ));
        assert_eq!(tracker.elapsed().await, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(
            tracker.record_failure().await,
            Verdict::GiveUp { failures: 3, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_closes_window() {
        let tracker = tracker(60);
        tracker.record_failure().await;
        tokio::time::advance(Duration::from_secs(59)).await;
        tracker.record_success().await;
        assert_eq!(tracker.elapsed().await, Duration::ZERO);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(matches!(
            tracker.record_failure().await,
            Verdict::Retry { failures: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_once_window_reaches_ceiling() {
        let tracker = tracker(10);
        for _ in 0..4 {
            assert!(matches!(tracker.record_failure().await, Verdict::Retry { .. }));
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            tracker.record_failure().await,
            Verdict::GiveUp {
                elapsed: Duration::from_secs(10),
                failures: 5
            }
        );
    }
}
