//! Bookkeeping for pending pre-warm timers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use ember_core::ids::SessionId;

/// A scheduled pre-warm that has not fired yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PrewarmInfo {
    pub session_id: SessionId,
    pub scheduled_time: DateTime<Utc>,
    /// When the worker job will be submitted.
    pub fire_at: DateTime<Utc>,
}

pub(crate) struct PendingPrewarm {
    /// Distinguishes a timer from the one that replaced it.
    pub generation: u64,
    pub cancel: CancellationToken,
    pub info: PrewarmInfo,
}

/// Pending timers keyed by session id. At most one per session.
#[derive(Default)]
pub(crate) struct PrewarmTimers {
    pending: DashMap<SessionId, PendingPrewarm>,
}

impl PrewarmTimers {
    /// Register a timer, cancelling any earlier one for the same session.
    pub fn register(&self, pending: PendingPrewarm) {
        let session_id = pending.info.session_id.clone();
        if let Some(previous) = self.pending.insert(session_id, pending) {
            previous.cancel.cancel();
        }
    }

    /// Whether `generation` is still the pending timer for the session.
    pub fn is_current(&self, session_id: &SessionId, generation: u64) -> bool {
        self.pending
            .get(session_id)
            .is_some_and(|p| p.generation == generation)
    }

    /// Remove the entry of a fired timer unless it was replaced meanwhile.
    pub fn claim(&self, session_id: &SessionId, generation: u64) -> bool {
        self.pending
            .remove_if(session_id, |_, p| p.generation == generation)
            .is_some()
    }

    pub fn cancel(&self, session_id: &SessionId) -> bool {
        match self.pending.remove(session_id) {
            Some((_, pending)) => {
                pending.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<SessionId> = self.pending.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn list(&self) -> Vec<PrewarmInfo> {
        let mut infos: Vec<PrewarmInfo> = self.pending.iter().map(|e| e.info.clone()).collect();
        infos.sort_by(|a, b| a.fire_at.cmp(&b.fire_at));
        infos
    }
}

/// `scheduled - lead`, and how long from now until then (zero when already
/// past).
pub(crate) fn fire_time(
    scheduled: DateTime<Utc>,
    lead: Duration,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, Duration) {
    let fire_at = chrono::Duration::from_std(lead)
        .ok()
        .and_then(|lead| scheduled.checked_sub_signed(lead))
        .unwrap_or(now);
    let delay = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
    (fire_at, delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: &str, generation: u64) -> PendingPrewarm {
        let now = Utc::now();
        PendingPrewarm {
            generation,
            cancel: CancellationToken::new(),
            info: PrewarmInfo {
                session_id: SessionId::from_raw(id),
                scheduled_time: now,
                fire_at: now,
            },
        }
    }

    #[test]
    fn fire_time_subtracts_lead() {
        let now = Utc::now();
        let scheduled = now + chrono::Duration::minutes(10);
        let (fire_at, delay) = fire_time(scheduled, Duration::from_secs(150), now);
        assert_eq!(fire_at, scheduled - chrono::Duration::seconds(150));
        assert_eq!(delay, Duration::from_secs(450));
    }

    #[test]
    fn past_fire_time_has_zero_delay() {
        let now = Utc::now();
        let scheduled = now + chrono::Duration::seconds(30);
        let (fire_at, delay) = fire_time(scheduled, Duration::from_secs(150), now);
        assert!(fire_at < now);
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn replacing_cancels_previous_timer() {
        let timers = PrewarmTimers::default();
        let first = pending("s1", 1);
        let first_token = first.cancel.clone();
        timers.register(first);
        timers.register(pending("s1", 2));

        assert!(first_token.is_cancelled());
        assert!(!timers.is_current(&SessionId::from_raw("s1"), 1));
        assert!(timers.is_current(&SessionId::from_raw("s1"), 2));
        assert!(!timers.claim(&SessionId::from_raw("s1"), 1));
        assert!(timers.claim(&SessionId::from_raw("s1"), 2));
        assert!(timers.list().is_empty());
    }

    #[test]
    fn cancel_all_counts() {
        let timers = PrewarmTimers::default();
        timers.register(pending("a", 1));
        timers.register(pending("b", 2));
        assert_eq!(timers.cancel_all(), 2);
        assert!(!timers.cancel(&SessionId::from_raw("a")));
    }
}
