//! Escalating reconnect cooldown for protocol abuse (spec §4.G.4). Adapted
//! from the teacher's `CircuitBreaker` idiom (closed/open/half-open) but
//! renamed to the vocabulary of this protocol: a connection identity is
//! either clear, or serving a cooldown whose length escalates per repeat
//! offense.

use crate::constants::ABUSE_COOLDOWNS_SECS;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

struct Offender {
    offense_count: usize,
    cooldown_until: Option<DateTime<Utc>>,
}

/// Tracks abuse offenses per connection identity (agent id, or remote
/// address before identification). Shared across connections via `Arc`.
pub struct AbuseTracker {
    offenders: Mutex<HashMap<String, Offender>>,
}

impl AbuseTracker {
    pub fn new() -> Self {
        AbuseTracker {
            offenders: Mutex::new(HashMap::new()),
        }
    }

    /// `None` if the identity may connect now; `Some(seconds remaining)`
    /// otherwise.
    pub fn cooldown_remaining(&self, identity: &str) -> Option<i64> {
        let offenders = self.offenders.lock().unwrap();
        let offender = offenders.get(identity)?;
        let until = offender.cooldown_until?;
        let remaining = until.signed_duration_since(Utc::now()).num_seconds();
        if remaining > 0 {
            Some(remaining)
        } else {
            None
        }
    }

    /// Records a fresh abuse trip (the validation-failure threshold was hit
    /// within the window) and arms the next escalation tier of cooldown.
    pub fn record_offense(&self, identity: &str) {
        let mut offenders = self.offenders.lock().unwrap();
        let offender = offenders.entry(identity.to_string()).or_insert(Offender {
            offense_count: 0,
            cooldown_until: None,
        });
        let tier = offender.offense_count.min(ABUSE_COOLDOWNS_SECS.len() - 1);
        let cooldown_secs = ABUSE_COOLDOWNS_SECS[tier];
        offender.offense_count += 1;
        offender.cooldown_until = Some(Utc::now() + chrono::Duration::seconds(cooldown_secs as i64));
    }
}

impl Default for AbuseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_offense_imposes_shortest_cooldown() {
        let tracker = AbuseTracker::new();
        tracker.record_offense("agent-1");
        let remaining = tracker.cooldown_remaining("agent-1").unwrap();
        assert!(remaining <= ABUSE_COOLDOWNS_SECS[0] as i64);
        assert!(remaining > 0);
    }

    #[test]
    fn repeated_offenses_escalate() {
        let tracker = AbuseTracker::new();
        tracker.record_offense("agent-1");
        tracker.record_offense("agent-1");
        let remaining = tracker.cooldown_remaining("agent-1").unwrap();
        assert!(remaining > ABUSE_COOLDOWNS_SECS[0] as i64);
    }

    #[test]
    fn unknown_identity_has_no_cooldown() {
        let tracker = AbuseTracker::new();
        assert_eq!(tracker.cooldown_remaining("never-seen"), None);
    }
}
