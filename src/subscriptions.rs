//! Subscriber registry: sessions, subscriptions, and rate budgets.
//!
//! The registry owns every session's token bucket and last-sent map; session
//! tasks and the dispatcher mutate them only through registry operations.
//! Admission consumes a token first, then checks the per-instrument pacing
//! interval. A pacing skip does not refund the token.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::CoreError;
use crate::filter::Predicate;
use crate::instruments::FieldMap;
use crate::models::ServerMessage;

pub type SessionId = Uuid;

/// One subscriber interest set.
#[derive(Debug)]
pub struct Subscription {
    /// Ordered, deduplicated, non-empty.
    pub instrument_ids: Vec<String>,
    pub predicate: Option<Predicate>,
    /// Desired updates per second; server default when `None`.
    pub update_frequency: Option<f64>,
}

impl Subscription {
    pub fn new(
        instrument_ids: Vec<String>,
        predicate: Option<Predicate>,
        update_frequency: Option<f64>,
    ) -> Result<Self, CoreError> {
        if instrument_ids.is_empty() {
            return Err(CoreError::invalid("instrumentIds must not be empty"));
        }
        if let Some(f) = update_frequency {
            if !f.is_finite() || f <= 0.0 {
                return Err(CoreError::invalid("updateFrequency must be positive"));
            }
        }
        let mut seen = std::collections::HashSet::new();
        let instrument_ids = instrument_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        Ok(Self {
            instrument_ids,
            predicate,
            update_frequency,
        })
    }

    fn covers(&self, instrument_id: &str) -> bool {
        self.instrument_ids.iter().any(|id| id == instrument_id)
    }
}

/// Continuous-refill token bucket. Refill is computed lazily from elapsed
/// wall time on each admission check and clamped to capacity.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    level: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            level: capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.level = (self.level + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Admit iff at least one token is present, consuming it.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.level >= 1.0 {
            self.level -= 1.0;
            true
        } else {
            false
        }
    }

    /// Change capacity and refill rate, preserving the current level and
    /// crediting any capacity increase.
    pub fn reconfigure(&mut self, capacity: f64, refill_rate: f64) {
        if capacity > self.capacity {
            self.level += capacity - self.capacity;
        }
        self.capacity = capacity;
        self.level = self.level.min(capacity);
        self.refill_rate = refill_rate;
    }

    pub fn level(&self) -> f64 {
        self.level
    }
}

struct SessionEntry {
    outbound: mpsc::Sender<ServerMessage>,
    subscriptions: HashMap<String, Subscription>,
    bucket: TokenBucket,
    last_sent: HashMap<String, Instant>,
}

/// Outcome of a non-blocking hand-off to a session's transport queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Send queue full; treated like a pacing skip.
    QueueFull,
    /// Session disconnected.
    Gone,
}

pub struct SubscriberRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    default_updates_per_second: f64,
    bucket_size: f64,
}

impl SubscriberRegistry {
    pub fn new(default_updates_per_second: f64, bucket_size: f64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            default_updates_per_second,
            bucket_size,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_updates_per_second, config.bucket_size)
    }

    pub fn register(&self, session: SessionId, outbound: mpsc::Sender<ServerMessage>) {
        self.sessions.write().insert(
            session,
            SessionEntry {
                outbound,
                subscriptions: HashMap::new(),
                bucket: TokenBucket::new(self.bucket_size, self.default_updates_per_second),
                last_sent: HashMap::new(),
            },
        );
    }

    /// Detach a session; its bucket and last-sent map die with it.
    pub fn unregister(&self, session: &SessionId) {
        self.sessions.write().remove(session);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .map(|entry| entry.subscriptions.len())
            .sum()
    }

    pub fn add_subscription(
        &self,
        session: &SessionId,
        subscription_id: String,
        subscription: Subscription,
    ) -> Result<(), CoreError> {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .get_mut(session)
            .ok_or_else(|| CoreError::not_found(format!("session {session}")))?;
        entry.subscriptions.insert(subscription_id, subscription);
        Ok(())
    }

    pub fn remove_subscription(
        &self,
        session: &SessionId,
        subscription_id: &str,
    ) -> Result<(), CoreError> {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .get_mut(session)
            .ok_or_else(|| CoreError::not_found(format!("session {session}")))?;
        entry
            .subscriptions
            .remove(subscription_id)
            .map(|_| ())
            .ok_or_else(|| CoreError::not_found(format!("subscription {subscription_id}")))
    }

    /// Sessions with at least one subscription covering this instrument.
    pub fn lookup_interested(&self, instrument_id: &str) -> Vec<SessionId> {
        self.sessions
            .read()
            .iter()
            .filter(|(_, entry)| {
                entry
                    .subscriptions
                    .values()
                    .any(|sub| sub.covers(instrument_id))
            })
            .map(|(session, _)| *session)
            .collect()
    }

    /// Rate-budget gate: token bucket first, then the per-instrument pacing
    /// interval. Consumes one token when the bucket admits, even if pacing
    /// subsequently skips.
    pub fn admit(&self, session: &SessionId, instrument_id: &str) -> bool {
        let mut sessions = self.sessions.write();
        let Some(entry) = sessions.get_mut(session) else {
            return false;
        };
        let now = Instant::now();
        if !entry.bucket.try_consume(now) {
            return false;
        }
        let interval = self.pacing_interval(entry, instrument_id);
        match entry.last_sent.get(instrument_id) {
            Some(last) if now.saturating_duration_since(*last) < interval => false,
            _ => true,
        }
    }

    /// Does any of the session's subscriptions cover this instrument with a
    /// passing predicate? Predicate errors count as non-match.
    pub fn matches_subscription(
        &self,
        session: &SessionId,
        instrument_id: &str,
        fields: &FieldMap,
    ) -> bool {
        let sessions = self.sessions.read();
        let Some(entry) = sessions.get(session) else {
            return false;
        };
        entry.subscriptions.values().any(|sub| {
            sub.covers(instrument_id)
                && sub
                    .predicate
                    .as_ref()
                    .map_or(true, |predicate| predicate.matches(fields))
        })
    }

    pub fn record_sent(&self, session: &SessionId, instrument_id: &str) {
        if let Some(entry) = self.sessions.write().get_mut(session) {
            entry
                .last_sent
                .insert(instrument_id.to_string(), Instant::now());
        }
    }

    /// Non-blocking hand-off to the session's transport queue. The sender is
    /// cloned out of the lock so a full queue never stalls other sessions.
    pub fn try_deliver(&self, session: &SessionId, message: ServerMessage) -> DeliveryOutcome {
        let outbound = {
            let sessions = self.sessions.read();
            match sessions.get(session) {
                Some(entry) => entry.outbound.clone(),
                None => return DeliveryOutcome::Gone,
            }
        };
        match outbound.try_send(message) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => DeliveryOutcome::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => DeliveryOutcome::Gone,
        }
    }

    /// Minimum inter-update interval for a (session, instrument) pair: the
    /// fastest frequency across the session's covering subscriptions, or
    /// the server default when none specifies one.
    fn pacing_interval(&self, entry: &SessionEntry, instrument_id: &str) -> Duration {
        let fastest = entry
            .subscriptions
            .values()
            .filter(|sub| sub.covers(instrument_id))
            .filter_map(|sub| sub.update_frequency)
            .fold(None::<f64>, |acc, f| {
                Some(acc.map_or(f, |current| current.max(f)))
            });
        let frequency = fastest.unwrap_or(self.default_updates_per_second);
        Duration::from_secs_f64(1.0 / frequency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::Sender<ServerMessage>, mpsc::Receiver<ServerMessage>) {
        mpsc::channel(8)
    }

    #[test]
    fn test_bucket_consumes_and_refuses_when_empty() {
        let mut bucket = TokenBucket::new(2.0, 10.0);
        let now = Instant::now();
        assert!(bucket.try_consume(now));
        assert!(bucket.try_consume(now));
        assert!(!bucket.try_consume(now));
    }

    #[test]
    fn test_bucket_refills_continuously_and_clamps() {
        let mut bucket = TokenBucket::new(5.0, 10.0);
        let start = Instant::now();
        for _ in 0..5 {
            assert!(bucket.try_consume(start));
        }
        // 250ms at 10 tokens/s refills 2.5 tokens.
        let later = start + Duration::from_millis(250);
        assert!(bucket.try_consume(later));
        assert!(bucket.try_consume(later));
        assert!(!bucket.try_consume(later));
        // A long idle period clamps at capacity, not beyond.
        let much_later = later + Duration::from_secs(3600);
        bucket.refill(much_later);
        assert_eq!(bucket.level(), 5.0);
    }

    #[test]
    fn test_bucket_reconfigure_preserves_level() {
        let mut bucket = TokenBucket::new(10.0, 5.0);
        let now = Instant::now();
        for _ in 0..6 {
            assert!(bucket.try_consume(now));
        }
        assert_eq!(bucket.level(), 4.0);
        // Capacity increase credits the delta.
        bucket.reconfigure(15.0, 5.0);
        assert_eq!(bucket.level(), 9.0);
        // Capacity decrease clamps but never credits.
        bucket.reconfigure(6.0, 5.0);
        assert_eq!(bucket.level(), 6.0);
    }

    #[test]
    fn test_subscription_validation() {
        assert!(Subscription::new(vec![], None, None).is_err());
        assert!(Subscription::new(vec!["US10Y".into()], None, Some(0.0)).is_err());
        assert!(Subscription::new(vec!["US10Y".into()], None, Some(-3.0)).is_err());
        let sub = Subscription::new(
            vec!["US10Y".into(), "US2Y".into(), "US10Y".into()],
            None,
            Some(5.0),
        )
        .unwrap();
        assert_eq!(sub.instrument_ids, vec!["US10Y", "US2Y"]);
    }

    #[test]
    fn test_lookup_interested_spans_subscriptions() {
        let registry = SubscriberRegistry::new(10.0, 20.0);
        let (tx_a, _rx_a) = channel();
        let (tx_b, _rx_b) = channel();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.register(a, tx_a);
        registry.register(b, tx_b);
        registry
            .add_subscription(
                &a,
                "s1".into(),
                Subscription::new(vec!["US10Y".into()], None, None).unwrap(),
            )
            .unwrap();
        registry
            .add_subscription(
                &b,
                "s2".into(),
                Subscription::new(vec!["ZN-U25".into()], None, None).unwrap(),
            )
            .unwrap();

        let interested = registry.lookup_interested("US10Y");
        assert_eq!(interested, vec![a]);
        assert!(registry.lookup_interested("GILT-30").is_empty());

        registry.remove_subscription(&a, "s1").unwrap();
        assert!(registry.lookup_interested("US10Y").is_empty());
        assert_eq!(
            registry.remove_subscription(&a, "s1").unwrap_err().kind(),
            "not_found"
        );
    }

    #[test]
    fn test_admit_exhausts_bucket() {
        let registry = SubscriberRegistry::new(1000.0, 3.0);
        let (tx, _rx) = channel();
        let session = Uuid::new_v4();
        registry.register(session, tx);
        // No pacing pressure (1000/s default); bucket of 3 admits 3.
        assert!(registry.admit(&session, "US10Y"));
        assert!(registry.admit(&session, "US10Y"));
        assert!(registry.admit(&session, "US10Y"));
        assert!(!registry.admit(&session, "US10Y"));
    }

    #[test]
    fn test_pacing_interval_blocks_rapid_repeats() {
        let registry = SubscriberRegistry::new(2.0, 100.0);
        let (tx, _rx) = channel();
        let session = Uuid::new_v4();
        registry.register(session, tx);
        assert!(registry.admit(&session, "US10Y"));
        registry.record_sent(&session, "US10Y");
        // 2/s default: 500ms interval; immediate retry is paced out.
        assert!(!registry.admit(&session, "US10Y"));
        // Other instruments are paced independently.
        assert!(registry.admit(&session, "US2Y"));
    }

    #[test]
    fn test_subscription_frequency_overrides_default() {
        let registry = SubscriberRegistry::new(1.0, 100.0);
        let (tx, _rx) = channel();
        let session = Uuid::new_v4();
        registry.register(session, tx);
        registry
            .add_subscription(
                &session,
                "fast".into(),
                Subscription::new(vec!["US10Y".into()], None, Some(1000.0)).unwrap(),
            )
            .unwrap();
        assert!(registry.admit(&session, "US10Y"));
        registry.record_sent(&session, "US10Y");
        // 1000/s subscription frequency: 1ms interval beats the 1/s default.
        std::thread::sleep(Duration::from_millis(5));
        assert!(registry.admit(&session, "US10Y"));
    }

    #[test]
    fn test_matches_subscription_with_predicate() {
        let registry = SubscriberRegistry::new(10.0, 20.0);
        let (tx, _rx) = channel();
        let session = Uuid::new_v4();
        registry.register(session, tx);
        let predicate = crate::filter::Predicate::parse(&serde_json::json!({
            "==": [{ "var": "securityType" }, "Bond"]
        }))
        .unwrap();
        registry
            .add_subscription(
                &session,
                "s1".into(),
                Subscription::new(vec!["US10Y".into(), "ZN-U25".into()], Some(predicate), None)
                    .unwrap(),
            )
            .unwrap();

        let bond = crate::instruments::seed::treasury_bond("US10Y", "US Treasury 10Y", 98.5, 4.2);
        let future = crate::instruments::seed::bond_future("ZN-U25", "10Y Note Future", 111.5, "SEP25");
        assert!(registry.matches_subscription(&session, "US10Y", &bond.field_map()));
        assert!(!registry.matches_subscription(&session, "ZN-U25", &future.field_map()));
        assert!(!registry.matches_subscription(&session, "US30Y", &bond.field_map()));
    }

    #[test]
    fn test_try_deliver_reports_queue_state() {
        let registry = SubscriberRegistry::new(10.0, 20.0);
        let (tx, mut rx) = mpsc::channel(1);
        let session = Uuid::new_v4();
        registry.register(session, tx);

        assert_eq!(
            registry.try_deliver(&session, ServerMessage::Pong),
            DeliveryOutcome::Delivered
        );
        assert_eq!(
            registry.try_deliver(&session, ServerMessage::Pong),
            DeliveryOutcome::QueueFull
        );
        rx.close();
        assert_eq!(
            registry.try_deliver(&session, ServerMessage::Pong),
            DeliveryOutcome::Gone
        );

        registry.unregister(&session);
        assert_eq!(
            registry.try_deliver(&session, ServerMessage::Pong),
            DeliveryOutcome::Gone
        );
        assert_eq!(registry.session_count(), 0);
    }
}
