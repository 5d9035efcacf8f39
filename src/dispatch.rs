//! Fan-out dispatcher.
//!
//! Consumes the delta stream and routes each delta through the per-session
//! gates: token bucket, pacing interval, then subscription coverage and
//! predicate. Hand-off to the transport is non-blocking; a full queue drops
//! the delta for that session only. Per-(session, instrument) ordering
//! follows from the single dispatcher task feeding FIFO session queues.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::app::ServiceStats;
use crate::delta::Delta;
use crate::instruments::store::InstrumentStore;
use crate::models::ServerMessage;
use crate::subscriptions::{DeliveryOutcome, SubscriberRegistry};

pub struct Dispatcher {
    store: Arc<InstrumentStore>,
    registry: Arc<SubscriberRegistry>,
    stats: Arc<ServiceStats>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<InstrumentStore>,
        registry: Arc<SubscriberRegistry>,
        stats: Arc<ServiceStats>,
    ) -> Self {
        Self {
            store,
            registry,
            stats,
        }
    }

    /// Route deltas until every producer is gone or shutdown is signalled;
    /// on shutdown, anything already queued is drained best-effort first.
    pub async fn run(self, mut deltas: mpsc::Receiver<Delta>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                delta = deltas.recv() => match delta {
                    Some(delta) => self.dispatch(&delta),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        while let Ok(delta) = deltas.try_recv() {
                            self.dispatch(&delta);
                        }
                        break;
                    }
                }
            }
        }
        debug!("dispatcher stopped");
    }

    pub fn dispatch(&self, delta: &Delta) {
        // Current snapshot for predicate evaluation; the instrument may have
        // been removed since emission.
        let Some(snapshot) = self.store.get(&delta.instrument_id) else {
            return;
        };
        let fields = snapshot.field_map();

        for session in self.registry.lookup_interested(&delta.instrument_id) {
            if !self.registry.admit(&session, &delta.instrument_id) {
                self.stats.bump_rate_limited();
                continue;
            }
            if !self
                .registry
                .matches_subscription(&session, &delta.instrument_id, &fields)
            {
                continue;
            }
            let message = ServerMessage::InstrumentUpdate(delta.clone());
            match self.registry.try_deliver(&session, message) {
                DeliveryOutcome::Delivered => {
                    self.registry.record_sent(&session, &delta.instrument_id);
                    self.stats.bump_delivered();
                }
                DeliveryOutcome::QueueFull => {
                    trace!(%session, instrument = %delta.instrument_id, "send queue full; delta dropped");
                    self.stats.bump_queue_full();
                }
                DeliveryOutcome::Gone => {}
            }
        }
    }
}
