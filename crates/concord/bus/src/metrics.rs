use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters maintained by the bus.
#[derive(Debug, Default)]
pub struct BusMetrics {
    sent: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    routing_failures: AtomicU64,
    handler_failures: AtomicU64,
    handler_timeouts: AtomicU64,
    handler_panics: AtomicU64,
    inbound_dropped: AtomicU64,
    retries_scheduled: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl BusMetrics {
    counter! {
        record_sent => sent,
        record_accepted => accepted,
        record_rejected => rejected,
        record_delivered => delivered,
        record_routing_failure => routing_failures,
        record_handler_failure => handler_failures,
        record_handler_timeout => handler_timeouts,
        record_handler_panic => handler_panics,
        record_inbound_dropped => inbound_dropped,
        record_retry_scheduled => retries_scheduled,
    }

    pub(crate) fn snapshot(&self, registered_agents: usize, audit_dropped: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            routing_failures: self.routing_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            handler_timeouts: self.handler_timeouts.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            audit_dropped,
            registered_agents,
        }
    }
}

/// Point-in-time copy of the bus counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Messages submitted to `send` or `broadcast` (one per copy).
    pub sent: u64,
    /// Passed validation.
    pub accepted: u64,
    /// Refused by validation.
    pub rejected: u64,
    /// Validated and routed to at least the inbound queue.
    pub delivered: u64,
    pub routing_failures: u64,
    /// Handler invocations that failed for any reason, timeouts and panics included.
    pub handler_failures: u64,
    pub handler_timeouts: u64,
    pub handler_panics: u64,
    pub inbound_dropped: u64,
    pub retries_scheduled: u64,
    pub audit_dropped: u64,
    pub registered_agents: usize,
}
