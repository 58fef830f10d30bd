//! Counters for the federation workers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by all federation components.
#[derive(Debug, Default)]
pub struct FederationMetrics {
    reconcile_ticks: AtomicU64,
    registrations: AtomicU64,
    deregistrations: AtomicU64,
    probe_ticks: AtomicU64,
    probes_failed: AtomicU64,
    announcements_created: AtomicU64,
    announcements_updated: AtomicU64,
    announcements_removed: AtomicU64,
    announce_targets_dropped: AtomicU64,
    transit_forwards: AtomicU64,
}

/// Point-in-time copy of [`FederationMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Reconciler ticks run.
    pub reconcile_ticks: u64,
    /// Successful registrations with the registrar.
    pub registrations: u64,
    /// Transitions out of the registered state.
    pub deregistrations: u64,
    /// Liveliness prober ticks run.
    pub probe_ticks: u64,
    /// Descendants pruned after a failed probe.
    pub probes_failed: u64,
    /// Mirrors created on remote nodes.
    pub announcements_created: u64,
    /// Mirrors updated on remote nodes.
    pub announcements_updated: u64,
    /// Mirrors removed (locally forgotten).
    pub announcements_removed: u64,
    /// Announce-to targets dropped as unresolvable or rejected.
    pub announce_targets_dropped: u64,
    /// Requests relayed to other nodes.
    pub transit_forwards: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl FederationMetrics {
            $(
                #[doc = concat!("Increment `", stringify!($field), "`.")]
                pub fn $name(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    inc_reconcile_ticks => reconcile_ticks,
    inc_registrations => registrations,
    inc_deregistrations => deregistrations,
    inc_probe_ticks => probe_ticks,
    inc_probes_failed => probes_failed,
    inc_announcements_created => announcements_created,
    inc_announcements_updated => announcements_updated,
    inc_announcements_removed => announcements_removed,
    inc_announce_targets_dropped => announce_targets_dropped,
    inc_transit_forwards => transit_forwards,
}

impl FederationMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reconcile_ticks: self.reconcile_ticks.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            deregistrations: self.deregistrations.load(Ordering::Relaxed),
            probe_ticks: self.probe_ticks.load(Ordering::Relaxed),
            probes_failed: self.probes_failed.load(Ordering::Relaxed),
            announcements_created: self.announcements_created.load(Ordering::Relaxed),
            announcements_updated: self.announcements_updated.load(Ordering::Relaxed),
            announcements_removed: self.announcements_removed.load(Ordering::Relaxed),
            announce_targets_dropped: self.announce_targets_dropped.load(Ordering::Relaxed),
            transit_forwards: self.transit_forwards.load(Ordering::Relaxed),
        }
    }
}
