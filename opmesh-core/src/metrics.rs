//! Metrics for the replication core.

use iroh_metrics::{
    core::{Counter, Metric},
    struct_iterable::Iterable,
};

/// Counters for the replication core.
#[allow(missing_docs)]
#[derive(Debug, Clone, Iterable)]
pub struct Metrics {
    pub oplogs_local: Counter,
    pub oplogs_remote: Counter,
    pub oplogs_ratified: Counter,
    pub oplogs_expired: Counter,

    pub frames_sent: Counter,
    pub frames_recv: Counter,
    pub oplogs_broadcast: Counter,

    pub sync_rounds: Counter,
    pub merkle_generations: Counter,
    pub merkle_rebuilds: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            oplogs_local: Counter::new("Number of oplogs minted locally"),
            oplogs_remote: Counter::new("Number of oplogs integrated from peers"),
            oplogs_ratified: Counter::new("Number of oplogs that reached their quorum"),
            oplogs_expired: Counter::new("Number of pending oplogs dropped at the horizon"),

            frames_sent: Counter::new("Number of frames queued to peers"),
            frames_recv: Counter::new("Number of frames dispatched from peers"),
            oplogs_broadcast: Counter::new("Number of record announcements sent"),

            sync_rounds: Counter::new("Number of anti-entropy rounds initiated"),
            merkle_generations: Counter::new("Number of merkle index generations"),
            merkle_rebuilds: Counter::new("Number of merkle index rebuilds"),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "opmesh_core"
    }
}
