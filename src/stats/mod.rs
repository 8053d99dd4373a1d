//! Collection statistics for the gateway.

pub mod counters;

pub use counters::{
    create_shared_stats, create_shared_stats_with_persistence, CollectionStats, DropReason,
    SharedStats, StatsSnapshot,
};
