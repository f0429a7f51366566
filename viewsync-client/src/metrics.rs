//! Metric names recorded by the view syncer.

/// Documents metrics recorded throughout the workspace, so that names stay
/// consistent between recording sites and dashboards.
pub mod recorded {
    /// Histogram: wall time of one query hydration, in seconds. Tagged with
    /// `query` (the transformation hash).
    pub const HYDRATION_DURATION: &str = "viewsync.hydration_duration_seconds";

    /// Histogram: wall time of one replica advancement, in seconds.
    pub const ADVANCE_DURATION: &str = "viewsync.advance_duration_seconds";

    /// Counter: replica advancements aborted by the slow-advance circuit
    /// breaker.
    pub const ADVANCE_RESETS: &str = "viewsync.advance_resets_total";

    /// Counter: table scans that could not use an index seek. Tagged with
    /// `table`.
    pub const UNINDEXED_SCANS: &str = "viewsync.unindexed_scans_total";

    /// Counter: CVR flushes, tagged with `result` (`ok` / `conflict`).
    pub const CVR_FLUSHES: &str = "viewsync.cvr_flushes_total";

    /// Histogram: rows written per CVR flush.
    pub const CVR_FLUSH_ROWS: &str = "viewsync.cvr_flush_rows";

    /// Counter: pokes started, tagged with `reason` (`advance` / `config` /
    /// `catchup`).
    pub const POKES_STARTED: &str = "viewsync.pokes_started_total";

    /// Counter: pokes closed with `pokeEnd{cancel}` because patch assembly
    /// failed after the `pokeStart` was already sent.
    pub const POKES_CANCELLED: &str = "viewsync.pokes_cancelled_total";

    /// Gauge: connected clients per view syncer.
    pub const CONNECTED_CLIENTS: &str = "viewsync.connected_clients";

    /// Counter: queries evicted by TTL expiration.
    pub const QUERIES_EVICTED: &str = "viewsync.queries_evicted_total";
}
