use rudder_core::{AppStatus, RudderError, RudderResult};

/// Tick phases, in the order one tick walks through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Polling,
    Decoding,
    Reconciling,
    Reporting,
    Sleeping,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Polling => "polling",
            Phase::Decoding => "decoding",
            Phase::Reconciling => "reconciling",
            Phase::Reporting => "reporting",
            Phase::Sleeping => "sleeping",
        }
    }
}

/// Which half of the desired state an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestSet {
    Present,
    Missing,
}

/// A per-manifest error, isolated to its entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFailure {
    pub set: ManifestSet,
    /// Position of the entry within its set.
    pub index: usize,
    pub error: RudderError,
}

/// Completion of a detached removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalOutcome {
    pub index: usize,
    pub result: RudderResult<()>,
}

/// Everything one tick did, for logging and tests.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub failures: Vec<ManifestFailure>,
    /// Present entries that passed dry-run and were applied.
    pub applied: usize,
    /// Entries with nothing left to deploy after the internal filter.
    pub skipped_empty: usize,
    /// Internal objects dropped across all entries.
    pub filtered_objects: usize,
    pub removals_dispatched: usize,
    /// Removals from earlier ticks that completed before this one started.
    pub removals_completed: Vec<RemovalOutcome>,
    pub status: AppStatus,
    pub report_error: Option<RudderError>,
}

impl TickReport {
    pub fn failures_in(&self, set: ManifestSet) -> impl Iterator<Item = &ManifestFailure> + '_ {
        self.failures.iter().filter(move |f| f.set == set)
    }
}
