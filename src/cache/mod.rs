pub mod bandwidth;
pub mod base;
pub mod block;
pub mod config;
pub mod data;
pub mod readonly;

pub use config::Config;
pub use data::Data;
pub use readonly::ReadOnly;

/// Outcome of a cache access.
#[derive(Debug, strum::EnumIter, Clone, Copy, Hash, PartialEq, Eq)]
pub enum RequestStatus {
    HIT,
    HIT_RESERVED,
    MISS,
    RESERVATION_FAIL,
    SECTOR_MISS,
    MSHR_HIT,
}

impl RequestStatus {
    #[must_use]
    pub fn is_hit(self) -> bool {
        matches!(self, RequestStatus::HIT | RequestStatus::HIT_RESERVED)
    }

    #[must_use]
    pub fn is_reservation_fail(self) -> bool {
        self == RequestStatus::RESERVATION_FAIL
    }
}

/// Why a cache refused an access.
///
/// Never fatal: the issuing unit re-presents the access next cycle.
#[derive(Debug, strum::EnumIter, Clone, Copy, Hash, PartialEq, Eq)]
pub enum ReservationFailure {
    /// All lines in the set are reserved.
    LINE_ALLOC_FAIL,
    /// The miss queue towards the next level is full.
    MISS_QUEUE_FULL,
    MSHR_ENTRY_FAIL,
    MSHR_MERGE_ENTRY_FAIL,
    /// A write collided with a pending read of the same block.
    MSHR_RW_PENDING,
}

impl From<RequestStatus> for stats::cache::RequestStatus {
    fn from(status: RequestStatus) -> Self {
        match status {
            RequestStatus::HIT => Self::HIT,
            RequestStatus::HIT_RESERVED => Self::HIT_RESERVED,
            RequestStatus::MISS => Self::MISS,
            RequestStatus::RESERVATION_FAIL => Self::RESERVATION_FAIL,
            RequestStatus::SECTOR_MISS => Self::SECTOR_MISS,
            RequestStatus::MSHR_HIT => Self::MSHR_HIT,
        }
    }
}

impl From<ReservationFailure> for stats::cache::ReservationFailure {
    fn from(failure: ReservationFailure) -> Self {
        match failure {
            ReservationFailure::LINE_ALLOC_FAIL => Self::LINE_ALLOC_FAIL,
            ReservationFailure::MISS_QUEUE_FULL => Self::MISS_QUEUE_FULL,
            ReservationFailure::MSHR_ENTRY_FAIL => Self::MSHR_ENTRY_FAIL,
            ReservationFailure::MSHR_MERGE_ENTRY_FAIL => Self::MSHR_MERGE_ENTRY_FAIL,
            ReservationFailure::MSHR_RW_PENDING => Self::MSHR_RW_PENDING,
        }
    }
}

impl From<RequestStatus> for stats::cache::AccessStat {
    fn from(status: RequestStatus) -> Self {
        Self::Status(status.into())
    }
}

impl From<ReservationFailure> for stats::cache::AccessStat {
    fn from(failure: ReservationFailure) -> Self {
        Self::ReservationFailure(failure.into())
    }
}

/// Events reported by an access, used by the load/store unit to track
/// outstanding stores and write allocations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    ReadRequestSent,
    WriteRequestSent,
    WriteBackRequestSent {
        evicted_block: Option<crate::tag_array::EvictedBlockInfo>,
    },
    WriteAllocateSent,
}

#[must_use]
pub fn was_read_sent(events: &[Event]) -> bool {
    events
        .iter()
        .any(|event| matches!(event, Event::ReadRequestSent))
}

#[must_use]
pub fn was_write_sent(events: &[Event]) -> bool {
    events
        .iter()
        .any(|event| matches!(event, Event::WriteRequestSent))
}

#[must_use]
pub fn was_writeback_sent(events: &[Event]) -> Option<&Event> {
    events
        .iter()
        .find(|event| matches!(event, Event::WriteBackRequestSent { .. }))
}

#[must_use]
pub fn was_writeallocate_sent(events: &[Event]) -> bool {
    events
        .iter()
        .any(|event| matches!(event, Event::WriteAllocateSent))
}

/// Merge the probe and access outcomes into the status that is counted.
#[must_use]
pub fn select_status(probe: RequestStatus, access: RequestStatus) -> RequestStatus {
    match (probe, access) {
        (RequestStatus::HIT_RESERVED, access) if access != RequestStatus::RESERVATION_FAIL => {
            probe
        }
        (RequestStatus::SECTOR_MISS, RequestStatus::MISS) => probe,
        _ => access,
    }
}
