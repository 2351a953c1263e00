use serde::Serialize;

/// Warp scheduler issue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Scheduler {
    pub num_single_issue: u64,
    pub num_dual_issue: u64,
    /// No warp had a valid instruction buffered (idle or control hazard).
    pub issue_raw_hazard_stall: u64,
    /// A valid instruction failed the scoreboard.
    pub issue_control_hazard_stall: u64,
    /// A ready instruction found no free pipeline register.
    pub issue_pipeline_stall: u64,
}
