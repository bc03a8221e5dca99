//! Run states and the structured run report.

use std::fmt;

use crate::{
    combine::CombineReport,
    export::ExportReport,
    fetch::FetchReport,
    harmonize::HarmonizeReport,
    period::{Period, PeriodRange},
    watermark::WatermarkSource,
};

use super::error::PipelineError;

/// States of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing done yet.
    Idle,
    /// Watermark read and target range known.
    RangeComputed,
    /// Retrieving raw artifacts.
    Fetching,
    /// Normalizing this run's raw artifacts.
    Harmonizing,
    /// Rebuilding the combined dataset.
    Combining,
    /// Writing requested exports.
    Exporting,
    /// Terminal: watermark advanced (or nothing to do).
    Committed,
    /// Terminal: watermark untouched.
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::RangeComputed => "range-computed",
            RunState::Fetching => "fetching",
            RunState::Harmonizing => "harmonizing",
            RunState::Combining => "combining",
            RunState::Exporting => "exporting",
            RunState::Committed => "committed",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where a failed run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Taking the run lock.
    Locking,
    /// Reading the watermark.
    ComputingRange,
    /// Fetch stage.
    Fetching,
    /// Harmonize stage.
    Harmonizing,
    /// Combine stage.
    Combining,
    /// Export stage.
    Exporting,
    /// Writing the new watermark.
    Committing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Locking => "locking",
            Stage::ComputingRange => "computing range",
            Stage::Fetching => "fetching",
            Stage::Harmonizing => "harmonizing",
            Stage::Combining => "combining",
            Stage::Exporting => "exporting",
            Stage::Committing => "committing",
        };
        f.write_str(s)
    }
}

/// Everything one run did, returned whether it committed or failed.
#[derive(Debug)]
pub struct RunReport {
    /// Every state entered, starting with [`RunState::Idle`].
    pub transitions: Vec<RunState>,
    /// Watermark at the start of the run and where it came from.
    pub watermark: Option<(Period, WatermarkSource)>,
    /// Target range, once computed.
    pub range: Option<PeriodRange>,
    /// Fetch stage result.
    pub fetch: Option<FetchReport>,
    /// Harmonize stage result.
    pub harmonize: Option<HarmonizeReport>,
    /// Combine stage result.
    pub combine: Option<CombineReport>,
    /// One entry per export written.
    pub exports: Vec<ExportReport>,
    /// New watermark, when the run committed a non-empty range.
    pub committed: Option<Period>,
    /// Cause of failure, when the run failed.
    pub error: Option<PipelineError>,
}

impl RunReport {
    pub(crate) fn new() -> Self {
        Self {
            transitions: vec![RunState::Idle],
            watermark: None,
            range: None,
            fetch: None,
            harmonize: None,
            combine: None,
            exports: Vec::new(),
            committed: None,
            error: None,
        }
    }

    pub(crate) fn enter(&mut self, state: RunState) {
        log::debug!("pipeline: {} -> {state}", self.state());
        self.transitions.push(state);
    }

    /// Current (or final) state.
    pub fn state(&self) -> RunState {
        self.transitions.last().copied().unwrap_or(RunState::Idle)
    }

    /// Whether the run ended committed.
    pub fn is_success(&self) -> bool {
        self.state() == RunState::Committed
    }

    /// Whether the run committed without any work because the range was empty.
    pub fn is_up_to_date(&self) -> bool {
        self.is_success() && self.range.is_some_and(|r| r.is_empty())
    }

    /// Stage a failed run stopped at.
    pub fn failed_stage(&self) -> Option<Stage> {
        self.error.as_ref().map(PipelineError::stage)
    }
}
