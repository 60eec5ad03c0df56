/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![cfg(target_os = "linux")]

//! Hardware trace capture for a single process using Intel Processor Trace
//! through `perf_event_open(2)`.
//!
//! Explicitly missing (because they are unnecessary) perf features include:
//! * Grouping
//! * Sampling and reading records from the ordinary data region
//! * Address filters
//! * Snapshot mode
//!
//! Capture is meant to be bracketed around a tracee's syscalls: enable before
//! resuming it, disable once it stops, then read [`TraceCapture::current_window`].

mod collector;
mod config;
mod error;
mod probe;
mod window;

pub use crate::collector::retry_while_busy;
pub use crate::collector::PtCollector;
pub use crate::collector::PtInfo;
pub use crate::config::CollectorConfig;
pub use crate::config::DEFAULT_PT_CONFIG;
pub use crate::error::CloseError;
pub use crate::error::CollectorError;
pub use crate::error::Region;
pub use crate::error::Resource;
pub use crate::probe::is_pt_supported;
pub use crate::probe::pt_support;
pub use crate::probe::read_pt_pmu_type;
pub use crate::probe::PtProbeError;
pub use crate::probe::PT_TYPE_PATH;
pub use crate::window::TraceWindow;

/// Start/stop control over a source of trace bytes.
pub trait TraceCapture {
    /// Drops whatever the previous window held and starts capturing. Calling
    /// it while already capturing does nothing.
    fn reset_and_enable(&mut self) -> Result<(), CollectorError>;

    /// Stops capturing. The captured bytes become available through
    /// [`TraceCapture::current_window`]. Calling it while stopped does
    /// nothing.
    fn disable(&mut self) -> Result<(), CollectorError>;

    /// The bytes captured between the last enable and disable. Only
    /// meaningful after `disable`.
    fn current_window(&self) -> TraceWindow<'_>;
}
