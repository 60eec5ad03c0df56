/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use ropwatch_perf::CollectorConfig;

use crate::analyzer::AnalyzerConfig;
use crate::error::Error;

/// Most instructions kept for one window before it is abandoned.
pub const DEFAULT_WINDOW_CAPACITY: usize = 1_000_000;

/// Optional output, each consulted at one point of the loop.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Diagnostics {
    /// Log every syscall the tracee stops at, with its six arguments.
    pub trace_syscalls: bool,

    /// Log every decoded instruction (at trace level).
    pub log_instructions: bool,

    /// Wait for a line on stdin after each window.
    pub step: bool,

    /// Only measure: capture for the whole run without stopping at syscalls
    /// or decoding anything, and report the elapsed time.
    pub trace_time_only: bool,

    /// Log the decode and analysis time of every window.
    pub time_analysis: bool,

    /// Report the PT event's PMU type, descriptor and buffer sizes once the
    /// collector is open.
    pub pt_info: bool,
}

/// Everything a run needs. Built once and not changed afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub collector: CollectorConfig,
    pub analyzer: AnalyzerConfig,
    pub diagnostics: Diagnostics,
    pub window_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            collector: CollectorConfig::default(),
            analyzer: AnalyzerConfig::default(),
            diagnostics: Diagnostics::default(),
            window_capacity: DEFAULT_WINDOW_CAPACITY,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        self.collector.validate()?;
        if self.window_capacity == 0 {
            return Err(Error::InvalidConfig(
                "window capacity must be at least one instruction".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window_capacity, 1_000_000);
        assert_eq!(config.analyzer.initial_balance, 1);
        assert_eq!(config.diagnostics, Diagnostics::default());
    }

    #[test]
    fn zero_capacity() {
        let config = Config {
            window_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn collector_errors_pass_through() {
        let mut config = Config::default();
        config.collector.aux_pages = 1000;
        assert!(matches!(config.validate(), Err(Error::Collector(_))));
    }
}
