/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::time::Duration;

use crate::error::CollectorError;

/// Intel PT configuration bits passed as `perf_event_attr.config`: tracing
/// enabled, branch tracing, MTC and TSC packets, MTC period 3, PSB period 3.
/// Return compression stays enabled.
pub const DEFAULT_PT_CONFIG: u64 = 0x300e601;

/// Sizing and retry policy for a [`crate::PtCollector`].
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    /// Pages in the ordinary data region. Must be a power of two.
    pub data_pages: usize,

    /// Pages in the auxiliary region that receives trace packets. Must be a
    /// power of two.
    pub aux_pages: usize,

    /// Initial capacity, in bytes, of the storage used to linearise a window
    /// that wraps around the end of the auxiliary ring.
    pub trace_capacity: usize,

    /// Fraction of the auxiliary region that should be filled before the
    /// kernel signals a wakeup. Advisory only; capture is driven by
    /// enable/disable around syscalls.
    pub aux_wakeup_ratio: f64,

    /// How many times `perf_event_open` is attempted while the PT unit is
    /// held by someone else.
    pub open_attempts: u32,

    /// Pause between two busy attempts.
    pub open_backoff: Duration,

    /// Raw `config` value for the `intel_pt` PMU.
    pub pt_config: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            data_pages: 64,
            aux_pages: 1024,
            trace_capacity: 1024 * 1024,
            aux_wakeup_ratio: 0.5,
            open_attempts: 50_000,
            open_backoff: Duration::from_millis(10),
            pt_config: DEFAULT_PT_CONFIG,
        }
    }
}

impl CollectorConfig {
    /// Checks the constraints the kernel puts on the ring buffer geometry.
    pub fn validate(&self) -> Result<(), CollectorError> {
        if !self.data_pages.is_power_of_two() {
            return Err(CollectorError::InvalidConfig(format!(
                "data_pages must be a power of two, got {}",
                self.data_pages
            )));
        }
        if !self.aux_pages.is_power_of_two() {
            return Err(CollectorError::InvalidConfig(format!(
                "aux_pages must be a power of two, got {}",
                self.aux_pages
            )));
        }
        if !(self.aux_wakeup_ratio > 0.0 && self.aux_wakeup_ratio <= 1.0) {
            return Err(CollectorError::InvalidConfig(format!(
                "aux_wakeup_ratio must be in (0, 1], got {}",
                self.aux_wakeup_ratio
            )));
        }
        if self.open_attempts == 0 {
            return Err(CollectorError::InvalidConfig(
                "open_attempts must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Size of the auxiliary region in bytes.
    pub fn aux_bytes(&self, page_size: usize) -> usize {
        self.aux_pages * page_size
    }

    /// Value for `perf_event_attr.aux_watermark`.
    pub fn aux_watermark(&self, page_size: usize) -> u32 {
        let watermark = self.aux_bytes(page_size) as f64 * self.aux_wakeup_ratio;
        watermark.min(u32::MAX as f64) as u32
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CollectorConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.aux_bytes(4096), 4 * 1024 * 1024);
        assert_eq!(config.aux_watermark(4096), 2 * 1024 * 1024);
    }

    #[test_case(63, 1024 ; "odd data region")]
    #[test_case(64, 1000 ; "odd aux region")]
    #[test_case(0, 1024 ; "empty data region")]
    fn rejects_bad_geometry(data_pages: usize, aux_pages: usize) {
        let config = CollectorConfig {
            data_pages,
            aux_pages,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CollectorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_zero_attempts() {
        let config = CollectorConfig {
            open_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
