/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Detection of Intel Processor Trace support on the running machine.

use std::path::Path;

use lazy_static::lazy_static;
use raw_cpuid::CpuId;
use thiserror::Error;
use tracing::info;

use crate::error::CollectorError;

/// Where the kernel publishes the dynamic PMU type of the `intel_pt` event
/// source.
pub const PT_TYPE_PATH: &str = "/sys/bus/event_source/devices/intel_pt/type";

/// Reasons the machine cannot produce processor traces.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum PtProbeError {
    #[error("cannot read {path}: {reason}")]
    NoPmu { path: String, reason: String },

    #[error("malformed PMU type {0:?}")]
    BadPmuType(String),

    #[error("CPU vendor is not Intel")]
    NotIntel,

    #[error("CPU does not report Intel Processor Trace")]
    NoProcessorTrace,
}

impl From<PtProbeError> for CollectorError {
    fn from(err: PtProbeError) -> Self {
        CollectorError::Unsupported(err.to_string())
    }
}

/// Reads the `perf_event_attr.type` to use for Intel PT events.
pub fn read_pt_pmu_type(path: &Path) -> Result<u32, PtProbeError> {
    let contents = std::fs::read_to_string(path).map_err(|err| PtProbeError::NoPmu {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    let contents = contents.trim();
    contents
        .parse()
        .map_err(|_| PtProbeError::BadPmuType(contents.to_owned()))
}

fn check_cpu() -> Result<(), PtProbeError> {
    let cpuid = CpuId::new();
    let is_intel = cpuid
        .get_vendor_info()
        .is_some_and(|vendor| vendor.as_str() == "GenuineIntel");
    if !is_intel {
        return Err(PtProbeError::NotIntel);
    }
    let has_pt = cpuid
        .get_extended_feature_info()
        .is_some_and(|features| features.has_processor_trace());
    if !has_pt {
        return Err(PtProbeError::NoProcessorTrace);
    }
    Ok(())
}

fn probe() -> Result<u32, PtProbeError> {
    check_cpu()?;
    read_pt_pmu_type(Path::new(PT_TYPE_PATH))
}

lazy_static! {
    static ref PT_SUPPORT: Result<u32, PtProbeError> = {
        let support = probe();
        if let Err(err) = &support {
            info!("Intel PT unavailable: {}", err);
        }
        support
    };
}

/// Returns the result of probing the machine for Intel PT. The probe runs
/// once per process.
pub fn pt_support() -> Result<u32, PtProbeError> {
    PT_SUPPORT.clone()
}

/// Returns true if the current machine can record processor traces.
pub fn is_pt_supported() -> bool {
    PT_SUPPORT.is_ok()
}

/// Concisely return if `is_pt_supported` is `false`. Useful for guarding
/// tests that need tracing hardware.
#[macro_export]
macro_rules! ret_without_pt {
    () => {
        if !$crate::is_pt_supported() {
            return;
        }
    };
    ($expr:expr) => {
        if !$crate::is_pt_supported() {
            return ($expr);
        }
    };
}
