/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;

use syscalls::Errno;
use thiserror::Error;

/// A region of the perf ring buffer mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Region {
    /// The control page followed by the ordinary data region.
    Base,
    /// The auxiliary region the hardware writes trace packets into.
    Aux,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Region::Base => write!(f, "control/data"),
            Region::Aux => write!(f, "aux"),
        }
    }
}

/// Errors raised while acquiring or driving the trace collector.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum CollectorError {
    #[error("Intel PT is not available: {0}")]
    Unsupported(String),

    #[error("trace facility still busy after {attempts} attempts")]
    ResourceBusy { attempts: u32 },

    #[error("failed to map the {region} region: {errno}")]
    MappingFailed { region: Region, errno: Errno },

    #[error("invalid collector configuration: {0}")]
    InvalidConfig(String),

    #[error("the collector has been closed")]
    Closed,

    #[error(transparent)]
    Errno(#[from] Errno),
}

impl From<nix::errno::Errno> for CollectorError {
    fn from(err: nix::errno::Errno) -> Self {
        Self::Errno(Errno::new(err as i32))
    }
}

/// A resource owned by the collector that can fail to be released.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Resource {
    /// One of the two memory mappings.
    Mapping(Region),
    /// The perf event file descriptor.
    Descriptor,
}

/// Every release failure observed by a single `close()`. Resources that did
/// release successfully are not listed, and failed ones are not retried.
#[derive(Error, Debug, Eq, PartialEq)]
#[error("failed to release {}", describe(.failures))]
pub struct CloseError {
    pub failures: Vec<(Resource, Errno)>,
}

fn describe(failures: &[(Resource, Errno)]) -> String {
    failures
        .iter()
        .map(|(resource, errno)| match resource {
            Resource::Mapping(region) => format!("{} mapping ({})", region, errno),
            Resource::Descriptor => format!("perf fd ({})", errno),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
