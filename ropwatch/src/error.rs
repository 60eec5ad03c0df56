/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::io;

use ropwatch_perf::CollectorError;
use ropwatch_ptrace::ExitStatus;
use ropwatch_ptrace::Pid;
use thiserror::Error;

/// Errors that end a monitoring run.
#[derive(Error, Debug)]
pub enum Error {
    /// The trace facility could not be set up or controlled.
    #[error(transparent)]
    Collector(#[from] CollectorError),

    /// Controlling the tracee failed for a reason other than its death.
    #[error(transparent)]
    Tracee(#[from] ropwatch_ptrace::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The tracee went away before it reached its first stop.
    #[error("tracee {pid} exited before it could be traced ({status})")]
    EarlyExit { pid: Pid, status: ExitStatus },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A window decoded to more instructions than the buffer holds. The window
/// is abandoned; the run goes on.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
#[error("window holds more than {capacity} instructions")]
pub struct WindowOverflow {
    pub capacity: usize,
}
