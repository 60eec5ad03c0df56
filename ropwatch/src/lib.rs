/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![cfg(target_os = "linux")]

//! Watches a process for return-oriented programming.
//!
//! The tracee is stopped at every syscall entry. Between two stops its
//! user-mode control flow is recorded with Intel PT; at each stop the window
//! is decoded and the [`Analyzer`] checks that calls and returns balance.
//! A suspicious window gets the tracee killed.
//!
//! ```no_run
//! use std::process::Command;
//!
//! let report = ropwatch::monitor(Command::new("/bin/ls"), Default::default())?;
//! println!("{:?}", report.outcome);
//! # Ok::<(), ropwatch::Error>(())
//! ```

mod analyzer;
mod buffer;
mod config;
mod error;
pub mod testing;
mod tracer;

pub use ropwatch_ptrace::ExitStatus;
pub use ropwatch_ptrace::Pid;

pub use crate::analyzer::Analyzer;
pub use crate::analyzer::AnalyzerConfig;
pub use crate::analyzer::Reason;
pub use crate::analyzer::Strategy;
pub use crate::analyzer::Verdict;
pub use crate::buffer::WindowBuffer;
pub use crate::config::Config;
pub use crate::config::Diagnostics;
pub use crate::config::DEFAULT_WINDOW_CAPACITY;
pub use crate::error::Error;
pub use crate::error::WindowOverflow;
pub use crate::tracer::monitor;
pub use crate::tracer::spawn;
pub use crate::tracer::spawn_fn;
pub use crate::tracer::Outcome;
pub use crate::tracer::Report;
pub use crate::tracer::Tracee;
pub use crate::tracer::TracerLoop;
