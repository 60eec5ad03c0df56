/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;

use nix::sys::signal::Signal;

/// Describes how a tracee finished.
///
/// Unlike `std::process::ExitStatus` this is a plain enum, which makes it easy
/// to match against in tests and reports.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExitStatus {
    /// The tracee exited with an exit code.
    Exited(i32),
    /// The tracee was killed by a signal, with or without a coredump.
    Signaled(Signal, bool),
}

impl ExitStatus {
    /// A successful exit status.
    pub const SUCCESS: Self = ExitStatus::Exited(0);

    /// Was termination successful? Death by signal is never a success.
    pub fn success(&self) -> bool {
        self == &Self::SUCCESS
    }

    /// Returns the exit code, or `None` if the tracee was killed by a signal.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            ExitStatus::Signaled(..) => None,
        }
    }

    /// Returns the terminating signal, if any.
    pub fn signal(&self) -> Option<Signal> {
        match self {
            ExitStatus::Exited(_) => None,
            ExitStatus::Signaled(sig, _) => Some(*sig),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with code {}", code),
            ExitStatus::Signaled(sig, true) => write!(f, "killed by {} (core dumped)", sig),
            ExitStatus::Signaled(sig, false) => write!(f, "killed by {}", sig),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        assert!(ExitStatus::SUCCESS.success());
        assert_eq!(ExitStatus::Exited(3).code(), Some(3));
        assert_eq!(ExitStatus::Exited(3).signal(), None);

        let killed = ExitStatus::Signaled(Signal::SIGKILL, false);
        assert!(!killed.success());
        assert_eq!(killed.code(), None);
        assert_eq!(killed.signal(), Some(Signal::SIGKILL));
        assert_eq!(killed.to_string(), "killed by SIGKILL");
    }
}
