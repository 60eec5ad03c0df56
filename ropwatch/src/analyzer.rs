/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Call/return balance heuristic run over each trace window.
//!
//! A window is scanned from its last instruction backwards. Legitimate code
//! that entered the window through a single outstanding call frame and
//! nests its calls and returns properly leaves the counter at zero. Anything
//! else, in particular more returns than calls, is what a chain of gadgets
//! ending in `ret` looks like.
//!
//! This is a coarse check. It keeps no shadow stack and cannot tell a deep
//! legitimate call chain spanning two windows from an attack.

use std::fmt;
use std::str::FromStr;

use ropwatch_decoder::InsnClass;
use ropwatch_decoder::InstructionRecord;

/// How a window is scanned.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Strategy {
    /// Scan the whole window; consistent iff the counter ends at zero.
    #[default]
    FullScan,
    /// Stop at the first point where the counter reaches zero.
    EarlyExit,
    /// Look backwards from the last far transfer (usually the `syscall`
    /// that closed the window): reaching a call first means the syscall was
    /// made from a called function, reaching a return first means the
    /// syscall was reached by returning into it.
    FarCallAnchor,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [
        Strategy::FullScan,
        Strategy::EarlyExit,
        Strategy::FarCallAnchor,
    ];

    fn name(self) -> &'static str {
        match self {
            Strategy::FullScan => "full-scan",
            Strategy::EarlyExit => "early-exit",
            Strategy::FarCallAnchor => "far-call-anchor",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|strategy| strategy.name() == s)
            .ok_or_else(|| {
                format!(
                    "unknown strategy {:?}, expected one of: full-scan, early-exit, far-call-anchor",
                    s
                )
            })
    }
}

/// Analyzer settings.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AnalyzerConfig {
    pub strategy: Strategy,

    /// Starting value of the balance counter. `1` accounts for the frame
    /// the window was entered through.
    pub initial_balance: i64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::FullScan,
            initial_balance: 1,
        }
    }
}

/// Why a window was judged suspicious.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Reason {
    /// Nothing was decoded, so nothing can be vouched for.
    EmptyWindow,
    /// The counter did not come back to zero.
    Unbalanced { residual: i64 },
    /// The window's far transfer was reached through a return.
    ReturnIntoFarTransfer,
    /// Neither a call nor a return precedes the far transfer.
    Undecided,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Reason::EmptyWindow => write!(f, "empty window"),
            Reason::Unbalanced { residual } => {
                write!(f, "unbalanced calls and returns (residual {})", residual)
            }
            Reason::ReturnIntoFarTransfer => write!(f, "far transfer reached through a return"),
            Reason::Undecided => write!(f, "no call or return before the far transfer"),
        }
    }
}

/// Result of analyzing one window. Never carried over to the next window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Consistent,
    Suspicious(Reason),
}

impl Verdict {
    pub fn is_consistent(&self) -> bool {
        matches!(self, Verdict::Consistent)
    }
}

fn adjustment(class: InsnClass) -> i64 {
    match class {
        InsnClass::NearCall => -1,
        InsnClass::NearReturn => 1,
        _ => 0,
    }
}

/// Evaluates windows with a fixed configuration.
#[derive(Copy, Clone, Debug, Default)]
pub struct Analyzer {
    config: AnalyzerConfig,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Judges one window. `window` is in execution order.
    pub fn evaluate(&self, window: &[InstructionRecord]) -> Verdict {
        self.evaluate_classes(window.iter().map(|record| record.class))
    }

    /// Same as [`Analyzer::evaluate`] for callers that only have classes.
    pub fn evaluate_classes<I>(&self, classes: I) -> Verdict
    where
        I: IntoIterator<Item = InsnClass>,
        I::IntoIter: DoubleEndedIterator,
    {
        let mut classes = classes.into_iter().rev().peekable();
        if classes.peek().is_none() {
            return Verdict::Suspicious(Reason::EmptyWindow);
        }
        match self.config.strategy {
            Strategy::FullScan => self.full_scan(classes),
            Strategy::EarlyExit => self.early_exit(classes),
            Strategy::FarCallAnchor => far_call_anchor(classes),
        }
    }

    fn full_scan(&self, reversed: impl Iterator<Item = InsnClass>) -> Verdict {
        let residual = reversed.fold(self.config.initial_balance, |balance, class| {
            balance + adjustment(class)
        });
        if residual == 0 {
            Verdict::Consistent
        } else {
            Verdict::Suspicious(Reason::Unbalanced { residual })
        }
    }

    fn early_exit(&self, reversed: impl Iterator<Item = InsnClass>) -> Verdict {
        let mut balance = self.config.initial_balance;
        for class in reversed {
            let delta = adjustment(class);
            if delta == 0 {
                continue;
            }
            balance += delta;
            if balance == 0 {
                return Verdict::Consistent;
            }
        }
        if balance == 0 {
            Verdict::Consistent
        } else {
            Verdict::Suspicious(Reason::Unbalanced { residual: balance })
        }
    }
}

fn far_call_anchor(reversed: impl Iterator<Item = InsnClass>) -> Verdict {
    let reversed: Vec<InsnClass> = reversed.collect();
    // Without any far transfer the scan starts at the end of the window.
    let anchor = reversed
        .iter()
        .position(|&class| class == InsnClass::FarTransfer)
        .map_or(0, |pos| pos + 1);
    for class in &reversed[anchor..] {
        match class {
            InsnClass::NearCall => return Verdict::Consistent,
            InsnClass::NearReturn => return Verdict::Suspicious(Reason::ReturnIntoFarTransfer),
            _ => {}
        }
    }
    Verdict::Suspicious(Reason::Undecided)
}
