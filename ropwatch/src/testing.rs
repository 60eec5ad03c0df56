/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Utilities that support testing the monitor without Intel PT hardware.
//!
//! [`NullCapture`] stands in for the collector and [`ScriptedDecoder`] for
//! the decoder, so the ptrace side of the loop runs for real while the
//! windows it sees are chosen by the test.

use std::collections::VecDeque;

use ropwatch_decoder::DecodeError;
use ropwatch_decoder::InsnClass;
use ropwatch_decoder::InstructionRecord;
use ropwatch_decoder::TraceDecoder;
use ropwatch_perf::CollectorError;
use ropwatch_perf::TraceCapture;
use ropwatch_ptrace::ExitStatus;

use crate::config::Config;
use crate::error::Error;
use crate::tracer::spawn_fn;
use crate::tracer::Outcome;
use crate::tracer::Report;
use crate::tracer::TracerLoop;

/// Sets up a global subscriber for tests. Logs `ropwatch` at debug level
/// unless `RUST_LOG` says otherwise.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ropwatch=debug"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .finish();

    // Tests may run in parallel and we don't care who wins.
    tracing::subscriber::set_global_default(subscriber).unwrap_or(());
}

/// A capture that hands out the same bytes for every window and counts how
/// often it was switched on and off.
#[derive(Debug, Default)]
pub struct NullCapture {
    window: Vec<u8>,
    enables: usize,
    disables: usize,
}

impl NullCapture {
    pub fn new(window: Vec<u8>) -> Self {
        Self {
            window,
            enables: 0,
            disables: 0,
        }
    }

    pub fn enables(&self) -> usize {
        self.enables
    }

    pub fn disables(&self) -> usize {
        self.disables
    }
}

impl TraceCapture for NullCapture {
    fn reset_and_enable(&mut self) -> Result<(), CollectorError> {
        self.enables += 1;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), CollectorError> {
        self.disables += 1;
        Ok(())
    }

    fn current_window(&self) -> ropwatch_perf::TraceWindow<'_> {
        ropwatch_perf::TraceWindow::new(&self.window, false)
    }
}

type ScriptedWindow = Vec<Result<InstructionRecord, DecodeError>>;

/// A decoder that ignores the trace bytes and replays scripted windows.
///
/// Windows are handed out in order, one per `initialize` or `resync`. When
/// the script runs out, every further window is the fallback, or
/// [`DecodeError::EndOfStream`] if there is none. An empty trace window
/// always yields `EndOfStream`, like the real decoder.
#[derive(Debug, Default)]
pub struct ScriptedDecoder {
    script: VecDeque<ScriptedWindow>,
    fallback: Option<Vec<InsnClass>>,
    initializations: usize,
    resyncs: usize,
}

fn synthetic(classes: &[InsnClass]) -> ScriptedWindow {
    classes
        .iter()
        .map(|&class| Ok(InstructionRecord::synthetic(class)))
        .collect()
}

impl ScriptedDecoder {
    /// Replays `windows`, one per trace window.
    pub fn new<I>(windows: I) -> Self
    where
        I: IntoIterator<Item = Vec<InsnClass>>,
    {
        Self::from_results(windows.into_iter().map(|classes| synthetic(&classes)))
    }

    /// Like [`ScriptedDecoder::new`], with decode errors mixed in.
    pub fn from_results<I>(windows: I) -> Self
    where
        I: IntoIterator<Item = ScriptedWindow>,
    {
        Self {
            script: windows.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Every window is a syscall made from a called function, which the
    /// default analyzer accepts.
    pub fn consistent() -> Self {
        Self::default().or_else(vec![InsnClass::NearCall, InsnClass::FarTransfer])
    }

    /// Sets the window replayed once the script is exhausted.
    pub fn or_else(mut self, fallback: Vec<InsnClass>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn initializations(&self) -> usize {
        self.initializations
    }

    pub fn resyncs(&self) -> usize {
        self.resyncs
    }

    fn next_window(
        &mut self,
        window: &[u8],
    ) -> Result<std::vec::IntoIter<Result<InstructionRecord, DecodeError>>, DecodeError> {
        if window.is_empty() {
            return Err(DecodeError::EndOfStream);
        }
        let records = match self.script.pop_front() {
            Some(records) => records,
            None => match &self.fallback {
                Some(classes) => synthetic(classes),
                None => return Err(DecodeError::EndOfStream),
            },
        };
        Ok(records.into_iter())
    }
}

impl TraceDecoder for ScriptedDecoder {
    type Cursor<'a>
        = std::vec::IntoIter<Result<InstructionRecord, DecodeError>>
    where
        Self: 'a;

    fn initialize<'a>(&'a mut self, window: &'a [u8]) -> Result<Self::Cursor<'a>, DecodeError> {
        self.initializations += 1;
        self.next_window(window)
    }

    fn resync<'a>(&'a mut self, window: &'a [u8]) -> Result<Self::Cursor<'a>, DecodeError> {
        self.resyncs += 1;
        self.next_window(window)
    }
}

/// Runs `f` as a tracee with the given capture and decoder and returns the
/// report of the run.
pub fn test_fn_with<C, D, F>(f: F, config: Config, capture: C, decoder: D) -> Result<Report, Error>
where
    C: TraceCapture,
    D: TraceDecoder,
    F: FnOnce(),
{
    init_test_tracing();
    config.validate()?;
    let tracee = spawn_fn(f)?;
    TracerLoop::new(config, capture, decoder).run(tracee)
}

/// Runs `f` as a tracee, replaying `decoder`'s windows.
pub fn test_fn<F: FnOnce()>(f: F, decoder: ScriptedDecoder) -> Result<Report, Error> {
    test_fn_with(f, Config::default(), NullCapture::new(vec![0; 1]), decoder)
}

/// Like [`test_fn`], and checks that no attack was reported and the tracee
/// exited with 0.
pub fn check_fn<F: FnOnce()>(f: F, decoder: ScriptedDecoder) -> Report {
    let report = test_fn(f, decoder).unwrap();
    assert_eq!(report.outcome, Outcome::NoAttackFound, "{:?}", report);
    if report.exit_status != Some(ExitStatus::Exited(0)) {
        panic!("Got exit status {:?}", report.exit_status);
    }
    report
}
