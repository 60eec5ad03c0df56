/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end runs of the monitor against forked tracees. The ptrace side is
//! real; trace capture and decoding are scripted so these run anywhere.

use std::ffi::CString;

use ropwatch::testing::check_fn;
use ropwatch::testing::init_test_tracing;
use ropwatch::testing::test_fn;
use ropwatch::testing::test_fn_with;
use ropwatch::testing::NullCapture;
use ropwatch::testing::ScriptedDecoder;
use ropwatch::AnalyzerConfig;
use ropwatch::Config;
use ropwatch::Outcome;
use ropwatch::Reason;
use ropwatch::Strategy;
use ropwatch::TracerLoop;
use ropwatch_decoder::DecodeError;
use ropwatch_decoder::InsnClass::*;
use ropwatch_decoder::InstructionRecord;
use ropwatch_ptrace::ExitStatus;
use ropwatch_ptrace::Signal;
use ropwatch_tests::call_then_exit;
use ropwatch_tests::spin_then_exit;
use ropwatch_tests::syscalls_then_exit;
use test_case::test_case;

#[test]
fn loop_without_syscalls() {
    let report = check_fn(|| spin_then_exit(1_000_000), ScriptedDecoder::consistent());
    // The only boundary is the exit itself.
    assert!(report.windows <= 1, "{:?}", report);
}

#[test]
fn call_then_exit_group() {
    let decoder = ScriptedDecoder::new([vec![
        NearCall,
        Ordinary,
        NearReturn,
        NearCall,
        FarTransfer,
    ]]);
    let report = check_fn(|| call_then_exit(), decoder);
    assert_eq!(report.windows, 1);
    assert_eq!(report.instructions, 5);
    assert_eq!(report.skipped_windows, 0);
}

#[test_case(Strategy::FullScan, Reason::Unbalanced { residual: 2 })]
#[test_case(Strategy::EarlyExit, Reason::Unbalanced { residual: 2 })]
#[test_case(Strategy::FarCallAnchor, Reason::ReturnIntoFarTransfer)]
fn more_returns_than_calls_kills_the_tracee(strategy: Strategy, expected: Reason) {
    let config = Config {
        analyzer: AnalyzerConfig {
            strategy,
            ..Default::default()
        },
        ..Default::default()
    };
    // Clean first window, then a return chain.
    let decoder = ScriptedDecoder::new([
        vec![NearCall, FarTransfer],
        vec![NearCall, NearReturn, NearReturn],
    ]);
    let report = test_fn_with(
        || syscalls_then_exit(5, 0),
        config,
        NullCapture::new(vec![0; 1]),
        decoder,
    )
    .unwrap();

    match report.outcome {
        Outcome::AttackDetected { reason, .. } => assert_eq!(reason, expected),
        outcome => panic!("expected an attack, got {:?}", outcome),
    }
    assert_eq!(report.windows, 2);
    assert_eq!(
        report.exit_status.and_then(|status| status.signal()),
        Some(Signal::SIGKILL)
    );
}

#[test]
fn attack_reports_the_tracee_pid() {
    init_test_tracing();
    let tracee = ropwatch::spawn_fn(|| syscalls_then_exit(1, 0)).unwrap();
    let pid = tracee.pid();
    let mut tracer = TracerLoop::new(
        Config::default(),
        NullCapture::new(vec![0; 1]),
        ScriptedDecoder::new([vec![NearReturn]]),
    );
    let report = tracer.run(tracee).unwrap();
    assert_eq!(
        report.outcome,
        Outcome::AttackDetected {
            pid,
            reason: Reason::Unbalanced { residual: 2 }
        }
    );
    assert!(matches!(
        report.exit_status,
        Some(ExitStatus::Signaled(Signal::SIGKILL, _))
    ));
}

#[test]
fn exit_code_is_reported() {
    let report = test_fn(|| syscalls_then_exit(3, 7), ScriptedDecoder::consistent()).unwrap();
    assert_eq!(report.outcome, Outcome::NoAttackFound);
    assert_eq!(report.exit_status, Some(ExitStatus::Exited(7)));
    assert_eq!(report.windows, 4);
}

#[test]
fn decode_errors_do_not_end_the_run() {
    let decoder = ScriptedDecoder::from_results([
        vec![
            Err(DecodeError::NoMap { ip: 0x1000 }),
            Ok(InstructionRecord::synthetic(NearCall)),
            Ok(InstructionRecord::synthetic(FarTransfer)),
        ],
        vec![
            Ok(InstructionRecord::synthetic(NearCall)),
            Err(DecodeError::Overflow { offset: 0x40 }),
            Ok(InstructionRecord::synthetic(FarTransfer)),
        ],
    ])
    .or_else(vec![NearCall, FarTransfer]);
    let report = check_fn(|| syscalls_then_exit(2, 0), decoder);
    assert_eq!(report.decode_errors, 2);
    assert_eq!(report.windows, 3);
    assert_eq!(report.instructions, 6);
}

#[test]
fn empty_windows_are_skipped() {
    let report = test_fn_with(
        || syscalls_then_exit(2, 0),
        Config::default(),
        NullCapture::new(Vec::new()),
        ScriptedDecoder::new([vec![NearReturn]]),
    )
    .unwrap();
    assert_eq!(report.outcome, Outcome::NoAttackFound);
    assert_eq!(report.skipped_windows, report.windows);
    assert_eq!(report.instructions, 0);
}

#[test]
fn spawned_program_runs_to_completion() {
    init_test_tracing();
    let tracee = ropwatch::spawn(std::process::Command::new("/bin/true")).unwrap();
    let mut tracer = TracerLoop::new(
        Config::default(),
        NullCapture::new(vec![0; 1]),
        ScriptedDecoder::consistent(),
    );
    let report = tracer.run(tracee).unwrap();
    assert_eq!(report.outcome, Outcome::NoAttackFound);
    assert_eq!(report.exit_status, Some(ExitStatus::Exited(0)));
    assert!(report.windows >= 1);
    assert_eq!(tracer.decoder().initializations(), 1);
}

#[test]
fn exec_rebuilds_the_image() {
    init_test_tracing();
    // Allocate before forking; the child only makes syscalls.
    let path = CString::new("/bin/true").unwrap();
    let argv = [path.as_ptr(), std::ptr::null()];
    let tracee = ropwatch::spawn_fn(move || unsafe {
        libc::execv(path.as_ptr(), argv.as_ptr());
        libc::_exit(127);
    })
    .unwrap();
    let mut tracer = TracerLoop::new(
        Config::default(),
        NullCapture::new(vec![0; 1]),
        ScriptedDecoder::consistent(),
    );
    let report = tracer.run(tracee).unwrap();
    assert_eq!(report.exit_status, Some(ExitStatus::Exited(0)));
    assert_eq!(tracer.decoder().initializations(), 2);
}
