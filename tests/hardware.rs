/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runs with real Intel PT capture and decoding. Skipped on machines without
//! PT, and when perf events are not permitted.

use std::process::Command;

use ropwatch::testing::init_test_tracing;
use ropwatch::Config;
use ropwatch::Error;
use ropwatch::Report;
use ropwatch_perf::ret_without_pt;

fn monitor(command: Command, config: Config) -> Option<Report> {
    init_test_tracing();
    match ropwatch::monitor(command, config) {
        Ok(report) => Some(report),
        Err(Error::Collector(err)) => {
            eprintln!("skipping, cannot trace: {}", err);
            None
        }
        Err(err) => panic!("monitor failed: {:?}", err),
    }
}

#[test]
fn true_is_traced() {
    ret_without_pt!();
    let Some(report) = monitor(Command::new("/bin/true"), Config::default()) else {
        return;
    };
    // Whatever the verdict, the run went through the loop and ended.
    assert!(report.windows >= 1, "{:?}", report);
    assert!(report.exit_status.is_some(), "{:?}", report);
    if report.skipped_windows < report.windows {
        assert!(report.instructions > 0, "{:?}", report);
    }
}

#[test]
fn pt_info_is_reported() {
    ret_without_pt!();
    let mut config = Config::default();
    config.diagnostics.pt_info = true;
    let aux_pages = config.collector.aux_pages;
    let Some(report) = monitor(Command::new("/bin/true"), config) else {
        return;
    };
    let info = report.pt_info.expect("pt info requested");
    assert!(info.fd.is_some());
    assert!(info.aux_size >= aux_pages * 4096, "{}", info);
    assert!(info.base_size > 0, "{}", info);

    let Some(report) = monitor(Command::new("/bin/true"), Config::default()) else {
        return;
    };
    assert_eq!(report.pt_info, None);
}

#[test]
fn trace_time_only() {
    ret_without_pt!();
    let mut config = Config::default();
    config.diagnostics.trace_time_only = true;
    let Some(report) = monitor(Command::new("/bin/true"), config) else {
        return;
    };
    assert_eq!(report.windows, 0);
    assert_eq!(report.exit_status, Some(ropwatch::ExitStatus::Exited(0)));
}
