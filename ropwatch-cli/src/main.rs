/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runs a program under the ROP monitor.

mod commandline;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use ropwatch::Outcome;
use ropwatch::Report;
use tracing::error;
use tracing::info;

use crate::commandline::Arguments;

fn run(args: &Arguments) -> anyhow::Result<Report> {
    let config = args.config();
    config.validate().context("Invalid configuration")?;

    if !ropwatch_perf::is_pt_supported() {
        anyhow::bail!("Intel Processor Trace is not available on this machine");
    }

    ropwatch::monitor(args.command(), config)
        .with_context(|| format!("Failed to monitor {}", args.program))
}

fn main() -> ExitCode {
    let args = Arguments::parse();

    let log_guard = match args.init_tracing() {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Error: {:?}", err);
            return ExitCode::from(1);
        }
    };

    let code = match run(&args) {
        Ok(report) => {
            if let Some(pt_info) = &report.pt_info {
                println!("{}", pt_info);
            }
            info!(
                windows = report.windows,
                instructions = report.instructions,
                abandoned = report.abandoned_windows,
                skipped = report.skipped_windows,
                decode_errors = report.decode_errors,
                "analysis took {:?} of {:?}",
                report.analysis_time,
                report.elapsed
            );
            match report.outcome {
                Outcome::NoAttackFound => {
                    println!("No attacks found!");
                    0
                }
                Outcome::AttackDetected { pid, reason } => {
                    info!("{}", reason);
                    println!("ROP chain detected, tracee {} terminated", pid);
                    2
                }
            }
        }
        Err(err) => {
            error!("{:#}", err);
            eprintln!("Error: {:?}", err);
            1
        }
    };

    // Flush logs before exiting.
    drop(log_guard);
    ExitCode::from(code)
}
