/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Command line of the `ropwatch` binary: which program to run, how to run
//! it, and one flag per configuration knob.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use chrono::Local;
use clap::Parser;
use ropwatch::AnalyzerConfig;
use ropwatch::Config;
use ropwatch::Diagnostics;
use ropwatch::Strategy;
use ropwatch_perf::CollectorConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Parses an environment variable command-line argument.
pub fn parse_env(s: &str) -> anyhow::Result<(String, String)> {
    let mut iter = s.splitn(2, '=');

    let key = iter
        .next()
        .filter(|key| !key.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Invalid KEY=VALUE: string is empty"))?
        .to_owned();

    let value = match iter.next() {
        Some(value) => value.to_owned(),
        None => std::env::var(&key).map_err(anyhow::Error::msg)?,
    };

    Ok((key, value))
}

fn parse_millis(s: &str) -> anyhow::Result<Duration> {
    Ok(Duration::from_millis(s.parse()?))
}

fn parse_hex(s: &str) -> anyhow::Result<u64> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    Ok(u64::from_str_radix(digits, 16)?)
}

/// Runs a program and kills it when its control flow looks like a ROP chain.
#[derive(Debug, Clone, Parser)]
#[clap(name = "ropwatch", version)]
pub struct Arguments {
    /// Direct logging to a file.  This can also be set with the RUST_LOG_FILE environment
    /// variable, but the CLI flag takes precedence.
    #[clap(long = "log-file", value_name = "PATH", env = "RUST_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Do not pass-through host's environment variables, instead providing a
    /// minimal PATH only (/bin:/usr/bin). The default is to pass through the
    /// host environment.
    #[clap(long = "no-host-envs")]
    pub no_host_envs: bool,

    /// Sets an environment variable. Can be used multiple times.
    #[clap(
        long = "env",
        short = 'e',
        value_name = "ENV[=VALUE]",
        value_parser = parse_env,
        num_args = 1
    )]
    pub envs: Vec<(String, String)>,

    /// How windows are judged: full-scan, early-exit or far-call-anchor.
    #[clap(long, value_name = "STRATEGY", default_value_t = Strategy::FullScan)]
    pub strategy: Strategy,

    /// Starting value of the call/return balance counter.
    #[clap(long, value_name = "N", default_value_t = 1, allow_negative_numbers = true)]
    pub initial_balance: i64,

    /// Most instructions analyzed per window. Larger windows are abandoned.
    #[clap(long, value_name = "N", default_value_t = ropwatch::DEFAULT_WINDOW_CAPACITY)]
    pub window_capacity: usize,

    /// Pages in the perf data region (power of two).
    #[clap(long, value_name = "PAGES", default_value_t = 64)]
    pub data_pages: usize,

    /// Pages in the trace ring (power of two).
    #[clap(long, value_name = "PAGES", default_value_t = 1024)]
    pub aux_pages: usize,

    /// Initial size in bytes of the buffer that holds a wrapped window.
    #[clap(long, value_name = "BYTES", default_value_t = 1024 * 1024)]
    pub trace_capacity: usize,

    /// Fill ratio of the trace ring at which the kernel wakes up readers.
    #[clap(long, value_name = "RATIO", default_value_t = 0.5)]
    pub aux_wakeup_ratio: f64,

    /// Attempts to open the trace event while the PT unit is busy.
    #[clap(long, value_name = "N", default_value_t = 50_000)]
    pub open_attempts: u32,

    /// Milliseconds to wait between two busy attempts.
    #[clap(long, value_name = "MS", default_value = "10", value_parser = parse_millis)]
    pub open_backoff: Duration,

    /// Raw intel_pt event config, in hex.
    #[clap(long, value_name = "HEX", default_value = "0x300e601", value_parser = parse_hex)]
    pub pt_config: u64,

    /// Log every syscall the tracee makes, with its arguments.
    #[clap(long)]
    pub trace_syscalls: bool,

    /// Log every decoded instruction. Needs RUST_LOG=ropwatch=trace.
    #[clap(long)]
    pub log_instructions: bool,

    /// Wait for enter after each window.
    #[clap(long)]
    pub step: bool,

    /// Only time the traced run; no syscall stops, no analysis.
    #[clap(long)]
    pub trace_time_only: bool,

    /// Log how long each window took to decode and analyze.
    #[clap(long)]
    pub time_analysis: bool,

    /// Print the Intel PT type, perf descriptor and buffer sizes.
    #[clap(long)]
    pub pt_info: bool,

    /// Path of the program to trace.
    #[clap(value_name = "PROGRAM")]
    pub program: String,

    /// Arguments to the program to trace.
    #[clap(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    pub program_args: Vec<String>,
}

impl Arguments {
    /// Builds the run configuration. Nothing is validated here.
    pub fn config(&self) -> Config {
        Config {
            collector: CollectorConfig {
                data_pages: self.data_pages,
                aux_pages: self.aux_pages,
                trace_capacity: self.trace_capacity,
                aux_wakeup_ratio: self.aux_wakeup_ratio,
                open_attempts: self.open_attempts,
                open_backoff: self.open_backoff,
                pt_config: self.pt_config,
            },
            analyzer: AnalyzerConfig {
                strategy: self.strategy,
                initial_balance: self.initial_balance,
            },
            diagnostics: Diagnostics {
                trace_syscalls: self.trace_syscalls,
                log_instructions: self.log_instructions,
                step: self.step,
                trace_time_only: self.trace_time_only,
                time_analysis: self.time_analysis,
                pt_info: self.pt_info,
            },
            window_capacity: self.window_capacity,
        }
    }

    /// The command to run under the monitor.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.program_args);

        if self.no_host_envs {
            cmd.env_clear();
            cmd.env("PATH", "/bin/:/usr/bin");
        }

        cmd.envs(self.envs.iter().map(|(key, value)| (key, value)));
        cmd
    }

    /// Installs the global subscriber. The returned guard flushes the log
    /// file when dropped.
    pub fn init_tracing(&self) -> anyhow::Result<Option<WorkerGuard>> {
        fn set_subscriber_with_writer<T>(writer: T) -> anyhow::Result<()>
        where
            T: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
        {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_writer(writer)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
            Ok(())
        }

        let Some(log_file) = self.log_file.as_deref().and_then(unused_log_file) else {
            if self.log_file.is_some() {
                eprintln!(" [ropwatch] WARNING: could not open log file, falling back to stderr");
            }
            set_subscriber_with_writer(io::stderr)?;
            return Ok(None);
        };

        let (parent, filename) = log_file;
        let file_writer = tracing_appender::rolling::never(&parent, &filename);
        let (file_writer, guard) = tracing_appender::non_blocking(file_writer);
        eprintln!(" [ropwatch] Logging to file at {:?}", parent.join(&filename));
        set_subscriber_with_writer(file_writer)?;
        Ok(Some(guard))
    }
}

/// Picks a file name next to `path` that does not exist yet, appending a
/// timestamp if needed.
fn unused_log_file(path: &Path) -> Option<(PathBuf, PathBuf)> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_owned(),
        _ => PathBuf::from("."),
    };
    let orig_filename = path.file_name()?.to_os_string();
    let mut filename = orig_filename.clone();

    for _ in 0..100 {
        if !parent.join(&filename).exists() {
            return Some((parent, PathBuf::from(filename)));
        }
        filename = orig_filename.clone();
        filename.push(format!("{}", Local::now().format(".%Y%m%d.%H%M%S.%f")));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_config() {
        let args = Arguments::try_parse_from(["ropwatch", "/bin/true"]).unwrap();
        assert_eq!(args.config(), Config::default());
        assert_eq!(args.program, "/bin/true");
        assert!(args.program_args.is_empty());
    }

    #[test]
    fn program_arguments_are_not_ours() {
        let args = Arguments::try_parse_from([
            "ropwatch",
            "--strategy",
            "early-exit",
            "--initial-balance",
            "0",
            "ls",
            "-l",
            "/tmp",
        ])
        .unwrap();
        assert_eq!(args.program, "ls");
        assert_eq!(args.program_args, ["-l", "/tmp"]);

        let config = args.config();
        assert_eq!(config.analyzer.strategy, Strategy::EarlyExit);
        assert_eq!(config.analyzer.initial_balance, 0);
    }

    #[test]
    fn collector_flags() {
        let args = Arguments::try_parse_from([
            "ropwatch",
            "--aux-pages",
            "256",
            "--open-backoff",
            "1",
            "--pt-config",
            "0x2001",
            "--trace-syscalls",
            "--pt-info",
            "true",
        ])
        .unwrap();
        let config = args.config();
        assert!(config.diagnostics.pt_info);
        assert!(!config.diagnostics.step);
        assert_eq!(config.collector.aux_pages, 256);
        assert_eq!(config.collector.open_backoff, Duration::from_millis(1));
        assert_eq!(config.collector.pt_config, 0x2001);
        assert!(config.diagnostics.trace_syscalls);
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        assert!(Arguments::try_parse_from(["ropwatch", "--strategy", "nope", "true"]).is_err());
    }

    #[test]
    fn envs() {
        assert_eq!(
            parse_env("FOO=bar=baz").unwrap(),
            ("FOO".to_owned(), "bar=baz".to_owned())
        );
        assert!(parse_env("").is_err());

        let args =
            Arguments::try_parse_from(["ropwatch", "--no-host-envs", "-e", "A=1", "env"]).unwrap();
        let cmd = args.command();
        let envs: Vec<_> = cmd.get_envs().collect();
        assert!(envs.contains(&(std::ffi::OsStr::new("A"), Some(std::ffi::OsStr::new("1")))));
        assert!(envs.contains(&(
            std::ffi::OsStr::new("PATH"),
            Some(std::ffi::OsStr::new("/bin/:/usr/bin"))
        )));
    }

    #[test]
    fn log_file_gets_a_fresh_name() {
        let dir = std::env::temp_dir().join(format!("ropwatch-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("run.log");
        assert_eq!(
            unused_log_file(&path),
            Some((dir.clone(), PathBuf::from("run.log")))
        );

        std::fs::write(&path, b"").unwrap();
        let (parent, name) = unused_log_file(&path).unwrap();
        assert_eq!(parent, dir);
        assert!(name.to_string_lossy().starts_with("run.log."));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
