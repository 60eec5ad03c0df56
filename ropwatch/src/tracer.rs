/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The syscall-synchronized control loop.
//!
//! Every iteration captures one window: trace is enabled while the tracee
//! runs from a syscall exit to the next syscall entry, then decoded and
//! analyzed while the tracee sits at the entry stop. Capture stays off from
//! the entry to the exit, so windows hold user-mode code only.

use std::io;
use std::io::BufRead;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use std::time::Instant;

use nix::unistd::ForkResult;
use ropwatch_decoder::DecodeError;
use ropwatch_decoder::ProcessImageProvider;
use ropwatch_decoder::PtDecoder;
use ropwatch_decoder::TraceDecoder;
use ropwatch_perf::PtCollector;
use ropwatch_perf::PtInfo;
use ropwatch_perf::TraceCapture;
use ropwatch_ptrace::Errno;
use ropwatch_ptrace::Event;
use ropwatch_ptrace::ExitStatus;
use ropwatch_ptrace::Options;
use ropwatch_ptrace::Pid;
use ropwatch_ptrace::Running;
use ropwatch_ptrace::Signal;
use ropwatch_ptrace::Stopped;
use ropwatch_ptrace::Wait;
use ropwatch_ptrace::Zombie;
use syscalls::Sysno;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::analyzer::Analyzer;
use crate::analyzer::Reason;
use crate::analyzer::Verdict;
use crate::buffer::WindowBuffer;
use crate::config::Config;
use crate::error::Error;

fn trace_options() -> Options {
    Options::PTRACE_O_TRACESYSGOOD
        | Options::PTRACE_O_TRACEEXIT
        | Options::PTRACE_O_TRACEEXEC
        | Options::PTRACE_O_EXITKILL
}

/// How a run ended.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Outcome {
    /// The tracee ran to completion.
    #[default]
    NoAttackFound,
    /// A window was suspicious and the tracee was killed.
    AttackDetected { pid: Pid, reason: Reason },
}

/// Summary of a run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Report {
    pub outcome: Outcome,
    /// How the tracee ended, if it could be reaped.
    pub exit_status: Option<ExitStatus>,
    /// Windows closed by a syscall entry.
    pub windows: u64,
    /// Instructions decoded over all windows.
    pub instructions: u64,
    /// Windows that overflowed the instruction buffer.
    pub abandoned_windows: u64,
    /// Windows that could not be decoded at all.
    pub skipped_windows: u64,
    /// Errors the decoder recovered from.
    pub decode_errors: u64,
    /// Time spent decoding and analyzing.
    pub analysis_time: Duration,
    pub elapsed: Duration,
    /// The collector's event and buffers, when asked for.
    pub pt_info: Option<PtInfo>,
}

/// A process stopped at its first trace boundary, ready to be monitored.
#[derive(Debug)]
pub struct Tracee {
    stopped: Stopped,
    exe: PathBuf,
}

impl Tracee {
    pub fn pid(&self) -> Pid {
        self.stopped.pid()
    }

    /// Path of the executable the tracee runs.
    pub fn exe(&self) -> &Path {
        &self.exe
    }

    /// Kills the tracee and reaps it.
    pub fn kill(self) -> Result<Option<ExitStatus>, Error> {
        terminate(self.stopped)
    }
}

/// Waits for the first stop of a freshly started tracee and sets the trace
/// options. Other signals arriving first are delivered.
fn first_stop(mut running: Running, expected: Signal) -> Result<Stopped, Error> {
    loop {
        running = match running.wait()? {
            Wait::Stopped(stopped, Event::Signal(sig)) if sig == expected => {
                stopped.setoptions(trace_options())?;
                return Ok(stopped);
            }
            Wait::Stopped(stopped, Event::Signal(sig)) => stopped.resume(sig)?,
            Wait::Stopped(stopped, _) => stopped.resume(None)?,
            Wait::Exited(pid, status) => return Err(Error::EarlyExit { pid, status }),
        };
    }
}

/// Starts `command` as a tracee. It is stopped right after its `execve`.
pub fn spawn(mut command: Command) -> Result<Tracee, Error> {
    let program = command.get_program().to_string_lossy().into_owned();

    // SAFETY: `traceme` is a single syscall and does not allocate.
    unsafe {
        command.pre_exec(|| {
            ropwatch_ptrace::traceme().map_err(|err| io::Error::from_raw_os_error(err.into_raw()))
        });
    }
    let child = command
        .spawn()
        .map_err(|source| Error::Spawn { program, source })?;
    let pid = Pid::from_raw(child.id() as i32);

    // The exec of a tracee raises SIGTRAP once the new image is in place.
    let stopped = first_stop(Running::new(pid), Signal::SIGTRAP)?;
    let exe = std::fs::read_link(format!("/proc/{}/exe", pid))
        .unwrap_or_else(|_| PathBuf::from(command.get_program()));
    debug!("tracee {} started: {}", pid, exe.display());
    Ok(Tracee { stopped, exe })
}

/// Runs `f` in a forked child as a tracee. The child stops itself before
/// calling `f` and exits with 0 when `f` returns (1 if it panics).
///
/// The main use case is testing.
pub fn spawn_fn<F: FnOnce()>(f: F) -> Result<Tracee, Error> {
    // Warning: fork is wildly unsafe in Rust because of runtime issues
    // (printing, panicking, etc). The child only makes raw syscalls before
    // running `f`.
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Child) => {
            // The raw kill makes the SIGSTOP land on the way out of this very
            // syscall, so the first window starts right here.
            let stopped = ropwatch_ptrace::traceme().is_ok()
                && unsafe { libc::syscall(libc::SYS_kill, libc::getpid(), libc::SIGSTOP) } == 0;
            if !stopped {
                unsafe { libc::_exit(127) };
            }
            let code = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            std::process::exit(code)
        }
        Ok(ForkResult::Parent { child }) => {
            let stopped = first_stop(Running::new(child), Signal::SIGSTOP)?;
            let exe = std::env::current_exe()?;
            Ok(Tracee { stopped, exe })
        }
        Err(err) => Err(Error::Spawn {
            program: "<fork>".to_owned(),
            source: io::Error::from_raw_os_error(err as i32),
        }),
    }
}

fn reap(zombie: Zombie) -> Result<Option<ExitStatus>, Error> {
    match zombie.reap() {
        Ok(status) => Ok(Some(status)),
        // Somebody else reaped it.
        Err(ropwatch_ptrace::Error::Errno(Errno::ECHILD)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn terminate(stopped: Stopped) -> Result<Option<ExitStatus>, Error> {
    match stopped.kill() {
        Ok(zombie) | Err(ropwatch_ptrace::Error::Died(zombie)) => reap(zombie),
        Err(err) => Err(err.into()),
    }
}

/// Where resuming the tracee left us.
enum Boundary {
    Syscall(Stopped),
    Exited(Option<ExitStatus>),
}

/// Resumes the tracee until it stops at the next syscall entry or exit.
/// Signals are delivered on the way. An exec event sets `exec_seen`.
fn next_syscall_stop(stopped: Stopped, exec_seen: &mut bool) -> Result<Boundary, Error> {
    let mut resumed = stopped.syscall(None);
    loop {
        let running = match resumed {
            Ok(running) => running,
            Err(ropwatch_ptrace::Error::Died(zombie)) => return reap(zombie).map(Boundary::Exited),
            Err(err) => return Err(err.into()),
        };
        resumed = match running.wait() {
            Ok(Wait::Stopped(stopped, Event::Syscall)) => return Ok(Boundary::Syscall(stopped)),
            Ok(Wait::Stopped(stopped, Event::Signal(sig))) => {
                debug!("delivering {} to tracee {}", sig, stopped.pid());
                stopped.syscall(sig)
            }
            Ok(Wait::Stopped(stopped, Event::Exec(_))) => {
                info!("tracee {} called execve", stopped.pid());
                *exec_seen = true;
                stopped.syscall(None)
            }
            Ok(Wait::Stopped(stopped, _)) => stopped.syscall(None),
            Ok(Wait::Exited(_, status)) => return Ok(Boundary::Exited(Some(status))),
            Err(ropwatch_ptrace::Error::Died(zombie)) => return reap(zombie).map(Boundary::Exited),
            Err(ropwatch_ptrace::Error::Errno(Errno::ECHILD)) => return Ok(Boundary::Exited(None)),
            Err(err) => return Err(err.into()),
        };
    }
}

/// Logs the syscall the tracee is stopped at.
fn log_syscall(stopped: &Stopped) -> Result<(), Error> {
    let regs = match stopped.getregs() {
        Ok(regs) => regs,
        // Reported by the next wait.
        Err(ropwatch_ptrace::Error::Died(_)) => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let name = match Sysno::new(regs.orig_rax as usize) {
        Some(sysno) => sysno.to_string(),
        None => format!("syscall_{}", regs.orig_rax),
    };
    info!(
        "[{}] {}({:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x})",
        stopped.pid(),
        name,
        regs.rdi,
        regs.rsi,
        regs.rdx,
        regs.r10,
        regs.r8,
        regs.r9
    );
    Ok(())
}

fn wait_for_enter() -> Result<(), Error> {
    info!("window done, press enter to continue");
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}

/// Drives one tracee: captures, decodes and analyzes a window per syscall.
pub struct TracerLoop<C, D> {
    config: Config,
    capture: C,
    decoder: D,
    buffer: WindowBuffer,
    analyzer: Analyzer,
}

impl<C, D> TracerLoop<C, D>
where
    C: TraceCapture,
    D: TraceDecoder,
{
    pub fn new(config: Config, capture: C, decoder: D) -> Self {
        let buffer = WindowBuffer::new(config.window_capacity);
        let analyzer = Analyzer::new(config.analyzer);
        Self {
            config,
            capture,
            decoder,
            buffer,
            analyzer,
        }
    }

    pub fn capture(&self) -> &C {
        &self.capture
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Monitors `tracee` until it exits or is killed for a suspicious window.
    pub fn run(&mut self, tracee: Tracee) -> Result<Report, Error> {
        let started = Instant::now();
        let pid = tracee.pid();
        let mut report = Report::default();

        if self.config.diagnostics.trace_time_only {
            report.exit_status = self.run_to_completion(tracee.stopped)?;
            report.elapsed = started.elapsed();
            info!("tracee {} ran for {:?} under trace", pid, report.elapsed);
            return Ok(report);
        }

        let mut first_window = true;
        let mut stopped = tracee.stopped;
        loop {
            self.capture.reset_and_enable()?;
            let boundary = next_syscall_stop(stopped, &mut first_window);
            self.capture.disable()?;
            let entry = match boundary? {
                Boundary::Syscall(entry) => entry,
                Boundary::Exited(status) => {
                    report.exit_status = status;
                    break;
                }
            };

            report.windows += 1;
            if self.config.diagnostics.trace_syscalls {
                log_syscall(&entry)?;
            }

            if let Some(reason) = self.analyze_window(report.windows, &mut first_window, &mut report)
            {
                warn!(
                    pid = pid.as_raw(),
                    window = report.windows,
                    "{}, killing tracee",
                    reason
                );
                report.exit_status = terminate(entry)?;
                report.outcome = Outcome::AttackDetected { pid, reason };
                break;
            }

            if self.config.diagnostics.step {
                wait_for_enter()?;
            }

            stopped = match next_syscall_stop(entry, &mut first_window)? {
                Boundary::Syscall(exit) => exit,
                Boundary::Exited(status) => {
                    report.exit_status = status;
                    break;
                }
            };
        }

        report.elapsed = started.elapsed();
        info!(
            pid = pid.as_raw(),
            windows = report.windows,
            instructions = report.instructions,
            "run finished: {:?}",
            report.outcome
        );
        Ok(report)
    }

    /// Decodes and analyzes the window just captured. Returns the reason if
    /// it is suspicious.
    fn analyze_window(
        &mut self,
        window: u64,
        first_window: &mut bool,
        report: &mut Report,
    ) -> Option<Reason> {
        let log_instructions = self.config.diagnostics.log_instructions;
        let started = Instant::now();

        let bytes = self.capture.current_window();
        if bytes.is_truncated() {
            warn!(window, "trace ring filled up, window is missing its newest packets");
        }
        let cursor = if *first_window {
            self.decoder.initialize(bytes.bytes())
        } else {
            self.decoder.resync(bytes.bytes())
        };
        let cursor = match cursor {
            Ok(cursor) => {
                *first_window = false;
                cursor
            }
            Err(DecodeError::EndOfStream) => {
                *first_window = false;
                debug!(window, "empty trace window");
                report.skipped_windows += 1;
                return None;
            }
            Err(err) => {
                warn!(window, "cannot decode window: {}", err);
                report.skipped_windows += 1;
                return None;
            }
        };

        self.buffer.clear();
        let mut overflow = None;
        for item in cursor {
            match item {
                Ok(record) => {
                    if log_instructions {
                        trace!(window, "{:#x} {:?} {:02x?}", record.ip, record.class, record.bytes());
                    }
                    if let Err(err) = self.buffer.push(record) {
                        overflow = Some(err);
                        break;
                    }
                }
                Err(DecodeError::EndOfStream) => break,
                Err(err) => {
                    report.decode_errors += 1;
                    debug!(window, "decode error: {}", err);
                }
            }
        }
        report.instructions += self.buffer.len() as u64;

        let verdict = match overflow {
            Some(err) => {
                warn!(window, "{}, abandoning window", err);
                report.abandoned_windows += 1;
                Verdict::Consistent
            }
            None => self.analyzer.evaluate(self.buffer.as_slice()),
        };

        let spent = started.elapsed();
        report.analysis_time += spent;
        if self.config.diagnostics.time_analysis {
            info!(window, instructions = self.buffer.len(), "analysis took {:?}", spent);
        }

        match verdict {
            Verdict::Consistent => None,
            Verdict::Suspicious(reason) => Some(reason),
        }
    }

    /// Captures the whole run in one go, without stopping at syscalls.
    fn run_to_completion(&mut self, stopped: Stopped) -> Result<Option<ExitStatus>, Error> {
        self.capture.reset_and_enable()?;
        let mut resumed = stopped.resume(None);
        let status = loop {
            let running = match resumed {
                Ok(running) => running,
                Err(ropwatch_ptrace::Error::Died(zombie)) => break reap(zombie)?,
                Err(err) => return Err(err.into()),
            };
            resumed = match running.wait()? {
                Wait::Stopped(stopped, Event::Signal(sig)) => stopped.resume(sig),
                Wait::Stopped(stopped, _) => stopped.resume(None),
                Wait::Exited(_, status) => break Some(status),
            };
        };
        self.capture.disable()?;
        Ok(status)
    }
}

/// Runs `command` under the monitor with real Intel PT capture.
pub fn monitor(command: Command, config: Config) -> Result<Report, Error> {
    config.validate()?;
    let tracee = spawn(command)?;
    let pid = tracee.pid();

    let capture = match PtCollector::open(pid.as_raw(), &config.collector) {
        Ok(capture) => capture,
        Err(err) => {
            if let Err(kill_err) = tracee.kill() {
                warn!("failed to kill tracee {}: {}", pid, kill_err);
            }
            return Err(err.into());
        }
    };
    let pt_info = config.diagnostics.pt_info.then(|| capture.info());
    if let Some(pt_info) = &pt_info {
        info!("collector for tracee {}:\n{}", pid, pt_info);
    }

    let decoder = PtDecoder::new(ProcessImageProvider::new(pid.as_raw()), tracee.exe());
    let mut report = TracerLoop::new(config, capture, decoder).run(tracee)?;
    report.pt_info = pt_info;
    Ok(report)
}
