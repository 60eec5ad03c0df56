/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![cfg(target_os = "linux")]

//! A safe ptrace API for driving a single tracee from one syscall stop to the
//! next. The API makes it impossible to issue a ptrace request against a
//! process that has not been observed in a stopped state: requests are only
//! available on [`Stopped`], and resuming consumes it and hands back a
//! [`Running`] that can only be waited on.
mod exit_status;

use core::mem::MaybeUninit;
use std::fmt;

use nix::sys::ptrace;
// Re-exports so that nothing else needs to depend on `nix`.
pub use nix::sys::ptrace::Options;
pub use nix::sys::signal::Signal;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
pub use nix::unistd::Pid;
pub use syscalls::Errno;
use syscalls::Sysno;
use thiserror::Error;

pub use crate::exit_status::ExitStatus;

/// General purpose registers of the tracee.
pub type Regs = libc::user_regs_struct;

/// An error that occurred during tracing.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum Error {
    /// A low-level errno.
    #[error(transparent)]
    Errno(#[from] Errno),

    /// The tracee died while we believed it to be stopped. This is not a
    /// failure of the tracer; the zombie should be reaped to learn how it
    /// exited.
    #[error("tracee {0} is a zombie")]
    Died(Zombie),
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Self::Errno(Errno::new(err as i32))
    }
}

/// A stop event. Documentation is from `ptrace(2)`.
#[derive(Debug, Eq, PartialEq)]
pub enum Event {
    /// Stop before return from `execve(2)`. `PTRACE_GETEVENTMSG` returns the
    /// former thread ID.
    Exec(Pid),

    /// Stop before exit (including death from `exit_group(2)`) or signal
    /// death. Registers can still be examined. The tracee needs to be resumed
    /// to finish exiting.
    Exit,

    /// Group-stop or `PTRACE_EVENT_STOP`.
    Stop,

    /// The tracee was stopped on entry to or exit from a system call. Only
    /// reported this way when `PTRACE_O_TRACESYSGOOD` is set.
    Syscall,

    /// The tracee was stopped by delivery of a signal.
    Signal(Signal),

    /// A ptrace event this crate does not enable (fork, clone, seccomp...).
    Other(i32),
}

impl Event {
    /// Converts a raw ptrace event and fetches any associated data.
    fn from_ptrace_event(task: &Stopped, event: i32) -> Result<Self, Error> {
        // The process is guaranteed to be in a ptrace-stop when this is
        // called, so querying the event message is safe.
        match event {
            libc::PTRACE_EVENT_EXEC => {
                let former = Pid::from_raw(task.getevent()? as i32);
                Ok(Self::Exec(former))
            }
            libc::PTRACE_EVENT_EXIT => Ok(Self::Exit),
            libc::PTRACE_EVENT_STOP => Ok(Self::Stop),
            other => Ok(Self::Other(other)),
        }
    }
}

/// Blocks on `waitpid` for exactly one process, retrying on `EINTR`.
fn wait(pid: Pid) -> Result<WaitStatus, Errno> {
    loop {
        match nix::sys::wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Err(nix::errno::Errno::EINTR) => continue,
            result => return result.map_err(|err| Errno::new(err as i32)),
        }
    }
}

/// The result of a blocking wait. A process in this state is guaranteed to not
/// be running.
///
/// Both `Clone` and `Copy` are intentionally not implemented. This is to enforce
/// type safety.
#[derive(Debug, Eq, PartialEq)]
pub enum Wait {
    /// The process is stopped and ptrace requests may be issued against it.
    Stopped(Stopped, Event),

    /// The process has exited with an exit status.
    Exited(Pid, ExitStatus),
}

impl Wait {
    /// Returns the PID for this state.
    pub fn pid(&self) -> Pid {
        match self {
            Self::Stopped(Stopped(pid), _) => *pid,
            Self::Exited(pid, _) => *pid,
        }
    }

    /// Assumes the process is in a stopped state. Panics if it isn't.
    pub fn assume_stopped(self) -> (Stopped, Event) {
        match self {
            Self::Stopped(stopped, event) => (stopped, event),
            state => panic!("expected a stopped process, got {}", state),
        }
    }

    /// Assumes the process is in an exited state. Panics if it isn't.
    pub fn assume_exited(self) -> (Pid, ExitStatus) {
        match self {
            Self::Exited(pid, exit_status) => (pid, exit_status),
            state => panic!("expected an exited process, got {}", state),
        }
    }
}

impl TryFrom<WaitStatus> for Wait {
    type Error = Error;

    /// Converts a `WaitStatus` to this type.
    ///
    /// Preconditions:
    /// The status was obtained by a blocking wait without `WCONTINUED`.
    fn try_from(wait_status: WaitStatus) -> Result<Self, Error> {
        Ok(match wait_status {
            WaitStatus::Exited(pid, code) => Self::Exited(pid, ExitStatus::Exited(code)),
            WaitStatus::Signaled(pid, sig, coredump) => {
                Self::Exited(pid, ExitStatus::Signaled(sig, coredump))
            }
            WaitStatus::Stopped(pid, sig) => Self::Stopped(Stopped(pid), Event::Signal(sig)),
            WaitStatus::PtraceEvent(pid, _sig, event) => {
                let task = Stopped(pid);
                let event = Event::from_ptrace_event(&task, event)?;
                Self::Stopped(task, event)
            }
            WaitStatus::PtraceSyscall(pid) => Self::Stopped(Stopped(pid), Event::Syscall),
            WaitStatus::Continued(_) | WaitStatus::StillAlive => {
                // Neither WCONTINUED nor WNOHANG is ever passed to waitpid.
                return Err(Error::Errno(Errno::EINVAL));
            }
        })
    }
}

impl fmt::Display for Wait {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Stopped(stopped, event) => {
                write!(f, "pid {} stopped ({:?})", stopped.pid(), event)
            }
            Self::Exited(pid, exit_status) => write!(f, "pid {} {}", pid, exit_status),
        }
    }
}

/// A process that is in a stopped state and allows ptrace operations to be
/// performed.
#[derive(Debug, Hash, Eq, PartialEq)]
pub struct Stopped(Pid);

impl Stopped {
    /// Converts an errno from a ptrace request into an [`Error`].
    ///
    /// Any ptrace request may fail with `ESRCH` if the tracee died while
    /// stopped, if it is not traced by the caller, or if it is not stopped.
    /// The last two are ruled out by this API, so `ESRCH` means the tracee
    /// is gone. See "Death under ptrace" in `man 2 ptrace`.
    fn map_err(&self, err: Errno) -> Error {
        if err == Errno::ESRCH {
            Error::Died(Zombie::new(self.0))
        } else {
            Error::Errno(err)
        }
    }

    fn map_nix_err(&self, err: nix::Error) -> Error {
        self.map_err(Errno::new(err as i32))
    }

    /// Returns the process ID of the tracee.
    pub fn pid(&self) -> Pid {
        self.0
    }

    /// Sets the ptracer options.
    pub fn setoptions(&self, options: Options) -> Result<(), Error> {
        ptrace::setoptions(self.0, options).map_err(|err| self.map_nix_err(err))
    }

    /// Gets the general purpose registers.
    pub fn getregs(&self) -> Result<Regs, Error> {
        let mut regs = MaybeUninit::<Regs>::uninit();

        let mut iov = libc::iovec {
            iov_base: regs.as_mut_ptr() as *mut libc::c_void,
            iov_len: core::mem::size_of::<Regs>(),
        };

        unsafe {
            syscalls::syscall!(
                Sysno::ptrace,
                libc::PTRACE_GETREGSET,
                self.0.as_raw(),
                libc::NT_PRSTATUS,
                &mut iov as *mut _
            )
        }
        .map_err(|err| self.map_err(err))?;

        debug_assert_eq!(iov.iov_len, core::mem::size_of::<Regs>());

        Ok(unsafe { regs.assume_init() })
    }

    /// Gets the ptrace event message (`PTRACE_GETEVENTMSG`).
    pub fn getevent(&self) -> Result<i64, Error> {
        ptrace::getevent(self.0).map_err(|err| self.map_nix_err(err))
    }

    /// Resumes the tracee (`PTRACE_CONT`), optionally delivering a signal.
    pub fn resume<T: Into<Option<Signal>>>(self, sig: T) -> Result<Running, Error> {
        ptrace::cont(self.0, sig.into()).map_err(|err| self.map_nix_err(err))?;
        Ok(Running(self.0))
    }

    /// Resumes the tracee until the next syscall entry or exit
    /// (`PTRACE_SYSCALL`), optionally delivering a signal.
    pub fn syscall<T: Into<Option<Signal>>>(self, sig: T) -> Result<Running, Error> {
        ptrace::syscall(self.0, sig.into()).map_err(|err| self.map_nix_err(err))?;
        Ok(Running(self.0))
    }

    /// Sends `SIGKILL` to the tracee. A stopped tracee is woken up by it, so
    /// the result is a running process that only remains to be reaped.
    pub fn kill(self) -> Result<Zombie, Error> {
        nix::sys::signal::kill(self.0, Signal::SIGKILL).map_err(|err| self.map_nix_err(err))?;
        Ok(Zombie::new(self.0))
    }
}

/// A running child.
#[derive(Debug, Hash, Eq, PartialEq)]
pub struct Running(Pid);

impl Running {
    /// Creates a new running process. This is generally the entry point for a
    /// new process as soon as it is created.
    pub fn new(pid: Pid) -> Self {
        Running(pid)
    }

    /// Returns the pid of the running process.
    pub fn pid(&self) -> Pid {
        self.0
    }

    /// Blocks until a state change occurs. This may transition the process to
    /// either a stopped state or exited state, but never a running state.
    pub fn wait(self) -> Result<Wait, Error> {
        wait(self.0)
            .map_err(Error::from)
            .and_then(Wait::try_from)
    }
}

/// A process that is no longer running, but hasn't yet fully exited. The only
/// thing a zombie can do is exit.
#[derive(Debug, Hash, Eq, PartialEq)]
pub struct Zombie(Running);

impl Zombie {
    fn new(pid: Pid) -> Self {
        Zombie(Running(pid))
    }

    /// Returns the PID of the zombie.
    pub fn pid(&self) -> Pid {
        self.0.pid()
    }

    /// Reaps the zombie by waiting for it to fully exit.
    ///
    /// The tracee may still report a `PTRACE_EVENT_EXIT` stop (see the "BUGS"
    /// section of `man 2 ptrace`); such stops are resumed until the final
    /// exit is observed. Fails with `ECHILD` if somebody else already reaped
    /// the process.
    pub fn reap(self) -> Result<ExitStatus, Error> {
        let mut next_state = self.0.wait();

        loop {
            match next_state {
                Ok(Wait::Exited(_pid, exit_status)) => break Ok(exit_status),
                Ok(Wait::Stopped(stopped, event)) => {
                    let sig = match event {
                        Event::Signal(sig) if sig != Signal::SIGSTOP => Some(sig),
                        _ => None,
                    };
                    next_state = match stopped.resume(sig) {
                        Ok(running) => running.wait(),
                        Err(err) => Err(err),
                    };
                }
                Err(Error::Died(zombie)) => next_state = zombie.0.wait(),
                Err(err) => break Err(err),
            }
        }
    }
}

impl fmt::Display for Zombie {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.pid())
    }
}

/// Makes the calling process a tracee of its parent (`PTRACE_TRACEME`). Meant
/// to run in a freshly forked child right before `execve`; the exec then
/// stops the child with a `SIGTRAP`.
pub fn traceme() -> Result<(), Errno> {
    ptrace::traceme().map_err(|e| Errno::new(e as i32))
}
