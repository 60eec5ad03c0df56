/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An Intel PT perf event bound to one process, with its ring buffer mapped
//! into our address space.
//!
//! The arguments and behaviors here correspond to those of
//! `perf_event_open(2)` and the AUX area ABI described in
//! `include/uapi/linux/perf_event.h`. The layout is:
//!
//! ```text
//! [ control page | data region (data_pages) ]   [ aux region (aux_pages) ]
//!   ^ mapped at offset 0                           ^ mapped at aux_offset
//! ```
//!
//! The aux region is mapped writable, which puts it in non-overwrite mode:
//! the kernel only reuses bytes once `aux_tail` has been advanced past them.

use core::ptr::NonNull;
use std::fmt;
use std::ptr::addr_of_mut;
use std::thread;
use std::time::Duration;

use nix::unistd::sysconf;
use nix::unistd::SysconfVar;
use perf_event_open_sys::bindings as perf;
use perf_event_open_sys::ioctls;
use syscalls::Errno;
use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::config::CollectorConfig;
use crate::error::CloseError;
use crate::error::CollectorError;
use crate::error::Region;
use crate::error::Resource;
use crate::probe;
use crate::window::locate;
use crate::window::Span;
use crate::window::TraceWindow;
use crate::TraceCapture;

/// One `mmap`ed range.
#[derive(Debug)]
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    fn map(fd: libc::c_int, len: usize, offset: u64, region: Region) -> Result<Self, CollectorError> {
        let ptr = Errno::result(unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        })
        .map_err(|errno| CollectorError::MappingFailed { region, errno })?;

        let ptr = NonNull::new(ptr as *mut u8).ok_or(CollectorError::MappingFailed {
            region,
            errno: Errno::EFAULT,
        })?;

        Ok(Self { ptr, len })
    }

    fn unmap(self) -> Result<(), Errno> {
        Errno::result(unsafe { libc::munmap(self.ptr.as_ptr() as *mut _, self.len) }).map(drop)
    }

    fn header(&self) -> *mut perf::perf_event_mmap_page {
        self.ptr.as_ptr() as *mut perf::perf_event_mmap_page
    }

    /// SAFETY: the mapping must still be alive.
    unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

/// Retries `open` while it fails with `EBUSY`, which is what the kernel
/// reports when another event already owns the PT unit. Any other error is
/// returned immediately.
pub fn retry_while_busy<T, F>(
    attempts: u32,
    backoff: Duration,
    mut open: F,
) -> Result<T, CollectorError>
where
    F: FnMut() -> Result<T, Errno>,
{
    for attempt in 1..=attempts {
        match open() {
            Err(Errno::EBUSY) => {
                trace!(attempt, "perf_event_open: PT unit busy");
                if attempt < attempts {
                    thread::sleep(backoff);
                }
            }
            Err(Errno::ENOENT) | Err(Errno::ENODEV) | Err(Errno::EOPNOTSUPP) => {
                return Err(CollectorError::Unsupported(
                    "the kernel rejected the intel_pt event".to_owned(),
                ));
            }
            result => return result.map_err(CollectorError::from),
        }
    }
    Err(CollectorError::ResourceBusy { attempts })
}

/// Where an opened PT event lives: the PMU it was opened on, its descriptor
/// and the sizes of its two mappings.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PtInfo {
    pub pmu_type: u32,
    pub fd: Option<libc::c_int>,
    /// Control page plus data region, in bytes.
    pub base_size: usize,
    /// Trace ring, in bytes.
    pub aux_size: usize,
}

impl fmt::Display for PtInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Intel PT type: {}", self.pmu_type)?;
        match self.fd {
            Some(fd) => writeln!(f, "perf fd: {}", fd)?,
            None => writeln!(f, "perf fd: closed")?,
        }
        writeln!(f, "Aux buffer size: {}", self.aux_size)?;
        write!(f, "Base buffer size: {}", self.base_size)
    }
}

/// Captures Intel PT packets for a single process. Construct via
/// [`PtCollector::open`].
#[derive(Debug)]
pub struct PtCollector {
    pmu_type: u32,
    fd: Option<libc::c_int>,
    base: Option<Mapping>,
    aux: Option<Mapping>,
    enabled: bool,
    /// Free-running aux offset up to which bytes have been handed out.
    consumed: u64,
    /// `aux_head` observed by the last `disable`.
    head: u64,
    span: Span,
    truncated: bool,
    /// Linear copy of a window that wraps around the end of the ring.
    scratch: Vec<u8>,
}

impl PtCollector {
    /// Opens a disabled PT event for `pid` (on any CPU) and maps its ring
    /// buffer. Call [`TraceCapture::reset_and_enable`] to start capturing.
    pub fn open(pid: libc::pid_t, config: &CollectorConfig) -> Result<Self, CollectorError> {
        config.validate()?;

        let pmu_type = probe::read_pt_pmu_type(std::path::Path::new(probe::PT_TYPE_PATH))?;
        let page_size = page_size()?;

        let mut attr = perf::perf_event_attr::default();
        attr.size = core::mem::size_of_val(&attr) as u32;
        attr.type_ = pmu_type;
        attr.config = config.pt_config;
        attr.set_disabled(1); // capture is bracketed around syscalls
        attr.set_exclude_kernel(1); // only the tracee's user-mode code matters
        attr.set_exclude_hv(1);
        attr.set_precise_ip(3);
        attr.set_watermark(1);
        attr.__bindgen_anon_2.wakeup_watermark = 1;
        attr.aux_watermark = config.aux_watermark(page_size);

        let fd = retry_while_busy(config.open_attempts, config.open_backoff, || {
            Errno::result(unsafe {
                libc::syscall(
                    libc::SYS_perf_event_open,
                    &attr,
                    pid,
                    -1 as libc::c_int,
                    -1 as libc::c_int,
                    perf::PERF_FLAG_FD_CLOEXEC,
                )
            })
        })? as libc::c_int;

        let mut collector = Self::unopened(config.trace_capacity);
        collector.pmu_type = pmu_type;
        collector.fd = Some(fd);

        // On failure, dropping the partially built collector releases
        // whatever was acquired so far.
        collector.map(config, page_size)?;

        debug!(
            pid,
            fd,
            data_pages = config.data_pages,
            aux_pages = config.aux_pages,
            "opened intel_pt event"
        );

        Ok(collector)
    }

    fn unopened(trace_capacity: usize) -> Self {
        Self {
            pmu_type: 0,
            fd: None,
            base: None,
            aux: None,
            enabled: false,
            consumed: 0,
            head: 0,
            span: Span::Empty,
            truncated: false,
            scratch: Vec::with_capacity(trace_capacity),
        }
    }

    fn map(&mut self, config: &CollectorConfig, page_size: usize) -> Result<(), CollectorError> {
        let fd = self.fd.ok_or(CollectorError::Closed)?;

        let base_len = (1 + config.data_pages) * page_size;
        let base = self
            .base
            .insert(Mapping::map(fd, base_len, 0, Region::Base)?);
        let header = base.header();

        let aux_len = config.aux_bytes(page_size);

        // The aux geometry must be published in the control page before the
        // aux region is mapped; the kernel reads it back in its mmap handler.
        let aux_offset = unsafe {
            let data_offset = std::ptr::read_volatile(addr_of_mut!((*header).data_offset));
            let data_size = std::ptr::read_volatile(addr_of_mut!((*header).data_size));
            let aux_offset = if data_offset == 0 {
                base_len as u64
            } else {
                data_offset + data_size
            };
            std::ptr::write_volatile(addr_of_mut!((*header).aux_offset), aux_offset);
            std::ptr::write_volatile(addr_of_mut!((*header).aux_size), aux_len as u64);
            aux_offset
        };

        self.aux = Some(Mapping::map(fd, aux_len, aux_offset, Region::Aux)?);

        unsafe {
            debug!(
                time_shift = (*header).time_shift,
                time_mult = (*header).time_mult,
                time_zero = (*header).time_zero,
                aux_offset,
                aux_len,
                "perf control page"
            );
        }

        Ok(())
    }

    fn header(&self) -> Option<*mut perf::perf_event_mmap_page> {
        self.base.as_ref().map(Mapping::header)
    }

    /// Size of the aux ring in bytes, or 0 once closed.
    pub fn aux_size(&self) -> usize {
        self.aux.as_ref().map_or(0, |aux| aux.len)
    }

    /// The event's PMU, descriptor and mapping sizes. Descriptor and sizes
    /// are gone once closed.
    pub fn info(&self) -> PtInfo {
        PtInfo {
            pmu_type: self.pmu_type,
            fd: self.fd,
            base_size: self.base.as_ref().map_or(0, |base| base.len),
            aux_size: self.aux_size(),
        }
    }

    /// Records where the bytes written since the last enable live.
    fn snapshot(&mut self) {
        let (Some(header), Some(aux)) = (self.header(), self.aux.as_ref()) else {
            return;
        };

        // SAFETY: the control page stays mapped for as long as `self.base`.
        let head = unsafe { read_once(addr_of_mut!((*header).aux_head)) };
        smp_rmb(); // aux bytes must be read after aux_head

        let (span, truncated) = locate(self.consumed, head, aux.len);
        if let Span::Wrapped { start, first, len } = span {
            // SAFETY: the aux mapping is alive and the producer is stopped.
            let ring = unsafe { aux.as_slice() };
            self.scratch.clear();
            self.scratch.extend_from_slice(&ring[start..start + first]);
            self.scratch.extend_from_slice(&ring[..len - first]);
        }

        if truncated {
            debug!(head, consumed = self.consumed, "aux ring saturated");
        }

        self.head = head;
        self.span = span;
        self.truncated = truncated;
    }

    /// Gives the bytes of the previous window back to the kernel.
    fn release(&mut self) {
        if let Some(header) = self.header() {
            smp_mb(); // finish reading the aux bytes before publishing the tail
            // SAFETY: the control page stays mapped for as long as `self.base`.
            unsafe { write_once(addr_of_mut!((*header).aux_tail), self.head) };
        }
        self.consumed = self.head;
        self.span = Span::Empty;
        self.truncated = false;
    }

    /// Releases the mappings and the file descriptor. Safe to call any number
    /// of times and on a partially opened collector; each resource is
    /// released at most once, and failures are reported rather than retried.
    pub fn close(&mut self) -> Result<(), CloseError> {
        let mut failures = Vec::new();

        self.enabled = false;
        self.span = Span::Empty;

        if let Some(aux) = self.aux.take() {
            if let Err(errno) = aux.unmap() {
                failures.push((Resource::Mapping(Region::Aux), errno));
            }
        }
        if let Some(base) = self.base.take() {
            if let Err(errno) = base.unmap() {
                failures.push((Resource::Mapping(Region::Base), errno));
            }
        }
        if let Some(fd) = self.fd.take() {
            if let Err(errno) = Errno::result(unsafe { libc::close(fd) }) {
                failures.push((Resource::Descriptor, errno));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CloseError { failures })
        }
    }
}

impl TraceCapture for PtCollector {
    fn reset_and_enable(&mut self) -> Result<(), CollectorError> {
        let fd = self.fd.ok_or(CollectorError::Closed)?;
        if self.enabled {
            return Ok(());
        }

        self.release();
        Errno::result(unsafe { ioctls::RESET(fd, 0) })?;
        Errno::result(unsafe { ioctls::ENABLE(fd, 0) })?;
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), CollectorError> {
        let Some(fd) = self.fd else {
            return Ok(());
        };
        if !self.enabled {
            return Ok(());
        }

        Errno::result(unsafe { ioctls::DISABLE(fd, 0) })?;
        self.enabled = false;
        self.snapshot();
        Ok(())
    }

    fn current_window(&self) -> TraceWindow<'_> {
        let Some(aux) = self.aux.as_ref() else {
            return TraceWindow::empty();
        };
        match self.span {
            Span::Empty => TraceWindow::empty(),
            Span::Direct { start, len } => {
                // SAFETY: the mapping outlives the borrow of `self`, and the
                // producer is stopped until the next `reset_and_enable`,
                // which needs `&mut self`.
                let ring = unsafe { aux.as_slice() };
                TraceWindow::new(&ring[start..start + len], self.truncated)
            }
            Span::Wrapped { .. } => TraceWindow::new(&self.scratch, self.truncated),
        }
    }
}

impl Drop for PtCollector {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("closing the PT collector: {}", err);
        }
    }
}

// Safety:
// The mappings are only touched through `&mut self` (or `&self` while the
// producer is disabled), so moving the collector to another thread is fine.
unsafe impl Send for PtCollector {}

fn page_size() -> Result<usize, CollectorError> {
    sysconf(SysconfVar::PAGE_SIZE)?
        .and_then(|size| usize::try_from(size).ok())
        .ok_or_else(|| CollectorError::Unsupported("unknown page size".to_owned()))
}

/// Force a relaxed atomic load. Like Linux's READ_ONCE.
/// SAFETY: caller must ensure v points to valid data and is aligned
#[inline(always)]
#[deny(unsafe_op_in_unsafe_fn)]
unsafe fn read_once(v: *mut u64) -> u64 {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering::Relaxed;
    // SAFETY: AtomicU64 has the same in-memory representation as u64 and the
    // reference does not escape this function.
    let av: &AtomicU64 = unsafe { &*(v as *const AtomicU64) };
    av.load(Relaxed)
}

/// Force a relaxed atomic store. Like Linux's WRITE_ONCE.
/// SAFETY: caller must ensure v points to valid data and is aligned
#[inline(always)]
#[deny(unsafe_op_in_unsafe_fn)]
unsafe fn write_once(v: *mut u64, value: u64) {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering::Relaxed;
    // SAFETY: see `read_once`.
    let av: &AtomicU64 = unsafe { &*(v as *const AtomicU64) };
    av.store(value, Relaxed)
}

#[inline(always)]
fn smp_rmb() {
    use std::sync::atomic::fence;
    use std::sync::atomic::Ordering::Acquire;
    fence(Acquire);
}

#[inline(always)]
fn smp_mb() {
    use std::sync::atomic::fence;
    use std::sync::atomic::Ordering::SeqCst;
    fence(SeqCst);
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::ret_without_pt;

    /// Perform exactly `count+1` conditional branch instructions.
    #[inline(never)]
    fn do_branches(mut count: u64) {
        // Anything but assembly is unreliable between debug and release
        unsafe {
            core::arch::asm!(
                "2:",
                "sub {0}, 1",
                "jnz 2b",
                inout(reg) count,
            )
        }
        assert_eq!(count, 0);
    }

    #[test]
    fn busy_retries_are_bounded() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_while_busy(3, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            Err(Errno::EBUSY)
        });
        assert_eq!(result, Err(CollectorError::ResourceBusy { attempts: 3 }));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn busy_then_available() {
        let calls = Cell::new(0);
        let result = retry_while_busy(5, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Errno::EBUSY)
            } else {
                Ok(7)
            }
        });
        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_while_busy(5, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            Err(Errno::EACCES)
        });
        assert_eq!(result, Err(CollectorError::Errno(Errno::EACCES)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn close_is_idempotent_on_unopened_collector() {
        let mut collector = PtCollector::unopened(0);
        assert_eq!(collector.close(), Ok(()));
        assert_eq!(collector.close(), Ok(()));
        assert_eq!(collector.disable(), Ok(()));
        assert_eq!(collector.reset_and_enable(), Err(CollectorError::Closed));
        assert!(collector.current_window().is_empty());
        assert_eq!(
            collector.info(),
            PtInfo {
                pmu_type: 0,
                fd: None,
                base_size: 0,
                aux_size: 0,
            }
        );
    }

    #[test]
    fn info_lists_type_and_sizes() {
        let info = PtInfo {
            pmu_type: 8,
            fd: Some(3),
            base_size: 65 * 4096,
            aux_size: 1024 * 4096,
        };
        assert_eq!(
            info.to_string(),
            "Intel PT type: 8\nperf fd: 3\nAux buffer size: 4194304\nBase buffer size: 266240"
        );
    }

    #[test]
    fn capture_own_branches() {
        ret_without_pt!();
        let config = CollectorConfig {
            aux_pages: 64,
            open_attempts: 10,
            ..Default::default()
        };
        let mut collector = PtCollector::open(0, &config).unwrap();

        collector.reset_and_enable().unwrap();
        do_branches(10_000);
        collector.disable().unwrap();
        collector.disable().unwrap();

        let info = collector.info();
        assert!(info.fd.is_some());
        assert_eq!(info.aux_size, 64 * page_size().unwrap());
        assert_eq!(info.base_size, (1 + config.data_pages) * page_size().unwrap());

        let window = collector.current_window();
        assert!(!window.is_empty());
        assert!(window.len() <= collector.aux_size());

        // The next cycle starts from an empty window.
        collector.reset_and_enable().unwrap();
        collector.disable().unwrap();
        assert!(collector.current_window().len() <= collector.aux_size());

        assert_eq!(collector.close(), Ok(()));
        assert_eq!(collector.close(), Ok(()));
        assert!(collector.current_window().is_empty());
    }
}
