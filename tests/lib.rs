/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Tracee bodies shared by the end-to-end tests. They run in a forked child
//! and only make raw syscalls.

#![cfg(target_os = "linux")]

/// Exits the whole process without running any destructors.
pub fn exit_group(code: i32) -> ! {
    unsafe { libc::syscall(libc::SYS_exit_group, code) };
    unreachable!("exit_group returned")
}

/// Spins for `iterations` without touching memory or making syscalls, then
/// exits with 0.
pub fn spin_then_exit(iterations: u64) -> ! {
    let mut x = 0u64;
    for i in 0..iterations {
        x = std::hint::black_box(x.wrapping_mul(31).wrapping_add(i));
    }
    std::hint::black_box(x);
    unsafe { libc::_exit(0) }
}

#[inline(never)]
fn leaf(x: u64) -> u64 {
    std::hint::black_box(x) + 1
}

/// Calls a function, then exits with 0.
pub fn call_then_exit() -> ! {
    std::hint::black_box(leaf(41));
    exit_group(0)
}

/// Makes `count` `getpid` calls, then exits with `code`.
pub fn syscalls_then_exit(count: usize, code: i32) -> ! {
    for _ in 0..count {
        unsafe { libc::syscall(libc::SYS_getpid) };
    }
    exit_group(code)
}
