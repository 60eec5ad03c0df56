/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::ops::Deref;

/// The trace bytes produced between the last `reset_and_enable` and the
/// following `disable`. Borrowing the window borrows the collector, so it
/// cannot outlive the next capture cycle.
#[derive(Debug, Clone, Copy)]
pub struct TraceWindow<'a> {
    bytes: &'a [u8],
    truncated: bool,
}

impl<'a> TraceWindow<'a> {
    /// Wraps a byte range as a window.
    pub fn new(bytes: &'a [u8], truncated: bool) -> Self {
        Self { bytes, truncated }
    }

    /// A window with no trace data.
    pub fn empty() -> Self {
        Self::new(&[], false)
    }

    /// The raw packet bytes.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// True if the producer filled the whole auxiliary region. The ring is
    /// not overwritten, so the window holds the oldest packets and the
    /// newest part of the execution slice is missing.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

impl Deref for TraceWindow<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

/// Where a captured window lives inside the auxiliary ring.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Span {
    /// Nothing captured.
    Empty,
    /// A contiguous range of the ring.
    Direct { start: usize, len: usize },
    /// The range wraps; `first` bytes from `start` to the end of the ring,
    /// then `len - first` bytes from the start of the ring.
    Wrapped { start: usize, first: usize, len: usize },
}

/// Locates the unread bytes `[consumed, head)` in a ring of `size` bytes.
/// `consumed` and `head` are the kernel's free-running offsets. Returns the
/// span and whether the producer saturated the ring. The span never covers
/// more than one ring starting at `consumed`.
pub(crate) fn locate(consumed: u64, head: u64, size: usize) -> (Span, bool) {
    let available = head.wrapping_sub(consumed);
    if available == 0 || size == 0 {
        return (Span::Empty, false);
    }

    let ring = size as u64;
    let truncated = available >= ring;
    let len = if truncated { size } else { available as usize };

    let start = (consumed % ring) as usize;
    if start + len <= size {
        (Span::Direct { start, len }, truncated)
    } else {
        (
            Span::Wrapped {
                start,
                first: size - start,
                len,
            },
            truncated,
        )
    }
}
