/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::PathBuf;

use thiserror::Error;

/// Why a packet could not be parsed.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacketErrorKind {
    #[error("packet runs past the end of the buffer")]
    Truncated,

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("unknown extended opcode {0:#04x}")]
    UnknownExtendedOpcode(u8),

    #[error("reserved IP compression {0}")]
    ReservedIpBytes(u8),

    #[error("TNT packet without a stop bit")]
    EmptyTnt,
}

/// A malformed packet at a given offset of the trace buffer.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
#[error("bad packet at offset {offset:#x}: {kind}")]
pub struct PacketError {
    pub offset: usize,
    pub kind: PacketErrorKind,
}

/// Errors surfaced while building a code image.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("reading the mappings of pid {pid}: {source}")]
    Maps {
        pid: i32,
        #[source]
        source: procfs::ProcError,
    },

    #[error("mapping {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("reading tracee memory at {address:#x}: {source}")]
    Memory {
        address: u64,
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced while decoding a trace window.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The window holds no trace data at all.
    #[error("end of trace stream")]
    EndOfStream,

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("no code mapped at {ip:#x}")]
    NoMap { ip: u64 },

    #[error("cannot decode instruction at {ip:#x}")]
    BadInstruction { ip: u64 },

    /// The packets do not fit the instruction flow, e.g. a TIP showed up where
    /// a conditional branch needed a TNT bit.
    #[error("trace out of sync at offset {offset:#x}: expected {expected}")]
    Desync {
        offset: usize,
        expected: &'static str,
    },

    /// The walk went on too long without needing a packet, which only
    /// happens when the image no longer matches the code that ran.
    #[error("{steps} instructions from {ip:#x} without a packet")]
    Runaway { ip: u64, steps: usize },

    /// The hardware dropped packets. Decoding resumes at the next IP update.
    #[error("internal buffer overflow reported at offset {offset:#x}")]
    Overflow { offset: usize },

    #[error(transparent)]
    Image(#[from] ImageError),
}
