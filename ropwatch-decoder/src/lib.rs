/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![cfg(target_os = "linux")]

//! Turns raw Intel PT windows into the sequence of instructions the tracee
//! executed.
//!
//! The pieces are:
//! * a packet parser ([`PacketParser`]),
//! * a code [`Image`] built by an [`ImageProvider`], usually the
//!   [`ProcessImageProvider`] reading `/proc/<pid>/maps`,
//! * a flow walker ([`PtDecoder`]) that combines both and classifies every
//!   instruction with `iced-x86`.

mod error;
mod image;
mod packet;
mod process;
mod record;
mod walker;

pub use crate::error::DecodeError;
pub use crate::error::ImageError;
pub use crate::error::PacketError;
pub use crate::error::PacketErrorKind;
pub use crate::image::Image;
pub use crate::image::ImageProvider;
pub use crate::packet::find_psb;
pub use crate::packet::IpCompression;
pub use crate::packet::Packet;
pub use crate::packet::PacketParser;
pub use crate::packet::TipKind;
pub use crate::packet::PSB;
pub use crate::process::ProcessImageProvider;
pub use crate::record::ExecMode;
pub use crate::record::InsnClass;
pub use crate::record::InstructionRecord;
pub use crate::record::MAX_INSN_SIZE;
pub use crate::walker::InsnCursor;
pub use crate::walker::MAX_STEPS_WITHOUT_PACKET;
pub use crate::walker::PtDecoder;

/// Produces the instructions recorded in a trace window.
///
/// The returned cursor borrows the window, so it has to be dropped before the
/// collector is re-enabled. Dropping it releases all per-window state.
pub trait TraceDecoder {
    type Cursor<'a>: Iterator<Item = Result<InstructionRecord, DecodeError>>
    where
        Self: 'a;

    /// Builds the code image from scratch and starts decoding `window`.
    /// Returns [`DecodeError::EndOfStream`] if the window is empty, after
    /// the image was built.
    fn initialize<'a>(&'a mut self, window: &'a [u8]) -> Result<Self::Cursor<'a>, DecodeError>;

    /// Starts decoding `window` with the image already built.
    fn resync<'a>(&'a mut self, window: &'a [u8]) -> Result<Self::Cursor<'a>, DecodeError>;
}
