/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Intel PT packet layer. Encodings follow the Intel SDM, Volume 3,
//! "Intel Processor Trace" chapter.

use crate::error::PacketError;
use crate::error::PacketErrorKind;
use crate::record::ExecMode;

/// Packet Stream Boundary: `02 82` repeated eight times.
pub const PSB: [u8; 16] = [
    0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82,
];

/// How a TIP-family packet encodes its target relative to the last IP.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IpCompression {
    /// No IP (e.g. the target is outside the traced region).
    Suppressed,
    /// Replaces bits 15:0 of the last IP.
    Update16(u64),
    /// Replaces bits 31:0 of the last IP.
    Update32(u64),
    /// A 48-bit IP, sign-extended.
    Sext48(u64),
    /// Replaces bits 47:0 of the last IP.
    Update48(u64),
    /// A full 64-bit IP.
    Full(u64),
}

impl IpCompression {
    /// Reconstructs the IP given the last one seen. `None` if suppressed.
    pub fn apply(self, last_ip: u64) -> Option<u64> {
        match self {
            IpCompression::Suppressed => None,
            IpCompression::Update16(bits) => Some((last_ip & !0xffff) | bits),
            IpCompression::Update32(bits) => Some((last_ip & !0xffff_ffff) | bits),
            IpCompression::Sext48(bits) => Some((((bits << 16) as i64) >> 16) as u64),
            IpCompression::Update48(bits) => Some((last_ip & !0xffff_ffff_ffff) | bits),
            IpCompression::Full(ip) => Some(ip),
        }
    }
}

/// The TIP-family packets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TipKind {
    /// Target of an indirect branch, far transfer or compressed-less return.
    Tip,
    /// Tracing enabled (packet generation enable).
    Pge,
    /// Tracing disabled (packet generation disable).
    Pgd,
    /// Flow update: source IP of an asynchronous event, or the current IP in
    /// a PSB+ sequence.
    Fup,
}

/// A decoded packet. Packets that only carry timing or power information are
/// kept as unit variants; the flow walker ignores them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    Pad,
    Psb,
    PsbEnd,
    Ovf,
    /// Taken/not-taken bits. The oldest bit is bit `count - 1` of `bits`.
    Tnt { bits: u64, count: u8 },
    Ip { kind: TipKind, ip: IpCompression },
    ModeExec(ExecMode),
    ModeTsx,
    Tsc,
    Mtc,
    Cyc,
    Tma,
    Cbr,
    Pip,
    Vmcs,
    Mnt,
    TraceStop,
    Ptw,
    Exstop,
    Mwait,
    Pwre,
    Pwrx,
}

impl Packet {
    /// True for packets that do not affect instruction flow.
    pub fn is_timing(&self) -> bool {
        matches!(
            self,
            Packet::Pad
                | Packet::Tsc
                | Packet::Mtc
                | Packet::Cyc
                | Packet::Tma
                | Packet::Cbr
                | Packet::Pip
                | Packet::Vmcs
                | Packet::Mnt
                | Packet::ModeTsx
                | Packet::Ptw
                | Packet::Exstop
                | Packet::Mwait
                | Packet::Pwre
                | Packet::Pwrx
        )
    }
}

/// Returns the offset of the first PSB at or after `from`.
pub fn find_psb(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(PSB.len())
        .position(|window| window == PSB)
        .map(|pos| from + pos)
}

/// Reads packets one at a time from a trace buffer.
#[derive(Debug, Clone)]
pub struct PacketParser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketParser<'a> {
    pub fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    /// Offset of the next packet.
    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn error(&self, kind: PacketErrorKind) -> PacketError {
        PacketError {
            offset: self.pos,
            kind,
        }
    }

    fn take(&self, len: usize) -> Result<&'a [u8], PacketError> {
        self.buf
            .get(self.pos..self.pos + len)
            .ok_or_else(|| self.error(PacketErrorKind::Truncated))
    }

    /// Parses the packet at the current offset without consuming it.
    /// Returns the packet and its length.
    pub fn peek(&self) -> Result<Option<(Packet, usize)>, PacketError> {
        let Some(&header) = self.buf.get(self.pos) else {
            return Ok(None);
        };

        let parsed = match header {
            0x00 => (Packet::Pad, 1),
            0x02 => self.extended()?,
            _ if header & 0x01 == 0 => {
                // Short TNT: the highest set bit is the stop bit.
                let payload = (header >> 1) as u64;
                let count = 63 - payload.leading_zeros() as u8;
                let bits = payload & ((1 << count) - 1);
                (Packet::Tnt { bits, count }, 1)
            }
            _ if header & 0x03 == 0x03 => (Packet::Cyc, self.cyc_len()?),
            0x19 => {
                self.take(8)?;
                (Packet::Tsc, 8)
            }
            0x59 => {
                self.take(2)?;
                (Packet::Mtc, 2)
            }
            0x99 => {
                let bytes = self.take(2)?;
                let payload = bytes[1];
                let packet = match payload >> 5 {
                    0 => {
                        let mode = if payload & 0x01 != 0 {
                            ExecMode::Bits64
                        } else if payload & 0x02 != 0 {
                            ExecMode::Bits32
                        } else {
                            ExecMode::Bits16
                        };
                        Packet::ModeExec(mode)
                    }
                    _ => Packet::ModeTsx,
                };
                (packet, 2)
            }
            _ => {
                let kind = match header & 0x1f {
                    0x0d => TipKind::Tip,
                    0x11 => TipKind::Pge,
                    0x01 => TipKind::Pgd,
                    0x1d => TipKind::Fup,
                    _ => return Err(self.error(PacketErrorKind::UnknownOpcode(header))),
                };
                let ip_bytes = header >> 5;
                let payload_len = match ip_bytes {
                    0 => 0,
                    1 => 2,
                    2 => 4,
                    3 | 4 => 6,
                    6 => 8,
                    other => return Err(self.error(PacketErrorKind::ReservedIpBytes(other))),
                };
                let bytes = self.take(1 + payload_len)?;
                let value = le_bytes(&bytes[1..]);
                let ip = match ip_bytes {
                    0 => IpCompression::Suppressed,
                    1 => IpCompression::Update16(value),
                    2 => IpCompression::Update32(value),
                    3 => IpCompression::Sext48(value),
                    4 => IpCompression::Update48(value),
                    _ => IpCompression::Full(value),
                };
                (Packet::Ip { kind, ip }, 1 + payload_len)
            }
        };

        Ok(Some(parsed))
    }

    fn extended(&self) -> Result<(Packet, usize), PacketError> {
        let bytes = self.take(2)?;
        let opcode = bytes[1];
        let (packet, len) = match opcode {
            0x82 => {
                if self.take(PSB.len())? != PSB {
                    return Err(self.error(PacketErrorKind::UnknownExtendedOpcode(opcode)));
                }
                (Packet::Psb, PSB.len())
            }
            0x23 => (Packet::PsbEnd, 2),
            0xf3 => (Packet::Ovf, 2),
            0x83 => (Packet::TraceStop, 2),
            0x62 | 0xe2 => (Packet::Exstop, 2),
            0x03 => (Packet::Cbr, 4),
            0x22 => (Packet::Pwre, 4),
            0x73 => (Packet::Tma, 7),
            0xc8 => (Packet::Vmcs, 7),
            0xa2 => (Packet::Pwrx, 7),
            0x43 => (Packet::Pip, 8),
            0xc2 => (Packet::Mwait, 10),
            0xc3 => (Packet::Mnt, 11),
            0xa3 => {
                let bytes = self.take(8)?;
                let payload = le_bytes(&bytes[2..]);
                if payload == 0 {
                    return Err(self.error(PacketErrorKind::EmptyTnt));
                }
                let count = 63 - payload.leading_zeros() as u8;
                let bits = payload & ((1 << count) - 1);
                return Ok((Packet::Tnt { bits, count }, 8));
            }
            _ if opcode & 0x1f == 0x12 => {
                let len = if opcode & 0x60 == 0 { 6 } else { 10 };
                (Packet::Ptw, len)
            }
            _ => return Err(self.error(PacketErrorKind::UnknownExtendedOpcode(opcode))),
        };
        self.take(len)?;
        Ok((packet, len))
    }

    fn cyc_len(&self) -> Result<usize, PacketError> {
        let header = self.buf[self.pos];
        let mut len = 1;
        if header & 0x04 == 0 {
            return Ok(len);
        }
        loop {
            let byte = *self
                .buf
                .get(self.pos + len)
                .ok_or_else(|| self.error(PacketErrorKind::Truncated))?;
            len += 1;
            if byte & 0x01 == 0 {
                return Ok(len);
            }
        }
    }
}

impl Iterator for PacketParser<'_> {
    type Item = Result<(usize, Packet), PacketError>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.pos;
        match self.peek() {
            Ok(Some((packet, len))) => {
                self.pos += len;
                Some(Ok((offset, packet)))
            }
            Ok(None) => None,
            Err(err) => {
                // Callers resynchronize explicitly.
                self.pos = self.buf.len();
                Some(Err(err))
            }
        }
    }
}

fn le_bytes(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &byte| (acc << 8) | byte as u64)
}
