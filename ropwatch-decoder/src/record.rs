/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;

use iced_x86::Code;
use iced_x86::Decoder;
use iced_x86::DecoderError;
use iced_x86::DecoderOptions;
use iced_x86::FlowControl;
use iced_x86::Instruction;

use crate::error::DecodeError;

/// Longest possible x86 instruction.
pub const MAX_INSN_SIZE: usize = 15;

/// Execution mode the processor was in, as reported by MODE.Exec packets.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum ExecMode {
    Bits16,
    Bits32,
    #[default]
    Bits64,
}

impl ExecMode {
    /// The bitness iced-x86 expects.
    pub fn bitness(self) -> u32 {
        match self {
            ExecMode::Bits16 => 16,
            ExecMode::Bits32 => 32,
            ExecMode::Bits64 => 64,
        }
    }
}

/// Control-flow class of an instruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum InsnClass {
    /// Falls through to the next instruction.
    Ordinary,
    /// Direct or indirect near call.
    NearCall,
    /// Near return.
    NearReturn,
    /// Direct or indirect near jump.
    NearJump,
    /// Conditional jump (including `loop` and `jcxz`).
    ConditionalJump,
    /// Anything that leaves the current code segment or privilege level:
    /// far call/jump/return, `syscall`, `sysenter`, software interrupts,
    /// `iret`.
    FarTransfer,
}

/// How the decoder has to find out where an instruction went.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Flow {
    Next,
    Conditional { target: u64 },
    Jump { target: u64 },
    IndirectJump,
    Call { target: u64 },
    IndirectCall,
    Return,
    Far,
}

impl Flow {
    pub(crate) fn class(self) -> InsnClass {
        match self {
            Flow::Next => InsnClass::Ordinary,
            Flow::Conditional { .. } => InsnClass::ConditionalJump,
            Flow::Jump { .. } | Flow::IndirectJump => InsnClass::NearJump,
            Flow::Call { .. } | Flow::IndirectCall => InsnClass::NearCall,
            Flow::Return => InsnClass::NearReturn,
            Flow::Far => InsnClass::FarTransfer,
        }
    }
}

/// One executed instruction reconstructed from the trace.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct InstructionRecord {
    pub ip: u64,
    raw: [u8; MAX_INSN_SIZE],
    size: u8,
    pub mode: ExecMode,
    pub class: InsnClass,
}

impl InstructionRecord {
    /// Builds a record from already known parts. `bytes` longer than
    /// [`MAX_INSN_SIZE`] are cut.
    pub fn new(ip: u64, bytes: &[u8], mode: ExecMode, class: InsnClass) -> Self {
        let size = bytes.len().min(MAX_INSN_SIZE);
        let mut raw = [0; MAX_INSN_SIZE];
        raw[..size].copy_from_slice(&bytes[..size]);
        Self {
            ip,
            raw,
            size: size as u8,
            mode,
            class,
        }
    }

    /// A record that only carries a class, for callers that do not care
    /// about addresses or bytes.
    pub fn synthetic(class: InsnClass) -> Self {
        Self::new(0, &[], ExecMode::Bits64, class)
    }

    /// The instruction bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.raw[..self.size as usize]
    }

    /// Length of the instruction in bytes.
    pub fn size(&self) -> usize {
        self.size as usize
    }
}

impl fmt::Debug for InstructionRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InstructionRecord")
            .field("ip", &format_args!("{:#x}", self.ip))
            .field("bytes", &format_args!("{:02x?}", self.bytes()))
            .field("mode", &self.mode)
            .field("class", &self.class)
            .finish()
    }
}

fn is_ret_near(insn: &Instruction) -> bool {
    matches!(
        insn.code(),
        Code::Retnw | Code::Retnw_imm16 | Code::Retnd | Code::Retnd_imm16 | Code::Retnq | Code::Retnq_imm16
    )
}

/// Decodes the instruction at the start of `bytes` and works out its flow.
pub(crate) fn decode(
    ip: u64,
    bytes: &[u8],
    mode: ExecMode,
) -> Result<(InstructionRecord, Flow), DecodeError> {
    let mut decoder = Decoder::with_ip(mode.bitness(), bytes, ip, DecoderOptions::NONE);
    let insn = decoder.decode();
    if insn.is_invalid() {
        return Err(match decoder.last_error() {
            // The section ended in the middle of the instruction.
            DecoderError::NoMoreBytes => DecodeError::NoMap {
                ip: ip + bytes.len() as u64,
            },
            _ => DecodeError::BadInstruction { ip },
        });
    }

    let flow = match insn.flow_control() {
        FlowControl::Next | FlowControl::XbeginXabortXend | FlowControl::Exception => Flow::Next,
        FlowControl::ConditionalBranch => Flow::Conditional {
            target: insn.near_branch_target(),
        },
        FlowControl::UnconditionalBranch if insn.is_jmp_short_or_near() => Flow::Jump {
            target: insn.near_branch_target(),
        },
        FlowControl::IndirectBranch if insn.is_jmp_near_indirect() => Flow::IndirectJump,
        FlowControl::Call if insn.is_call_near() => Flow::Call {
            target: insn.near_branch_target(),
        },
        FlowControl::IndirectCall if insn.is_call_near_indirect() => Flow::IndirectCall,
        FlowControl::Return if is_ret_near(&insn) => Flow::Return,
        // syscall, sysenter, int n, far call/jmp/ret, iret...
        _ => Flow::Far,
    };

    let len = insn.len().min(bytes.len());
    let record = InstructionRecord::new(ip, &bytes[..len], mode, flow.class());
    Ok((record, flow))
}
