/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Reconstructs the executed instruction stream from PT packets and the code
//! image.
//!
//! Straight-line code, direct jumps and direct calls produce no packets, so
//! the walker decodes them from the image on its own. It only consumes
//! packets when an instruction's successor depends on them: a TNT bit for a
//! conditional branch or a compressed return, a TIP for indirect and far
//! transfers.

use std::collections::VecDeque;
use std::path::PathBuf;

use tracing::debug;
use tracing::trace;

use crate::error::DecodeError;
use crate::image::Image;
use crate::image::ImageProvider;
use crate::packet::find_psb;
use crate::packet::Packet;
use crate::packet::PacketParser;
use crate::packet::TipKind;
use crate::record::decode;
use crate::record::ExecMode;
use crate::record::Flow;
use crate::record::InstructionRecord;
use crate::record::MAX_INSN_SIZE;
use crate::TraceDecoder;

/// Calls remembered for return compression.
const RETURN_STACK_DEPTH: usize = 64;

/// Instructions walked between two packets before the cursor gives up.
pub const MAX_STEPS_WITHOUT_PACKET: usize = 1 << 16;

/// A software Intel PT decoder for one process.
pub struct PtDecoder<P> {
    provider: P,
    exe: PathBuf,
    image: Option<Image>,
}

impl<P: ImageProvider> PtDecoder<P> {
    /// Creates a decoder for `exe`. Nothing is read until the first
    /// [`TraceDecoder::initialize`].
    pub fn new(provider: P, exe: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            exe: exe.into(),
            image: None,
        }
    }

    /// The image built by the last initialization, if any.
    pub fn image(&self) -> Option<&Image> {
        self.image.as_ref()
    }

    fn rebuild_image(&mut self) -> Result<(), DecodeError> {
        let image = self.provider.build_image(&self.exe)?;
        debug!("image for {}: {:?}", self.exe.display(), image);
        self.image = Some(image);
        Ok(())
    }

    fn cursor<'a>(
        &'a mut self,
        window: &'a [u8],
        rebuilt: bool,
    ) -> Result<InsnCursor<'a, P>, DecodeError> {
        if window.is_empty() {
            return Err(DecodeError::EndOfStream);
        }
        let start = find_psb(window, 0).unwrap_or(0);
        if start > 0 {
            trace!("skipping {} bytes before the first PSB", start);
        }
        Ok(InsnCursor {
            decoder: self,
            window,
            parser: PacketParser::new(window, start),
            flow: FlowState::default(),
            last_offset: start,
            steps: 0,
            in_psb: false,
            rebuilt,
            done: false,
        })
    }
}

impl<P: ImageProvider> TraceDecoder for PtDecoder<P> {
    type Cursor<'a>
        = InsnCursor<'a, P>
    where
        Self: 'a;

    fn initialize<'a>(&'a mut self, window: &'a [u8]) -> Result<Self::Cursor<'a>, DecodeError> {
        self.rebuild_image()?;
        self.cursor(window, true)
    }

    fn resync<'a>(&'a mut self, window: &'a [u8]) -> Result<Self::Cursor<'a>, DecodeError> {
        self.cursor(window, false)
    }
}

/// What the walker knows about the instruction flow.
#[derive(Debug, Default)]
struct FlowState {
    /// Next instruction to execute, `None` while tracing is off or the
    /// position is unknown.
    ip: Option<u64>,
    mode: ExecMode,
    last_ip: u64,
    /// Undelivered TNT bits, oldest first.
    tnt: VecDeque<bool>,
    returns: VecDeque<u64>,
    /// The last emitted instruction, whose successor is not known yet.
    pending: Option<Pending>,
}

impl FlowState {
    /// Forgets everything that depends on packets that may have been lost.
    fn reset(&mut self) {
        *self = FlowState {
            mode: self.mode,
            ..FlowState::default()
        };
    }

    fn push_return(&mut self, address: u64) {
        if self.returns.len() == RETURN_STACK_DEPTH {
            self.returns.pop_front();
        }
        self.returns.push_back(address);
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    ip: u64,
    size: u64,
    flow: Flow,
}

/// Packets the walker acts on.
#[derive(Debug)]
enum FlowPacket {
    /// TNT bits were queued.
    Tnt,
    Ip { kind: TipKind, ip: Option<u64> },
    /// A FUP inside PSB+ telling the current IP.
    Status(Option<u64>),
}

/// Where a branch went, as told by the next packet.
enum Branch {
    /// TNT bits are available.
    Tnt,
    /// A TIP target, or `None` when tracing stopped.
    Target(Option<u64>),
}

/// Iterates over the instructions of one trace window.
pub struct InsnCursor<'a, P> {
    decoder: &'a mut PtDecoder<P>,
    window: &'a [u8],
    parser: PacketParser<'a>,
    flow: FlowState,
    last_offset: usize,
    /// Instructions emitted since the last packet was consumed.
    steps: usize,
    in_psb: bool,
    /// The image was (re)built for this window already.
    rebuilt: bool,
    done: bool,
}

impl<P: ImageProvider> InsnCursor<'_, P> {
    fn desync(&self, expected: &'static str) -> DecodeError {
        DecodeError::Desync {
            offset: self.last_offset,
            expected,
        }
    }

    /// Reads packets up to the next one that matters for the flow. Mode,
    /// PSB and timing packets are handled on the way.
    fn next_flow_packet(&mut self) -> Result<Option<FlowPacket>, DecodeError> {
        loop {
            let Some((packet, len)) = self.parser.peek()? else {
                return Ok(None);
            };
            let offset = self.parser.offset();
            self.last_offset = offset;
            self.parser.seek(offset + len);
            self.steps = 0;

            match packet {
                Packet::ModeExec(mode) => self.flow.mode = mode,
                Packet::Psb => {
                    self.flow.last_ip = 0;
                    self.in_psb = true;
                }
                Packet::PsbEnd => self.in_psb = false,
                Packet::Ovf => return Err(DecodeError::Overflow { offset }),
                Packet::TraceStop => {
                    return Ok(Some(FlowPacket::Ip {
                        kind: TipKind::Pgd,
                        ip: None,
                    }));
                }
                Packet::Tnt { bits, count } => {
                    self.flow
                        .tnt
                        .extend((0..count).rev().map(|i| bits & (1 << i) != 0));
                    return Ok(Some(FlowPacket::Tnt));
                }
                Packet::Ip { kind, ip } => {
                    let ip = ip.apply(self.flow.last_ip);
                    if let Some(ip) = ip {
                        self.flow.last_ip = ip;
                    }
                    if kind == TipKind::Fup && self.in_psb {
                        return Ok(Some(FlowPacket::Status(ip)));
                    }
                    return Ok(Some(FlowPacket::Ip { kind, ip }));
                }
                _ => debug_assert!(packet.is_timing()),
            }
        }
    }

    /// The next packet that tells where a branch went.
    fn next_branch(&mut self) -> Result<Option<Branch>, DecodeError> {
        loop {
            return match self.next_flow_packet()? {
                None => Ok(None),
                Some(FlowPacket::Status(_)) => continue,
                Some(FlowPacket::Tnt) => Ok(Some(Branch::Tnt)),
                Some(FlowPacket::Ip {
                    kind: TipKind::Tip,
                    ip,
                }) => Ok(Some(Branch::Target(ip))),
                Some(FlowPacket::Ip {
                    kind: TipKind::Pgd, ..
                }) => Ok(Some(Branch::Target(None))),
                Some(FlowPacket::Ip { .. }) => Err(self.desync("branch packet")),
            };
        }
    }

    fn take_tnt(&mut self) -> Result<Option<bool>, DecodeError> {
        if self.flow.tnt.is_empty() {
            match self.next_branch()? {
                None => return Ok(None),
                Some(Branch::Tnt) => {}
                Some(Branch::Target(_)) => return Err(self.desync("TNT bit")),
            }
        }
        Ok(self.flow.tnt.pop_front())
    }

    fn take_target(&mut self) -> Result<Option<Option<u64>>, DecodeError> {
        if !self.flow.tnt.is_empty() {
            return Err(self.desync("TIP"));
        }
        match self.next_branch()? {
            None => Ok(None),
            Some(Branch::Tnt) => Err(self.desync("TIP")),
            Some(Branch::Target(target)) => Ok(Some(target)),
        }
    }

    /// Works out where the last emitted instruction went. Returns false if
    /// the window ended first.
    fn resolve(&mut self, pending: Pending) -> Result<bool, DecodeError> {
        let fallthrough = pending.ip + pending.size;
        let next = match pending.flow {
            Flow::Next => Some(fallthrough),
            Flow::Jump { target } => Some(target),
            Flow::Call { target } => {
                self.flow.push_return(fallthrough);
                Some(target)
            }
            Flow::Conditional { target } => match self.take_tnt()? {
                None => return Ok(false),
                Some(true) => Some(target),
                Some(false) => Some(fallthrough),
            },
            Flow::Return => {
                if self.flow.tnt.is_empty() {
                    match self.next_branch()? {
                        None => return Ok(false),
                        Some(Branch::Tnt) => {}
                        Some(Branch::Target(target)) => {
                            self.flow.ip = target;
                            return Ok(true);
                        }
                    }
                }
                // Compressed return: a taken bit, target from the call.
                if self.flow.tnt.pop_front() != Some(true) {
                    return Err(self.desync("taken bit for a compressed return"));
                }
                match self.flow.returns.pop_back() {
                    Some(address) => Some(address),
                    None => return Err(self.desync("call for a compressed return")),
                }
            }
            Flow::IndirectJump | Flow::IndirectCall | Flow::Far => {
                if pending.flow == Flow::IndirectCall {
                    self.flow.push_return(fallthrough);
                }
                match self.take_target()? {
                    None => return Ok(false),
                    Some(target) => target,
                }
            }
        };
        self.flow.ip = next;
        Ok(true)
    }

    /// Waits for tracing to (re)start. Returns false if the window ended
    /// first.
    fn acquire(&mut self) -> Result<bool, DecodeError> {
        loop {
            match self.next_flow_packet()? {
                None => return Ok(false),
                Some(FlowPacket::Ip {
                    kind: TipKind::Pge | TipKind::Fup | TipKind::Tip,
                    ip: Some(ip),
                })
                | Some(FlowPacket::Status(Some(ip))) => {
                    self.flow.ip = Some(ip);
                    self.flow.tnt.clear();
                    return Ok(true);
                }
                // Bits for code we cannot place.
                Some(FlowPacket::Tnt) => self.flow.tnt.clear(),
                Some(_) => {}
            }
        }
    }

    /// Handles an asynchronous event (signal, interrupt) reported right
    /// before the instruction at `ip`. Returns true if one was found; the
    /// flow state then reflects where execution continued.
    fn async_event(&mut self, ip: u64) -> Result<bool, DecodeError> {
        if !self.flow.tnt.is_empty() {
            return Ok(false);
        }
        let mut peek = self.parser.clone();
        loop {
            match peek.peek()? {
                Some((packet, len)) if packet.is_timing() => peek.seek(peek.offset() + len),
                Some((
                    Packet::Ip {
                        kind: TipKind::Fup,
                        ip: source,
                    },
                    _,
                )) if source.apply(self.flow.last_ip) == Some(ip) => break,
                _ => return Ok(false),
            }
        }

        // The FUP itself.
        self.next_flow_packet()?;
        trace!("asynchronous event at {:#x}", ip);
        match self.next_flow_packet()? {
            Some(FlowPacket::Ip {
                kind: TipKind::Tip | TipKind::Pgd,
                ip: target,
            }) => self.flow.ip = target,
            None => self.flow.ip = None,
            Some(_) => {}
        }
        Ok(true)
    }

    fn fetch(&mut self, ip: u64) -> Result<(InstructionRecord, Flow), DecodeError> {
        let mut bytes = [0; MAX_INSN_SIZE];
        loop {
            let result = match self.decoder.image.as_ref() {
                Some(image) => match image.read(ip, &mut bytes) {
                    Some(len) => decode(ip, &bytes[..len], self.flow.mode),
                    None => Err(DecodeError::NoMap { ip }),
                },
                None => Err(DecodeError::NoMap { ip }),
            };
            match result {
                Err(DecodeError::NoMap { ip: missing }) if !self.rebuilt => {
                    debug!("no code at {:#x}, rebuilding the image", missing);
                    self.rebuilt = true;
                    self.decoder.rebuild_image()?;
                }
                result => return result,
            }
        }
    }

    fn step(&mut self) -> Result<Option<InstructionRecord>, DecodeError> {
        if let Some(pending) = self.flow.pending.take() {
            if !self.resolve(pending)? {
                return Ok(None);
            }
        }

        let ip = loop {
            match self.flow.ip {
                None => {
                    if !self.acquire()? {
                        return Ok(None);
                    }
                }
                Some(ip) => {
                    if !self.async_event(ip)? {
                        break ip;
                    }
                }
            }
        };

        if self.steps == MAX_STEPS_WITHOUT_PACKET {
            return Err(DecodeError::Runaway {
                ip,
                steps: self.steps,
            });
        }
        self.steps += 1;

        let (record, flow) = self.fetch(ip)?;
        self.flow.pending = Some(Pending {
            ip,
            size: record.size() as u64,
            flow,
        });
        Ok(Some(record))
    }

    /// Drops the flow state after an error. Anything but an overflow also
    /// skips ahead to the next PSB.
    fn recover(&mut self, err: &DecodeError) {
        self.flow.reset();
        self.steps = 0;
        if let DecodeError::Packet(packet) = err {
            self.last_offset = self.last_offset.max(packet.offset);
        }
        if matches!(err, DecodeError::Overflow { .. }) {
            return;
        }
        self.in_psb = false;
        match find_psb(self.window, self.last_offset + 1) {
            Some(psb) => {
                trace!("resynchronizing at offset {:#x}", psb);
                self.parser.seek(psb);
            }
            None => self.done = true,
        }
    }
}

impl<P: ImageProvider> Iterator for InsnCursor<'_, P> {
    type Item = Result<InstructionRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.recover(&err);
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PSB;
    use crate::record::InsnClass;

    // 0x1000: nop
    // 0x1001: call 0x100b
    // 0x1006: je 0x100a
    // 0x1008: syscall
    // 0x100a: nop
    // 0x100b: ret
    const CODE: [u8; 12] = [
        0x90, 0xe8, 0x05, 0x00, 0x00, 0x00, 0x74, 0x02, 0x0f, 0x05, 0x90, 0xc3,
    ];

    fn image() -> Image {
        let mut image = Image::new();
        image.add_bytes(0x1000, CODE.to_vec());
        image
    }

    fn decoder() -> PtDecoder<Image> {
        PtDecoder::new(image(), "/bin/test")
    }

    /// An IP packet with a full 64-bit payload.
    fn ip_packet(kind: u8, ip: u64) -> Vec<u8> {
        let mut bytes = vec![0xc0 | kind];
        bytes.extend_from_slice(&ip.to_le_bytes());
        bytes
    }

    const PGE: u8 = 0x11;
    const FUP: u8 = 0x1d;
    const PGD_SUPPRESSED: u8 = 0x01;
    const PSBEND: [u8; 2] = [0x02, 0x23];
    /// Taken, then not taken.
    const TNT_TAKEN_NOT_TAKEN: u8 = 0x0c;

    fn stream(parts: &[&[u8]]) -> Vec<u8> {
        parts.concat()
    }

    fn classes(cursor: impl Iterator<Item = Result<InstructionRecord, DecodeError>>) -> Vec<InsnClass> {
        cursor.map(|record| record.unwrap().class).collect()
    }

    #[test]
    fn compressed_return() {
        let buf = stream(&[
            &PSB,
            &PSBEND,
            &ip_packet(PGE, 0x1000),
            &[TNT_TAKEN_NOT_TAKEN, PGD_SUPPRESSED],
        ]);
        let mut decoder = decoder();
        let records: Vec<_> = decoder
            .initialize(&buf)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        let ips: Vec<_> = records.iter().map(|record| record.ip).collect();
        assert_eq!(ips, vec![0x1000, 0x1001, 0x100b, 0x1006, 0x1008]);
        assert_eq!(
            records.iter().map(|record| record.class).collect::<Vec<_>>(),
            vec![
                InsnClass::Ordinary,
                InsnClass::NearCall,
                InsnClass::NearReturn,
                InsnClass::ConditionalJump,
                InsnClass::FarTransfer,
            ]
        );
        assert_eq!(records[1].bytes(), &[0xe8, 0x05, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn uncompressed_return() {
        let buf = stream(&[
            &PSB,
            &PSBEND,
            &ip_packet(PGE, 0x1000),
            // TIP with a 16-bit update to 0x1006.
            &[0x2d, 0x06, 0x10],
            // Not taken.
            &[0x04],
            &[PGD_SUPPRESSED],
        ]);
        let mut decoder = decoder();
        let ips: Vec<_> = decoder
            .initialize(&buf)
            .unwrap()
            .map(|record| record.unwrap().ip)
            .collect();
        assert_eq!(ips, vec![0x1000, 0x1001, 0x100b, 0x1006, 0x1008]);
    }

    #[test]
    fn asynchronous_event_disables_tracing() {
        let buf = stream(&[
            &PSB,
            &PSBEND,
            &ip_packet(PGE, 0x1000),
            &ip_packet(FUP, 0x1001),
            &[PGD_SUPPRESSED],
            &ip_packet(PGE, 0x1001),
            &[TNT_TAKEN_NOT_TAKEN, PGD_SUPPRESSED],
        ]);
        let mut decoder = decoder();
        let ips: Vec<_> = decoder
            .initialize(&buf)
            .unwrap()
            .map(|record| record.unwrap().ip)
            .collect();
        assert_eq!(ips, vec![0x1000, 0x1001, 0x100b, 0x1006, 0x1008]);
    }

    #[test]
    fn empty_window() {
        let mut decoder = decoder();
        assert!(matches!(
            decoder.initialize(&[]),
            Err(DecodeError::EndOfStream)
        ));
        assert!(decoder.image().is_some());
        assert!(matches!(decoder.resync(&[]), Err(DecodeError::EndOfStream)));
    }

    #[test]
    fn window_without_psb() {
        let buf = stream(&[&ip_packet(PGE, 0x1006), &[0x04, PGD_SUPPRESSED]]);
        let mut decoder = decoder();
        assert_eq!(
            classes(decoder.initialize(&buf).unwrap()),
            vec![InsnClass::ConditionalJump, InsnClass::FarTransfer]
        );
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let buf = stream(&[
            &[0xde, 0xad],
            &PSB,
            &PSBEND,
            &ip_packet(PGE, 0x1006),
            &[0x04, PGD_SUPPRESSED],
        ]);
        let mut decoder = decoder();
        assert_eq!(decoder.initialize(&buf).unwrap().count(), 2);
    }

    #[test]
    fn map_miss_resyncs_at_next_psb() {
        let buf = stream(&[
            &PSB,
            &PSBEND,
            &ip_packet(PGE, 0x9000),
            &PSB,
            &PSBEND,
            &ip_packet(PGE, 0x1006),
            &[0x04, PGD_SUPPRESSED],
        ]);
        let mut decoder = decoder();
        decoder.initialize(&[0x00]).unwrap().for_each(drop);

        let mut cursor = decoder.resync(&buf).unwrap();
        assert!(matches!(
            cursor.next(),
            Some(Err(DecodeError::NoMap { ip: 0x9000 }))
        ));
        assert_eq!(
            classes(cursor),
            vec![InsnClass::ConditionalJump, InsnClass::FarTransfer]
        );
    }

    #[test]
    fn overflow_resumes_at_fup() {
        let buf = stream(&[
            &PSB,
            &PSBEND,
            &ip_packet(PGE, 0x1006),
            &[0x02, 0xf3],
            &ip_packet(FUP, 0x1008),
            &[PGD_SUPPRESSED],
        ]);
        let mut decoder = decoder();
        let mut cursor = decoder.initialize(&buf).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().ip, 0x1006);
        assert!(matches!(
            cursor.next(),
            Some(Err(DecodeError::Overflow { .. }))
        ));
        assert_eq!(cursor.next().unwrap().unwrap().ip, 0x1008);
        assert!(cursor.next().is_none());
    }

    #[test]
    fn tip_where_tnt_expected_is_a_desync() {
        let buf = stream(&[
            &PSB,
            &PSBEND,
            &ip_packet(PGE, 0x1006),
            &ip_packet(0x0d, 0x1000),
        ]);
        let mut decoder = decoder();
        let mut cursor = decoder.initialize(&buf).unwrap();
        assert!(cursor.next().unwrap().is_ok());
        assert!(matches!(
            cursor.next(),
            Some(Err(DecodeError::Desync { .. }))
        ));
        // No PSB left to resync on.
        assert!(cursor.next().is_none());
    }

    #[test]
    fn last_instruction_is_emitted_without_its_packets() {
        // The window ends right after the conditional branch executed.
        let buf = stream(&[&PSB, &PSBEND, &ip_packet(PGE, 0x1006)]);
        let mut decoder = decoder();
        assert_eq!(
            classes(decoder.initialize(&buf).unwrap()),
            vec![InsnClass::ConditionalJump]
        );
    }

    #[test]
    fn jump_cycle_ends_the_window() {
        // 0x3000: jmp 0x3000
        let mut image = Image::new();
        image.add_bytes(0x3000, vec![0xeb, 0xfe]);
        let mut decoder = PtDecoder::new(image, "/bin/test");

        let buf = stream(&[&PSB, &PSBEND, &ip_packet(PGE, 0x3000)]);
        let mut cursor = decoder.initialize(&buf).unwrap();
        assert_eq!(
            cursor.by_ref().take(MAX_STEPS_WITHOUT_PACKET).filter(Result::is_ok).count(),
            MAX_STEPS_WITHOUT_PACKET
        );
        assert!(matches!(
            cursor.next(),
            Some(Err(DecodeError::Runaway { ip: 0x3000, .. }))
        ));
        assert!(cursor.next().is_none());
    }

    #[test]
    fn image_is_rebuilt_once_on_a_miss() {
        struct Counting(usize);
        impl ImageProvider for Counting {
            fn build_image(&mut self, _exe: &std::path::Path) -> Result<Image, crate::ImageError> {
                self.0 += 1;
                Ok(image())
            }
        }

        let buf = stream(&[&PSB, &PSBEND, &ip_packet(PGE, 0x9000)]);
        let mut decoder = PtDecoder::new(Counting(0), "/bin/test");
        assert!(decoder.image().is_none());
        decoder.initialize(&[0x00]).unwrap().for_each(drop);
        assert_eq!(decoder.provider.0, 1);
        assert!(decoder.image().is_some_and(|image| image.contains(0x1000)));

        let errors = decoder.resync(&buf).unwrap().filter(Result::is_err).count();
        assert_eq!(errors, 1);
        assert_eq!(decoder.provider.0, 2);
    }
}
