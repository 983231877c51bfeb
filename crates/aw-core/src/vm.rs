// ── Virtual machine ───────────────────────────────────────────────────────────
//
// 256 signed 16-bit registers, 64 cooperative threads over one bytecode
// resource, and a flat opcode dispatch that drives the other subsystems.
// Thread starts, kills and pause changes are staged and committed at the
// next frame boundary; within a frame each running thread executes until it
// yields, halts or flips the display budget.

use std::sync::Arc;

use log::{debug, warn};

use crate::audio::{self, SharedAudio};
use crate::backend::Backend;
use crate::error::Error;
use crate::mixer::Sample;
use crate::music::{Instrument, Module};
use crate::parts::GAME_PART_FIRST;
use crate::resources::Resources;
use crate::video::{Point, SegmentId, Video, COLOR_FROM_SHAPE, DEFAULT_ZOOM};

pub const NUM_THREADS: usize = 64;
pub const NUM_REGS: usize = 256;
pub const STACK_DEPTH: usize = 256;

// Special register indices. Everything else is bytecode-private.
pub const VAR_RANDOM_SEED: usize = 0x3C;
pub const VAR_LAST_KEY: usize = 0xDA;
pub const VAR_HERO_POS_UP_DOWN: usize = 0xE5;
pub const VAR_MUSIC_MARK: usize = 0xF4;
pub const VAR_SCROLL_Y: usize = 0xF9;
pub const VAR_HERO_ACTION: usize = 0xFA;
pub const VAR_HERO_POS_JUMP_DOWN: usize = 0xFB;
pub const VAR_HERO_POS_LEFT_RIGHT: usize = 0xFC;
pub const VAR_HERO_POS_MASK: usize = 0xFD;
pub const VAR_HERO_ACTION_POS_MASK: usize = 0xFE;
pub const VAR_PAUSE_SLICES: usize = 0xFF;

const INACTIVE_PC: u16 = 0xFFFF;
/// START with this address (and RESET mode 2) kills the target thread.
const ADDR_KILL: u16 = 0xFFFE;
/// Milliseconds per pause slice.
pub const TICK_MS: u32 = 20;
/// Runaway guard: a slice without YIELD is cut here with a warning.
const MAX_OPS_PER_SLICE: u32 = 0x2_0000;

#[derive(Debug, Clone, Copy)]
struct Thread {
    pc: u16,
    pc_next: Option<u16>,
    paused: bool,
    paused_next: Option<bool>,
}

impl Thread {
    const fn idle() -> Self {
        Thread { pc: INACTIVE_PC, pc_next: None, paused: false, paused_next: None }
    }
}

enum Flow {
    Continue,
    Yield,
    Halt,
}

/// Everything an opcode may touch besides the VM itself.
pub struct Io<'a, B: Backend> {
    pub video: &'a mut Video,
    pub res: &'a mut Resources,
    pub audio: &'a SharedAudio,
    pub backend: &'a mut B,
}

pub struct Vm {
    pub regs: [i16; NUM_REGS],
    threads: [Thread; NUM_THREADS],
    code: Arc<[u8]>,
    stack: [u16; STACK_DEPTH],
    sp: usize,
    pub requested_part: Option<u16>,
    last_frame_ms: u32,
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Vm {
            regs: [0; NUM_REGS],
            threads: [Thread::idle(); NUM_THREADS],
            code: Arc::from(&[][..]),
            stack: [0; STACK_DEPTH],
            sp: 0,
            requested_part: None,
            last_frame_ms: 0,
        };
        vm.regs[0x54] = 0x81;
        vm
    }

    /// Seeds the registers the code-wheel protection would have set, so the
    /// game can boot straight into the intro.
    pub fn bypass_protection(&mut self) {
        self.regs[0xBC] = 0x10;
        self.regs[0xC6] = 0x80;
        self.regs[0xF2] = 4000;
        self.regs[0xDC] = 33;
    }

    /// Binds a freshly loaded part: all threads reset, thread 0 starts at 0.
    pub fn init_part(&mut self, bytecode: Arc<[u8]>) {
        self.code = bytecode;
        self.threads = [Thread::idle(); NUM_THREADS];
        self.threads[0].pc = 0;
        self.regs[0xE4] = 0x14;
    }

    pub fn thread_active(&self, tid: usize) -> bool {
        self.threads[tid].pc != INACTIVE_PC
    }

    pub fn thread_paused(&self, tid: usize) -> bool {
        self.threads[tid].paused
    }

    /// Commit phase: staged pcs and pause states become current.
    pub fn commit_thread_requests(&mut self) {
        for t in &mut self.threads {
            if let Some(pc) = t.pc_next.take() {
                t.pc = pc;
            }
            if let Some(p) = t.paused_next.take() {
                t.paused = p;
            }
        }
    }

    /// Run phase: every running thread executes until it stops politely.
    pub fn run_frame<B: Backend>(&mut self, io: &mut Io<B>) -> Result<(), Error> {
        for tid in 0..NUM_THREADS {
            let t = self.threads[tid];
            if t.paused || t.pc == INACTIVE_PC {
                continue;
            }
            let next = self.run_thread(tid, t.pc, io)?;
            self.threads[tid].pc = next;
        }
        Ok(())
    }

    fn run_thread<B: Backend>(
        &mut self,
        tid: usize,
        pc: u16,
        io: &mut Io<B>,
    ) -> Result<u16, Error> {
        self.sp = 0;
        let mut pc = pc as usize;
        let mut ops = 0u32;
        loop {
            match self.exec_op(&mut pc, io)? {
                Flow::Continue => {}
                Flow::Yield => return Ok(pc as u16),
                Flow::Halt => return Ok(INACTIVE_PC),
            }
            ops += 1;
            if ops >= MAX_OPS_PER_SLICE {
                warn!(target: "vm", "thread {tid} ran {ops} ops without yielding, cut");
                return Ok(pc as u16);
            }
        }
    }

    // ── Fetch helpers ────────────────────────────────────────────────────────

    fn fetch_u8(&self, pc: &mut usize) -> Result<u8, Error> {
        let b = *self.code.get(*pc).ok_or(Error::InvalidInstruction {
            pc: *pc as u16,
            opcode: 0,
            reason: "pc beyond bytecode end",
        })?;
        *pc += 1;
        Ok(b)
    }

    fn fetch_u16(&self, pc: &mut usize) -> Result<u16, Error> {
        let hi = self.fetch_u8(pc)?;
        let lo = self.fetch_u8(pc)?;
        Ok((hi as u16) << 8 | lo as u16)
    }

    fn seek(&self, pc: &mut usize, target: u16, opcode: u8) -> Result<(), Error> {
        if target as usize >= self.code.len() {
            return Err(Error::InvalidInstruction {
                pc: *pc as u16,
                opcode,
                reason: "jump target outside bytecode",
            });
        }
        *pc = target as usize;
        Ok(())
    }

    fn reg(&self, index: u8) -> i16 {
        self.regs[index as usize]
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    fn exec_op<B: Backend>(&mut self, pc: &mut usize, io: &mut Io<B>) -> Result<Flow, Error> {
        let op_pc = *pc;
        let op = self.fetch_u8(pc)?;
        match op {
            0x00 => {
                // SETI
                let r = self.fetch_u8(pc)? as usize;
                let imm = self.fetch_u16(pc)?;
                self.regs[r] = imm as i16;
            }
            0x01 => {
                // SETR
                let dst = self.fetch_u8(pc)? as usize;
                let src = self.fetch_u8(pc)?;
                self.regs[dst] = self.reg(src);
            }
            0x02 => {
                // ADDR
                let dst = self.fetch_u8(pc)? as usize;
                let src = self.fetch_u8(pc)?;
                self.regs[dst] = self.regs[dst].wrapping_add(self.reg(src));
            }
            0x03 => {
                // ADDI
                let r = self.fetch_u8(pc)? as usize;
                let imm = self.fetch_u16(pc)?;
                self.regs[r] = self.regs[r].wrapping_add(imm as i16);
            }
            0x04 => {
                // CALL
                let target = self.fetch_u16(pc)?;
                if self.sp >= STACK_DEPTH {
                    return Err(Error::InvalidInstruction {
                        pc: op_pc as u16,
                        opcode: op,
                        reason: "call stack overflow",
                    });
                }
                self.stack[self.sp] = *pc as u16;
                self.sp += 1;
                self.seek(pc, target, op)?;
            }
            0x05 => {
                // RET
                if self.sp == 0 {
                    return Err(Error::InvalidInstruction {
                        pc: op_pc as u16,
                        opcode: op,
                        reason: "return with empty call stack",
                    });
                }
                self.sp -= 1;
                let target = self.stack[self.sp];
                self.seek(pc, target, op)?;
            }
            0x06 => return Ok(Flow::Yield),
            0x07 => {
                // JUMP
                let target = self.fetch_u16(pc)?;
                self.seek(pc, target, op)?;
            }
            0x08 => {
                // START
                let tid = self.fetch_u8(pc)? as usize & (NUM_THREADS - 1);
                let addr = self.fetch_u16(pc)?;
                self.threads[tid].pc_next =
                    Some(if addr == ADDR_KILL { INACTIVE_PC } else { addr });
            }
            0x09 => {
                // DBRA
                let r = self.fetch_u8(pc)? as usize;
                let target = self.fetch_u16(pc)?;
                self.regs[r] = self.regs[r].wrapping_sub(1);
                if self.regs[r] != 0 {
                    self.seek(pc, target, op)?;
                }
            }
            0x0A => self.op_cond_jump(pc)?,
            0x0B => {
                // FADE
                let imm = self.fetch_u16(pc)?;
                io.video.request_palette((imm >> 8) as u8);
            }
            0x0C => self.op_reset_threads(pc)?,
            0x0D => {
                // PAGE
                let page = self.fetch_u8(pc)?;
                io.video.pages.select_work(page);
            }
            0x0E => {
                // FILL
                let page = self.fetch_u8(pc)?;
                let color = self.fetch_u8(pc)?;
                io.video.pages.fill(page, color);
            }
            0x0F => {
                // COPY
                let src = self.fetch_u8(pc)?;
                let dst = self.fetch_u8(pc)?;
                let vscroll = self.regs[VAR_SCROLL_Y];
                io.video.pages.copy(src, dst, vscroll);
            }
            0x10 => {
                // SHOW
                let page = self.fetch_u8(pc)?;
                self.op_show(page, io);
            }
            0x11 => return Ok(Flow::Halt),
            0x12 => {
                // PRINT
                let id = self.fetch_u16(pc)?;
                let x = self.fetch_u8(pc)?;
                let y = self.fetch_u8(pc)?;
                let color = self.fetch_u8(pc)?;
                io.video.draw_string(id, x, y, color);
            }
            0x13 => {
                // SUBR
                let dst = self.fetch_u8(pc)? as usize;
                let src = self.fetch_u8(pc)?;
                self.regs[dst] = self.regs[dst].wrapping_sub(self.reg(src));
            }
            0x14 => {
                // ANDI
                let r = self.fetch_u8(pc)? as usize;
                let imm = self.fetch_u16(pc)?;
                self.regs[r] = (self.regs[r] as u16 & imm) as i16;
            }
            0x15 => {
                // IORI
                let r = self.fetch_u8(pc)? as usize;
                let imm = self.fetch_u16(pc)?;
                self.regs[r] = (self.regs[r] as u16 | imm) as i16;
            }
            0x16 => {
                // LSLI
                let r = self.fetch_u8(pc)? as usize;
                let imm = self.fetch_u16(pc)?;
                self.regs[r] = ((self.regs[r] as u16) << (imm & 0x0F)) as i16;
            }
            0x17 => {
                // LSRI
                let r = self.fetch_u8(pc)? as usize;
                let imm = self.fetch_u16(pc)?;
                self.regs[r] = ((self.regs[r] as u16) >> (imm & 0x0F)) as i16;
            }
            0x18 => self.op_play_sound(pc, io)?,
            0x19 => self.op_load(pc, io)?,
            0x1A => self.op_play_music(pc, io)?,
            0x1B..=0x3F => {
                // Dead opcode space; consumed as a no-op.
                warn!(target: "vm", "dead opcode {op:#04x} at {op_pc:#06x}");
            }
            0x40..=0x7F => self.op_draw_shape_flags(op, pc, io)?,
            0x80..=0xFF => self.op_draw_shape_fixed(op, pc, io)?,
        }
        Ok(Flow::Continue)
    }

    // ── Control flow ─────────────────────────────────────────────────────────

    fn op_cond_jump(&mut self, pc: &mut usize) -> Result<(), Error> {
        let variant = self.fetch_u8(pc)?;
        let lhs = self.reg(self.fetch_u8(pc)?);
        let rhs: i16 = if variant & 0x80 != 0 {
            let r = self.fetch_u8(pc)?;
            self.reg(r)
        } else if variant & 0x40 != 0 {
            self.fetch_u16(pc)? as i16
        } else {
            // The original widens this operand as unsigned.
            self.fetch_u8(pc)? as i16
        };
        let target = self.fetch_u16(pc)?;
        let taken = match variant & 0x07 {
            0 => lhs == rhs,
            1 => lhs != rhs,
            2 => lhs > rhs,
            3 => lhs >= rhs,
            4 => lhs < rhs,
            5 => lhs <= rhs,
            other => {
                warn!(target: "vm", "conditional jump with comparator {other}");
                false
            }
        };
        if taken {
            self.seek(pc, target, 0x0A)?;
        }
        Ok(())
    }

    fn op_reset_threads(&mut self, pc: &mut usize) -> Result<(), Error> {
        let first = self.fetch_u8(pc)? as usize;
        let last = self.fetch_u8(pc)? as usize;
        let mode = self.fetch_u8(pc)?;
        if last < first || last >= NUM_THREADS {
            warn!(target: "vm", "thread reset with bad range {first}..={last}");
            return Ok(());
        }
        for t in &mut self.threads[first..=last] {
            match mode {
                0 => t.paused_next = Some(false),
                1 => t.paused_next = Some(true),
                2 => t.pc_next = Some(INACTIVE_PC),
                other => warn!(target: "vm", "thread reset with bad mode {other}"),
            }
        }
        Ok(())
    }

    // ── Video ────────────────────────────────────────────────────────────────

    fn op_show<B: Backend>(&mut self, page: u8, io: &mut Io<B>) {
        // Pace the frame by the bytecode-requested number of 20 ms slices.
        let slices = self.regs[VAR_PAUSE_SLICES].max(0) as u32;
        let deadline = self.last_frame_ms.wrapping_add(slices * TICK_MS);
        let now = io.backend.now_ms();
        let wait = deadline.wrapping_sub(now);
        if (wait as i32) > 0 {
            io.backend.sleep_ms(wait);
        }
        self.last_frame_ms = io.backend.now_ms();
        self.regs[0xF7] = 0; // cleared on every flip
        let (front, palette) = io.video.flip(page);
        io.backend.present(io.video.pages.page(front), &palette);
    }

    // ── Audio ────────────────────────────────────────────────────────────────

    fn op_play_sound<B: Backend>(&mut self, pc: &mut usize, io: &mut Io<B>) -> Result<(), Error> {
        let res = self.fetch_u16(pc)?;
        let freq = self.fetch_u8(pc)?;
        let vol = self.fetch_u8(pc)?;
        let channel = self.fetch_u8(pc)?;
        let mut audio = audio::lock(io.audio);
        if vol == 0 {
            audio.mixer.stop(channel);
            return Ok(());
        }
        let Some(payload) = io.res.resource(res) else {
            warn!(target: "vm", "sound {res:#06x} not loaded");
            return Ok(());
        };
        if let Some(sample) = Sample::parse(payload) {
            audio.mixer.play_index(channel, sample, freq % 40, vol.min(0x3F));
        }
        Ok(())
    }

    fn op_play_music<B: Backend>(&mut self, pc: &mut usize, io: &mut Io<B>) -> Result<(), Error> {
        let res = self.fetch_u16(pc)?;
        let delay = self.fetch_u16(pc)?;
        let position = self.fetch_u8(pc)?;
        let mut audio = audio::lock(io.audio);
        if res == 0 {
            if delay != 0 {
                audio.music.set_delay(delay);
            } else {
                audio.music.stop();
            }
            return Ok(());
        }
        let Some(payload) = io.res.resource(res) else {
            warn!(target: "vm", "music {res:#06x} not loaded");
            return Ok(());
        };
        let Some(mut module) = Module::parse(payload) else {
            return Ok(());
        };
        for (slot, &(sample_res, volume)) in module.instrument_refs.iter().enumerate() {
            if sample_res == 0 {
                continue;
            }
            match io.res.resource(sample_res).and_then(Sample::parse) {
                Some(sample) => {
                    module.instruments[slot] = Some(Instrument { sample, volume })
                }
                None => warn!(target: "vm", "instrument resource {sample_res:#06x} missing"),
            }
        }
        audio.music.start(module, delay, position);
        Ok(())
    }

    // ── Resources ────────────────────────────────────────────────────────────

    fn op_load<B: Backend>(&mut self, pc: &mut usize, io: &mut Io<B>) -> Result<(), Error> {
        let id = self.fetch_u16(pc)?;
        if id == 0 {
            // Free everything transient between scenes.
            audio::lock(io.audio).silence();
            io.res.invalidate_transient();
            return Ok(());
        }
        if id >= GAME_PART_FIRST {
            debug!(target: "vm", "part switch to {id:#06x} requested");
            self.requested_part = Some(id);
            return Ok(());
        }
        io.res.request_load(id);
        for bitmap in io.res.update()? {
            io.video.blit_bitmap(&bitmap);
        }
        Ok(())
    }

    // ── Shape opcodes ────────────────────────────────────────────────────────

    /// 0x80..=0xFF: the shape offset rides in the opcode byte; x/y are plain
    /// bytes with vertical overflow folded into x.
    fn op_draw_shape_fixed<B: Backend>(
        &mut self,
        op: u8,
        pc: &mut usize,
        io: &mut Io<B>,
    ) -> Result<(), Error> {
        let lsb = self.fetch_u8(pc)?;
        let offset = ((op as u16) << 8 | lsb as u16).wrapping_mul(2);
        let mut x = self.fetch_u8(pc)? as i16;
        let mut y = self.fetch_u8(pc)? as i16;
        let overflow = y - 199;
        if overflow > 0 {
            y = 199;
            x += overflow;
        }
        io.video.draw_shape(
            SegmentId::Cinematic,
            offset,
            COLOR_FROM_SHAPE,
            DEFAULT_ZOOM,
            Point::new(x, y),
        );
        Ok(())
    }

    /// 0x40..=0x7F: flag-decoded position, zoom and segment.
    fn op_draw_shape_flags<B: Backend>(
        &mut self,
        op: u8,
        pc: &mut usize,
        io: &mut Io<B>,
    ) -> Result<(), Error> {
        let offset = self.fetch_u16(pc)?.wrapping_mul(2);

        let mut x = self.fetch_u8(pc)? as i16;
        if op & 0x20 == 0 {
            if op & 0x10 == 0 {
                x = (x << 8) | self.fetch_u8(pc)? as i16;
            } else {
                x = self.reg(x as u8);
            }
        } else if op & 0x10 != 0 {
            x += 0x100;
        }

        let mut y = self.fetch_u8(pc)? as i16;
        if op & 0x08 == 0 {
            if op & 0x04 == 0 {
                y = (y << 8) | self.fetch_u8(pc)? as i16;
            } else {
                y = self.reg(y as u8);
            }
        }

        let mut segment = SegmentId::Cinematic;
        let mut zoom = DEFAULT_ZOOM;
        if op & 0x02 == 0 {
            if op & 0x01 != 0 {
                let r = self.fetch_u8(pc)?;
                zoom = self.reg(r) as u16;
            }
        } else if op & 0x01 != 0 {
            segment = SegmentId::SubCinematic;
        } else {
            zoom = self.fetch_u8(pc)? as u16;
        }

        io.video.draw_shape(segment, offset, COLOR_FROM_SHAPE, zoom, Point::new(x, y));
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Audio;
    use crate::backend::HeadlessBackend;
    use std::sync::atomic::AtomicI16;

    struct Rig {
        vm: Vm,
        video: Video,
        res: Resources,
        audio: SharedAudio,
        backend: HeadlessBackend,
        dir: std::path::PathBuf,
    }

    impl Rig {
        fn new(tag: &str, code: Vec<u8>) -> Rig {
            let dir = std::env::temp_dir().join(format!("aw-vm-{tag}-{}", std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("BANK01"), b"").unwrap();
            let mut ml = vec![0xFFu8];
            ml.extend_from_slice(&[0u8; 19]);
            std::fs::write(dir.join("MEMLIST.BIN"), ml).unwrap();
            let mut vm = Vm::new();
            vm.init_part(code.into());
            Rig {
                vm,
                video: Video::new(),
                res: Resources::open(&dir).unwrap(),
                audio: audio::shared(Audio::new(8000, Arc::new(AtomicI16::new(0)))),
                backend: HeadlessBackend::new(),
                dir,
            }
        }

        fn frame(&mut self) -> Result<(), Error> {
            self.vm.commit_thread_requests();
            let mut io = Io {
                video: &mut self.video,
                res: &mut self.res,
                audio: &self.audio,
                backend: &mut self.backend,
            };
            self.vm.run_frame(&mut io)
        }
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    #[test]
    fn arithmetic_and_yield() {
        // SETI r0, 7; ADDI r0, 3; SETR r1, r0; YIELD
        let mut rig = Rig::new(
            "arith",
            vec![0x00, 0, 0, 7, 0x03, 0, 0, 3, 0x01, 1, 0, 0x06],
        );
        rig.frame().unwrap();
        assert_eq!(rig.vm.regs[0], 10);
        assert_eq!(rig.vm.regs[1], 10);
    }

    #[test]
    fn yield_keeps_pc_after_the_opcode() {
        // YIELD; SETI r0, 1; YIELD; JUMP 4
        let mut rig = Rig::new(
            "yield",
            vec![0x06, 0x00, 0, 0, 1, 0x06, 0x07, 0, 4],
        );
        rig.frame().unwrap();
        assert_eq!(rig.vm.regs[0], 0);
        rig.frame().unwrap();
        assert_eq!(rig.vm.regs[0], 1);
    }

    #[test]
    fn negative_immediates_wrap_as_signed() {
        // SETI r0, -1 (0xFFFF); ADDI r0, 1; YIELD
        let mut rig = Rig::new(
            "neg",
            vec![0x00, 0, 0xFF, 0xFF, 0x03, 0, 0x00, 0x01, 0x06],
        );
        rig.frame().unwrap();
        assert_eq!(rig.vm.regs[0], 0);
    }

    #[test]
    fn conditional_jump_byte_operand_is_unsigned() {
        // SETI r0, 0x00C8 (200); CJMP eq r0, 0xC8 -> SETI r1, 5
        let mut rig = Rig::new(
            "cjmp",
            vec![
                0x00, 0, 0x00, 0xC8, // SETI r0, 200
                0x0A, 0x00, 0, 0xC8, 0x00, 0x0F, // CJMP eq r0, 0xC8, 0x000F
                0x06, // yield (not taken path)
                0x00, 0x02, 0, 0, // filler
                0x00, 1, 0, 5, // 0x000F: SETI r1, 5
                0x06,
            ],
        );
        rig.frame().unwrap();
        assert_eq!(rig.vm.regs[1], 5);
    }

    #[test]
    fn signed_comparison_in_conditional_jump() {
        // SETI r0, -5; SETI r1, 3; CJMP lt r0, r1 -> SETI r2, 1
        let mut rig = Rig::new(
            "signed",
            vec![
                0x00, 0, 0xFF, 0xFB, // r0 = -5
                0x00, 1, 0x00, 0x03, // r1 = 3
                0x0A, 0x84, 0, 1, 0x00, 0x10, // CJMP lt r0, [r1], 0x0010
                0x06, // skipped
                0x00, // filler
                0x00, 2, 0, 1, // 0x0010: SETI r2, 1
                0x06,
            ],
        );
        rig.frame().unwrap();
        assert_eq!(rig.vm.regs[2], 1);
    }

    #[test]
    fn dbra_loops_until_zero() {
        // SETI r0, 3; loop: ADDI r1, 1; DBRA r0, loop; YIELD
        let mut rig = Rig::new(
            "dbra",
            vec![
                0x00, 0, 0, 3, // SETI r0, 3
                0x03, 1, 0, 1, // 0x0004: ADDI r1, 1
                0x09, 0, 0x00, 0x04, // DBRA r0, 0x0004
                0x06,
            ],
        );
        rig.frame().unwrap();
        assert_eq!(rig.vm.regs[1], 3);
        assert_eq!(rig.vm.regs[0], 0);
    }

    #[test]
    fn call_and_return() {
        // CALL 0x0008; SETI r1, 2; YIELD @0x0008: SETI r0, 1; RET
        let mut rig = Rig::new(
            "call",
            vec![
                0x04, 0x00, 0x08, // CALL 0x0008
                0x00, 1, 0, 2, // SETI r1, 2
                0x06, // YIELD
                0x00, 0, 0, 1, // 0x0008: SETI r0, 1
                0x05, // RET
            ],
        );
        rig.frame().unwrap();
        assert_eq!(rig.vm.regs[0], 1);
        assert_eq!(rig.vm.regs[1], 2);
    }

    #[test]
    fn return_without_call_is_fatal() {
        let mut rig = Rig::new("ret", vec![0x05]);
        match rig.frame() {
            Err(Error::InvalidInstruction { opcode: 0x05, .. }) => {}
            other => panic!("expected stack underflow, got {other:?}"),
        }
    }

    #[test]
    fn jump_outside_bytecode_is_fatal() {
        let mut rig = Rig::new("oob", vec![0x07, 0x20, 0x00]);
        assert!(rig.frame().is_err());
    }

    #[test]
    fn started_thread_runs_next_frame() {
        // t0: START 1, 0x0005; HALT  t1 body: SETI r0, 9; HALT
        let mut rig = Rig::new(
            "start",
            vec![
                0x08, 1, 0x00, 0x05, // START thread 1 at 0x0005
                0x11, // HALT
                0x00, 0, 0, 9, // 0x0005: SETI r0, 9
                0x11,
            ],
        );
        rig.frame().unwrap();
        // Staged only: the new thread has not run yet.
        assert_eq!(rig.vm.regs[0], 0);
        assert!(!rig.vm.thread_active(1));
        rig.frame().unwrap();
        assert_eq!(rig.vm.regs[0], 9);
        assert!(!rig.vm.thread_active(0));
    }

    #[test]
    fn reset_mode_kills_at_commit() {
        // t0: START 1 at counter body; YIELD; RESET 1..1 kill; spin on YIELD
        let mut rig = Rig::new(
            "reset",
            vec![
                0x08, 1, 0x00, 0x0D, // START thread 1 at 0x000D
                0x06, // YIELD
                0x0C, 1, 1, 2, // RESET threads 1..=1 mode 2 (kill)
                0x06, // YIELD @9
                0x07, 0x00, 0x09, // JUMP 0x0009 (spin on yield)
                0x03, 0, 0, 1, // 0x000D: ADDI r0, 1
                0x06, // YIELD
                0x07, 0x00, 0x0D, // JUMP 0x000D
            ],
        );
        rig.frame().unwrap(); // t0 stages the start
        rig.frame().unwrap(); // t1 runs once, t0 stages the kill
        assert_eq!(rig.vm.regs[0], 1);
        assert!(rig.vm.thread_active(1));
        rig.frame().unwrap(); // kill committed before t1 would run again
        assert_eq!(rig.vm.regs[0], 1);
        assert!(!rig.vm.thread_active(1));
    }

    #[test]
    fn reset_with_out_of_range_last_is_rejected() {
        // RESET 0..=0xFF names thread ids beyond 63: warned and ignored,
        // so the started thread survives.
        let mut rig = Rig::new(
            "resetrange",
            vec![
                0x08, 1, 0x00, 0x0A, // START thread 1 at 0x000A
                0x06, // YIELD
                0x0C, 0x00, 0xFF, 2, // RESET threads 0..=255 mode 2 (kill)
                0x06, // YIELD
                0x06, 0x07, 0x00, 0x0A, // 0x000A: YIELD; JUMP 0x000A
            ],
        );
        rig.frame().unwrap(); // start staged
        rig.frame().unwrap(); // bad reset executes, changes nothing
        rig.frame().unwrap();
        assert!(rig.vm.thread_active(0));
        assert!(rig.vm.thread_active(1));
    }

    #[test]
    fn pause_and_resume_thread_range() {
        let mut rig = Rig::new(
            "pause",
            vec![
                0x08, 1, 0x00, 0x0F, // START thread 1 at 0x000F
                0x06, // YIELD @4
                0x0C, 1, 1, 1, // RESET pause 1..=1
                0x06, // YIELD @9
                0x0C, 1, 1, 0, // RESET resume 1..=1
                0x11, // HALT @14
                0x03, 0, 0, 1, // 0x000F: ADDI r0, 1
                0x06,
                0x07, 0x00, 0x0F,
            ],
        );
        rig.frame().unwrap(); // start staged
        rig.frame().unwrap(); // t1 +1, pause staged
        assert_eq!(rig.vm.regs[0], 1);
        rig.frame().unwrap(); // t1 paused, resume staged
        assert_eq!(rig.vm.regs[0], 1);
        assert!(rig.vm.thread_paused(1));
        rig.frame().unwrap(); // t1 resumed
        assert_eq!(rig.vm.regs[0], 2);
    }

    #[test]
    fn show_presents_through_the_backend() {
        // FILL page 1 color 3; SHOW page 1; HALT
        let mut rig = Rig::new(
            "show",
            vec![0x0E, 0x01, 0x03, 0x10, 0x01, 0x11],
        );
        rig.frame().unwrap();
        assert_eq!(rig.backend.frames_presented, 1);
        assert!(rig.backend.last_page.iter().all(|&b| b == 0x33));
    }

    #[test]
    fn pause_slices_stretch_frame_time() {
        // SETI 0xFF, 5; SHOW 1; SHOW 1; HALT
        let mut rig = Rig::new(
            "slices",
            vec![0x00, 0xFF, 0, 5, 0x10, 0x01, 0x10, 0x01, 0x11],
        );
        let t0 = rig.backend.now_ms();
        rig.frame().unwrap();
        let t1 = rig.backend.now_ms();
        assert!(t1 - t0 >= 100, "two shows at 5 slices should cover 100 ms");
    }

    #[test]
    fn load_request_for_part_id_is_staged() {
        let mut rig = Rig::new("loadpart", vec![0x19, 0x3E, 0x81, 0x06]);
        rig.frame().unwrap();
        assert_eq!(rig.vm.requested_part, Some(0x3E81));
    }

    #[test]
    fn dead_opcode_space_is_skipped() {
        let mut rig = Rig::new("dead", vec![0x1B, 0x3F, 0x00, 0, 0, 4, 0x06]);
        rig.frame().unwrap();
        assert_eq!(rig.vm.regs[0], 4);
    }

    #[test]
    fn runaway_thread_is_cut_not_fatal() {
        // JUMP 0 forever, never yielding.
        let mut rig = Rig::new("runaway", vec![0x07, 0x00, 0x00]);
        rig.frame().unwrap();
        assert!(rig.vm.thread_active(0));
    }
}
