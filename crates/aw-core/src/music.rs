// ── Music sequencer ───────────────────────────────────────────────────────────
//
// Protracker-style playback of the music resources: an order table selects
// 1024-byte patterns, each row carrying four channels of (note, info) word
// pairs. Rows are consumed on a millisecond timer derived from the module
// delay; the only VM-visible side effect is the music mark register, shared
// through an atomic because rows fire from the audio callback.

use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};

use crate::mixer::{Mixer, Sample, CHANNELS};

const ORDER_TABLE_LEN: usize = 128;
const PATTERN_SIZE: usize = 1024;
const ROW_BYTES: usize = 4 * CHANNELS;
/// Note words are Amiga periods against a 7.09 MHz Paula clock.
const PAULA_CLOCK: u32 = 7_159_092;

const NOTE_SET_MARK: u16 = 0xFFFD;
const NOTE_STOP_CHANNEL: u16 = 0xFFFE;

#[derive(Clone)]
pub struct Instrument {
    pub sample: Sample,
    pub volume: u16,
}

/// A parsed music resource plus its resolved instruments.
pub struct Module {
    data: Arc<[u8]>,
    pub delay: u16,
    pub num_order: u8,
    order: [u8; ORDER_TABLE_LEN],
    pub instruments: [Option<Instrument>; 15],
    /// (resource id, default volume) per instrument slot, for the caller to
    /// resolve against loaded sound resources.
    pub instrument_refs: [(u16, u16); 15],
}

impl Module {
    pub fn parse(data: Arc<[u8]>) -> Option<Module> {
        if data.len() < 0xC0 {
            warn!(target: "audio", "music resource too short: {} bytes", data.len());
            return None;
        }
        let delay = BigEndian::read_u16(&data[0..2]);
        let mut instrument_refs = [(0u16, 0u16); 15];
        for (i, slot) in instrument_refs.iter_mut().enumerate() {
            let off = 2 + i * 4;
            *slot = (
                BigEndian::read_u16(&data[off..off + 2]),
                BigEndian::read_u16(&data[off + 2..off + 4]),
            );
        }
        let num_order = BigEndian::read_u16(&data[0x3E..0x40]) as u8;
        let mut order = [0u8; ORDER_TABLE_LEN];
        order.copy_from_slice(&data[0x40..0xC0]);
        Some(Module {
            data,
            delay,
            num_order,
            order,
            instruments: Default::default(),
            instrument_refs,
        })
    }
}

pub struct Music {
    module: Option<Module>,
    cur_order: u8,
    row_offset: usize,
    delay_ms: u32,
    countdown_frames: u32,
    mark: Arc<AtomicI16>,
}

impl Music {
    pub fn new(mark: Arc<AtomicI16>) -> Self {
        Music {
            module: None,
            cur_order: 0,
            row_offset: 0,
            delay_ms: 0,
            countdown_frames: 0,
            mark,
        }
    }

    pub fn running(&self) -> bool {
        self.module.is_some()
    }

    /// Starts a module at the given order position. A zero delay keeps the
    /// module's own tempo word.
    pub fn start(&mut self, module: Module, delay: u16, position: u8) {
        let raw_delay = if delay == 0 { module.delay } else { delay };
        self.delay_ms = raw_delay as u32 * 60 / 7050;
        self.cur_order = position.min(module.num_order.saturating_sub(1));
        self.row_offset = 0;
        self.countdown_frames = 0;
        debug!(
            target: "audio",
            "music start: {} orders, tempo {} ms, position {}",
            module.num_order, self.delay_ms, self.cur_order
        );
        self.module = Some(module);
    }

    /// MUSIC with a zero resource id but non-zero delay only retunes the
    /// current module.
    pub fn set_delay(&mut self, delay: u16) {
        self.delay_ms = delay as u32 * 60 / 7050;
    }

    pub fn stop(&mut self) {
        self.module = None;
    }

    /// Renders `out` through the mixer while consuming pattern rows at the
    /// module tempo. Called from the audio callback.
    pub fn mix(&mut self, mixer: &mut Mixer, out: &mut [i16]) {
        let frames = out.len() / 2;
        let mut done = 0usize;
        while done < frames {
            if self.module.is_none() {
                mixer.render(&mut out[done * 2..]);
                return;
            }
            if self.countdown_frames == 0 {
                self.step_row(mixer);
                let rate = mixer.output_rate();
                self.countdown_frames = (rate * self.delay_ms / 1000).max(1);
                continue;
            }
            let n = (self.countdown_frames as usize).min(frames - done);
            mixer.render(&mut out[done * 2..(done + n) * 2]);
            self.countdown_frames -= n as u32;
            done += n;
        }
    }

    fn step_row(&mut self, mixer: &mut Mixer) {
        let mut row = [(0u16, 0u16); CHANNELS];
        {
            let Some(module) = &self.module else { return };
            let order = module.order[self.cur_order as usize % ORDER_TABLE_LEN];
            let base = 0xC0 + order as usize * PATTERN_SIZE + self.row_offset;
            if base + ROW_BYTES > module.data.len() {
                warn!(target: "audio", "pattern row beyond module data, stopping");
                self.module = None;
                return;
            }
            for (ch, slot) in row.iter_mut().enumerate() {
                let off = base + ch * 4;
                *slot = (
                    BigEndian::read_u16(&module.data[off..off + 2]),
                    BigEndian::read_u16(&module.data[off + 2..off + 4]),
                );
            }
        }
        for (ch, &(note, info)) in row.iter().enumerate() {
            self.handle_row(ch as u8, note, info, mixer);
        }
        let Some(module) = &self.module else { return };
        self.row_offset += ROW_BYTES;
        if self.row_offset >= PATTERN_SIZE {
            self.row_offset = 0;
            self.cur_order += 1;
            if self.cur_order >= module.num_order {
                debug!(target: "audio", "music finished");
                self.module = None;
            }
        }
    }

    fn handle_row(&self, channel: u8, note: u16, info: u16, mixer: &mut Mixer) {
        match note {
            0 => {}
            NOTE_SET_MARK => self.mark.store(info as i16, Ordering::Relaxed),
            NOTE_STOP_CHANNEL => mixer.stop(channel),
            period => {
                let Some(module) = &self.module else { return };
                let index = (info >> 12) as usize;
                if index == 0 {
                    return;
                }
                let Some(ins) = &module.instruments[index - 1] else { return };
                let mut volume = ins.volume as i32;
                match (info >> 8) & 0x0F {
                    5 => volume += (info & 0xFF) as i32,
                    6 => volume -= (info & 0xFF) as i32,
                    _ => {}
                }
                let volume = volume.clamp(0, 0x3F) as u8;
                let freq = PAULA_CLOCK / (period as u32 * 2);
                mixer.play(channel, ins.sample.clone(), freq, volume);
            }
        }
    }
}
