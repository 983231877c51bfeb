// ── Engine ────────────────────────────────────────────────────────────────────
//
// Frame loop over the VM: commit staged thread state, reflect input into the
// registers, run every thread for one slice, then keep the audio clock
// moving. Part transitions requested by the bytecode are honored between
// frames.

use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::audio::{self, Audio, SharedAudio};
use crate::backend::{Backend, InputState};
use crate::error::Error;
use crate::parts::GAME_PART_FIRST;
use crate::resources::Resources;
use crate::video::Video;
use crate::vm::{
    Io, Vm, TICK_MS, VAR_HERO_ACTION, VAR_HERO_ACTION_POS_MASK, VAR_HERO_POS_JUMP_DOWN,
    VAR_HERO_POS_LEFT_RIGHT, VAR_HERO_POS_MASK, VAR_HERO_POS_UP_DOWN, VAR_LAST_KEY,
    VAR_MUSIC_MARK, VAR_RANDOM_SEED,
};

#[derive(Debug, Clone, Copy)]
pub struct BootOptions {
    /// Part index 0..=9 (offset into the part table).
    pub part: u16,
    pub skip_protection: bool,
    pub sample_rate: u32,
}

impl Default for BootOptions {
    fn default() -> Self {
        BootOptions { part: 1, skip_protection: false, sample_rate: 22050 }
    }
}

pub struct Engine<B: Backend> {
    pub vm: Vm,
    pub video: Video,
    pub res: Resources,
    pub backend: B,
    pub audio: SharedAudio,
    mark: Arc<AtomicI16>,
    audio_started: bool,
    scratch: Vec<i16>,
    pub frames_run: u64,
}

impl<B: Backend> Engine<B> {
    pub fn new(res: Resources, backend: B, options: BootOptions) -> Result<Self, Error> {
        let mark = Arc::new(AtomicI16::new(0));
        let audio = audio::shared(Audio::new(options.sample_rate, mark.clone()));
        let mut engine = Engine {
            vm: Vm::new(),
            video: Video::new(),
            res,
            backend,
            audio,
            mark,
            audio_started: false,
            scratch: vec![0i16; (options.sample_rate / (1000 / TICK_MS)) as usize * 2],
            frames_run: 0,
        };
        let mut part = options.part;
        if options.skip_protection {
            engine.vm.bypass_protection();
            if part == 0 {
                part = 1;
            }
        }
        engine.setup_part(GAME_PART_FIRST + part)?;
        Ok(engine)
    }

    /// Tries to hand the mixer to the backend's audio device. Without one
    /// the engine renders a frame's worth of samples inline each tick.
    pub fn start_audio(&mut self) {
        let shared = self.audio.clone();
        let rate = audio::lock(&self.audio).mixer.output_rate();
        let callback = Box::new(move |out: &mut [i16]| audio::lock(&shared).render(out));
        self.audio_started = self.backend.start_audio(rate, callback);
        debug!(target: "engine", "audio device: {}", self.audio_started);
    }

    pub fn setup_part(&mut self, part: u16) -> Result<(), Error> {
        info!(target: "engine", "entering part {part:#06x}");
        audio::lock(&self.audio).silence();
        let segments = self.res.load_part(part)?;
        self.video.bind_part(&segments);
        self.vm.init_part(segments.bytecode.clone());
        Ok(())
    }

    /// One engine frame. Returns false once the backend reports quit.
    pub fn frame(&mut self) -> Result<bool, Error> {
        if let Some(part) = self.vm.requested_part.take() {
            self.setup_part(part)?;
        }
        self.vm.commit_thread_requests();

        let input = self.backend.poll_input();
        if input.quit {
            return Ok(false);
        }
        if input.pause {
            self.backend.sleep_ms(TICK_MS);
            return Ok(true);
        }
        self.reflect_input(input);
        self.advance_seed();
        self.vm.regs[VAR_MUSIC_MARK] = self.mark.load(Ordering::Relaxed);

        let mut io = Io {
            video: &mut self.video,
            res: &mut self.res,
            audio: &self.audio,
            backend: &mut self.backend,
        };
        self.vm.run_frame(&mut io)?;

        if !self.audio_started {
            audio::lock(&self.audio).render(&mut self.scratch);
        }
        self.frames_run += 1;
        Ok(true)
    }

    /// Runs until quit, a fatal error, or `limit` frames.
    pub fn run(&mut self, limit: Option<u64>) -> Result<(), Error> {
        let result = loop {
            match self.frame() {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
            if let Some(limit) = limit {
                if self.frames_run >= limit {
                    break Ok(());
                }
            }
        };
        self.backend.stop_audio();
        result
    }

    fn reflect_input(&mut self, input: InputState) {
        let regs = &mut self.vm.regs;
        let mut mask = input.mask;
        if input.horz > 0 {
            mask |= 0x01;
        } else if input.horz < 0 {
            mask |= 0x02;
        }
        if input.vert > 0 {
            mask |= 0x04;
        } else if input.vert < 0 {
            mask |= 0x08;
        }
        regs[VAR_HERO_POS_LEFT_RIGHT] = input.horz as i16;
        regs[VAR_HERO_POS_UP_DOWN] = input.vert as i16;
        regs[VAR_HERO_POS_JUMP_DOWN] = input.vert as i16;
        regs[VAR_HERO_POS_MASK] = (mask & 0x0F) as i16;
        regs[VAR_HERO_ACTION] = input.button as i16;
        regs[VAR_HERO_ACTION_POS_MASK] =
            ((mask & 0x0F) | if input.button { 0x80 } else { 0 }) as i16;
        if input.key != 0 {
            regs[VAR_LAST_KEY] = input.key as i16;
        }
    }

    fn advance_seed(&mut self) {
        let seed = self.vm.regs[VAR_RANDOM_SEED] as u16;
        self.vm.regs[VAR_RANDOM_SEED] = seed.wrapping_mul(0x6255).wrapping_add(0x3619) as i16;
    }
}
