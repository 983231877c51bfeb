// ── Audio state ───────────────────────────────────────────────────────────────
//
// Mixer and sequencer live together behind one mutex: the engine thread
// issues play/stop from opcodes, the backend's callback (or the engine's
// inline pump when there is no device) renders. The lock is never held
// across a callback into VM code.

use std::sync::atomic::AtomicI16;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::mixer::Mixer;
use crate::music::Music;

pub struct Audio {
    pub mixer: Mixer,
    pub music: Music,
}

impl Audio {
    pub fn new(sample_rate: u32, mark: Arc<AtomicI16>) -> Self {
        Audio { mixer: Mixer::new(sample_rate), music: Music::new(mark) }
    }

    /// Renders one buffer: the sequencer owns the clock and pulls the mixer.
    pub fn render(&mut self, out: &mut [i16]) {
        self.music.mix(&mut self.mixer, out);
    }

    /// Silences everything; used by LOAD 0 and part changes before the
    /// resource arena is invalidated.
    pub fn silence(&mut self) {
        self.music.stop();
        self.mixer.stop_all();
    }
}

pub type SharedAudio = Arc<Mutex<Audio>>;

pub fn shared(audio: Audio) -> SharedAudio {
    Arc::new(Mutex::new(audio))
}

/// Locks the audio state, recovering from a poisoned mutex: a panicking
/// audio callback must not take the engine down with it.
pub fn lock(audio: &SharedAudio) -> MutexGuard<'_, Audio> {
    audio.lock().unwrap_or_else(PoisonError::into_inner)
}
