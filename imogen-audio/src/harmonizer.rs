//! Polyphonic harmonizer - MIDI handling, voice allocation and stereo mixing

use crate::config::{AutoVoiceConfig, EngineConfig, UnvoicedBehavior};
use crate::midi::{
    cc, frequency_to_midi, midi_to_frequency, MidiMessage, MidiNote, NoteTable, PITCH_BEND_CENTER,
    PITCH_BEND_MAX,
};
use crate::pan::PAN_CENTER;
use crate::panning::PanningManager;
use crate::voice::{NoteTrigger, SynthesisContext, Voice, VoiceKind, VoiceState};

/// Counters reported with each status update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Grains skipped because a voice's pool was full
    pub dropped_grains: u64,
    /// Note-ons that found no voice
    pub dropped_notes: u64,
    /// Most grains any voice had sounding at once
    pub peak_active_grains: usize,
    /// Grain buffers per voice
    pub grain_capacity: usize,
    pub active_voices: usize,
}

/// Owns the voice pool and turns note events into sounding voices
pub struct Harmonizer {
    concert_pitch: f32,
    voices: Vec<Voice>,
    panning: PanningManager,
    /// Sounding keyboard note -> voice index
    note_voices: NoteTable<usize>,
    /// Keys physically down, with their velocity
    held: NoteTable<u8>,
    /// Interval-lock offsets per voice, in semitones above the input
    locked: Vec<Option<f32>>,
    interval_lock: bool,
    sustain: bool,
    latch: bool,
    pitch_bend: u16,
    bend_up: f32,
    bend_down: f32,
    velocity_sensitivity: f32,
    lowest_panned_note: u8,
    voice_stealing: bool,
    unvoiced: UnvoicedBehavior,
    pedal: AutoVoiceConfig,
    descant: AutoVoiceConfig,
    pedal_voice: Option<usize>,
    descant_voice: Option<usize>,
    /// Last voiced input frequency
    input_hz: Option<f32>,
    scratch: Vec<f32>,
    /// Sample clock at the start of the current block
    clock: u64,
    dropped_notes: u64,
}

impl Harmonizer {
    /// Build the voice pool.
    ///
    /// `max_grain_len` bounds every grain buffer and `max_render_len` the
    /// longest slice passed to [`render`](Self::render).
    pub fn new(config: &EngineConfig, max_grain_len: usize, max_render_len: usize) -> Self {
        let voices: Vec<Voice> = (0..config.num_voices)
            .map(|id| {
                let mut voice =
                    Voice::new(id, config.sample_rate, config.grains_per_voice, max_grain_len);
                voice.set_envelope(config.attack_ms, config.release_ms);
                voice
            })
            .collect();

        Self {
            concert_pitch: config.concert_pitch,
            panning: PanningManager::new(config.num_voices, config.stereo_width),
            locked: vec![None; voices.len()],
            voices,
            note_voices: NoteTable::new(),
            held: NoteTable::new(),
            interval_lock: false,
            sustain: false,
            latch: false,
            pitch_bend: PITCH_BEND_CENTER,
            bend_up: config.bend_up,
            bend_down: config.bend_down,
            velocity_sensitivity: config.velocity_sensitivity,
            lowest_panned_note: config.lowest_panned_note,
            voice_stealing: config.voice_stealing,
            unvoiced: config.unvoiced,
            pedal: config.pedal_pitch,
            descant: config.descant,
            pedal_voice: None,
            descant_voice: None,
            input_hz: None,
            scratch: vec![0.0; max_render_len],
            clock: 0,
            dropped_notes: 0,
        }
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn voice(&self, id: usize) -> Option<&Voice> {
        self.voices.get(id)
    }

    pub fn active_voice_count(&self) -> usize {
        self.voices.iter().filter(|v| !v.is_idle()).count()
    }

    /// Voice sounding `note` from the keyboard
    pub fn voice_for_note(&self, note: MidiNote) -> Option<&Voice> {
        self.note_voices.get(note).map(|i| &self.voices[i])
    }

    pub fn pedal_voice(&self) -> Option<&Voice> {
        self.pedal_voice.map(|i| &self.voices[i])
    }

    pub fn descant_voice(&self) -> Option<&Voice> {
        self.descant_voice.map(|i| &self.voices[i])
    }

    pub fn panning(&self) -> &PanningManager {
        &self.panning
    }

    pub fn unvoiced_behavior(&self) -> UnvoicedBehavior {
        self.unvoiced
    }

    pub fn is_latched(&self) -> bool {
        self.latch
    }

    pub fn is_sustained(&self) -> bool {
        self.sustain
    }

    pub fn is_interval_locked(&self) -> bool {
        self.interval_lock
    }

    /// Set the sample clock of the block about to be rendered
    pub fn set_clock(&mut self, clock: u64) {
        self.clock = clock;
    }

    /// Apply one MIDI message at block index `offset`
    pub fn handle_midi(&mut self, message: MidiMessage, offset: usize) {
        match message {
            MidiMessage::NoteOn { note, velocity } => self.note_on(note, velocity, offset),
            MidiMessage::NoteOff { note, .. } => self.note_off(note, offset),
            MidiMessage::ControlChange { controller, value } => match controller {
                cc::SUSTAIN => self.set_sustain(value >= 64, offset),
                cc::ALL_NOTES_OFF => self.all_notes_off(),
                cc::ALL_SOUND_OFF => self.all_sound_off(),
                _ => {}
            },
            MidiMessage::PitchBend(value) => self.set_pitch_bend(value),
        }
    }

    pub fn note_on(&mut self, note: MidiNote, velocity: u8, offset: usize) {
        if velocity == 0 {
            self.note_off(note, offset);
            return;
        }
        // The chord is frozen while locked
        if self.interval_lock {
            return;
        }
        self.held.insert(note, velocity);

        let trigger = NoteTrigger {
            note,
            kind: VoiceKind::Keyboard,
            velocity,
            level: self.velocity_level(velocity),
            target_hz: self.note_frequency(note),
        };

        if let Some(index) = self.note_voices.get(note) {
            self.voices[index].start(trigger, offset, self.clock + offset as u64);
        } else {
            let Some(index) = self.allocate_voice() else {
                self.dropped_notes += 1;
                return;
            };
            self.start_voice(index, trigger, offset);
            self.note_voices.insert(note, index);
        }
        self.update_auto_voices(offset);
    }

    pub fn note_off(&mut self, note: MidiNote, offset: usize) {
        self.held.remove(note);
        if self.is_holding() {
            return;
        }
        if let Some(index) = self.note_voices.get(note) {
            self.voices[index].release();
        }
        self.update_auto_voices(offset);
    }

    /// Hold released notes while the pedal is down
    pub fn set_sustain(&mut self, on: bool, offset: usize) {
        self.sustain = on;
        if !self.is_holding() {
            self.release_unheld(offset);
        }
    }

    /// Like the sustain pedal, but toggled from the control surface
    pub fn set_latch(&mut self, on: bool, offset: usize) {
        self.latch = on;
        if !self.is_holding() {
            self.release_unheld(offset);
        }
    }

    pub fn set_pitch_bend(&mut self, value: u16) {
        self.pitch_bend = value.min(PITCH_BEND_MAX);
        self.retarget();
    }

    /// Release every voice
    pub fn all_notes_off(&mut self) {
        self.held.clear();
        for voice in &mut self.voices {
            voice.release();
        }
        self.pedal_voice = None;
        self.descant_voice = None;
    }

    /// Silence every voice immediately
    pub fn all_sound_off(&mut self) {
        self.held.clear();
        for index in 0..self.voices.len() {
            if !self.voices[index].is_idle() {
                self.detach(index);
                self.voices[index].kill();
            }
        }
    }

    /// Freeze the sounding chord as intervals from the current input pitch.
    ///
    /// While locked, note events are ignored and voices follow the input.
    pub fn set_interval_lock(&mut self, on: bool) {
        if on == self.interval_lock {
            return;
        }
        self.interval_lock = on;

        if on {
            if let Some(input_hz) = self.input_hz {
                let input = frequency_to_midi(input_hz, self.concert_pitch);
                for (voice, locked) in self.voices.iter().zip(self.locked.iter_mut()) {
                    *locked = (!voice.is_idle() && voice.target_frequency() > 0.0).then(|| {
                        frequency_to_midi(voice.target_frequency(), self.concert_pitch) - input
                    });
                }
            }
        } else {
            self.locked.fill(None);
            self.retarget();
            if !self.is_holding() {
                self.release_unheld(0);
            }
        }
    }

    /// Report the detected input frequency for this block
    pub fn set_input_pitch(&mut self, hz: Option<f32>) {
        if let Some(hz) = hz.filter(|hz| *hz > 0.0) {
            self.input_hz = Some(hz);
            if self.interval_lock {
                self.retarget();
            }
        }
    }

    pub fn stereo_width(&self) -> u8 {
        self.panning.stereo_width()
    }

    /// Respread the pool; sounding voices move to the closest new value
    pub fn set_stereo_width(&mut self, width: u8) {
        if !self.panning.set_stereo_width(width) {
            return;
        }
        for voice in &mut self.voices {
            if !voice.is_idle() && voice.pan_from_pool() {
                let value = self.panning.take_closest(voice.pan().value());
                voice.set_pan(value, true);
            }
        }
    }

    /// Pin a voice's pan, taking it out of the automatic spread.
    ///
    /// Returns `false` for an unknown voice or an unchanged value.
    pub fn set_voice_pan(&mut self, id: usize, value: u8) -> bool {
        let Some(voice) = self.voices.get_mut(id) else {
            return false;
        };
        if voice.pan_from_pool() {
            self.panning.release(voice.pan().value());
        }
        voice.set_pan(value, false)
    }

    pub fn set_pedal_pitch(&mut self, config: AutoVoiceConfig) {
        self.pedal = config;
        self.update_auto_voices(0);
    }

    pub fn set_descant(&mut self, config: AutoVoiceConfig) {
        self.descant = config;
        self.update_auto_voices(0);
    }

    /// Render every sounding voice, adding into interleaved stereo `output`
    /// whose first frame is block index `start`
    pub fn render(&mut self, ctx: &SynthesisContext<'_>, output: &mut [f32], start: usize) {
        let frames = (output.len() / 2).min(self.scratch.len());
        let output = &mut output[..frames * 2];

        for index in 0..self.voices.len() {
            if self.voices[index].is_idle() {
                continue;
            }
            let mono = &mut self.scratch[..frames];
            let voice = &mut self.voices[index];
            voice.render(ctx, mono, start);
            voice.mix_into(mono, output);

            if voice.is_idle() {
                self.detach(index);
            }
        }
    }

    /// Finish a block of `block_len` samples
    pub fn end_block(&mut self, block_len: usize) {
        for voice in &mut self.voices {
            voice.end_block(block_len);
        }
    }

    pub fn stats(&self) -> RenderStats {
        RenderStats {
            dropped_grains: self.voices.iter().map(Voice::dropped_grains).sum(),
            dropped_notes: self.dropped_notes,
            peak_active_grains: self
                .voices
                .iter()
                .map(Voice::peak_active_grains)
                .max()
                .unwrap_or(0),
            grain_capacity: self.voices.first().map_or(0, Voice::grain_capacity),
            active_voices: self.active_voice_count(),
        }
    }

    /// Clear counters after they have been reported
    pub fn reset_stats(&mut self) {
        self.dropped_notes = 0;
        for voice in &mut self.voices {
            voice.reset_stats();
        }
    }

    /// Silence everything and forget all note state
    pub fn reset(&mut self) {
        self.all_sound_off();
        self.note_voices.clear();
        self.locked.fill(None);
        self.panning.reset();
        self.interval_lock = false;
        self.sustain = false;
        self.latch = false;
        self.pitch_bend = PITCH_BEND_CENTER;
        self.input_hz = None;
    }

    /// Whether released keys must keep sounding
    fn is_holding(&self) -> bool {
        self.sustain || self.latch || self.interval_lock
    }

    fn velocity_level(&self, velocity: u8) -> f32 {
        let v = velocity.min(127) as f32 / 127.0;
        1.0 + (v - 1.0) * self.velocity_sensitivity
    }

    fn bend_semitones(&self) -> f32 {
        let offset = self.pitch_bend as f32 - PITCH_BEND_CENTER as f32;
        if offset >= 0.0 {
            offset / (PITCH_BEND_MAX - PITCH_BEND_CENTER) as f32 * self.bend_up
        } else {
            offset / PITCH_BEND_CENTER as f32 * self.bend_down
        }
    }

    fn note_frequency(&self, note: MidiNote) -> f32 {
        midi_to_frequency(note.number() as f32 + self.bend_semitones(), self.concert_pitch)
    }

    fn voice_frequency(&self, index: usize) -> Option<f32> {
        let voice = &self.voices[index];
        if let (Some(interval), Some(input_hz)) = (self.locked[index], self.input_hz) {
            let input = frequency_to_midi(input_hz, self.concert_pitch);
            return Some(midi_to_frequency(input + interval, self.concert_pitch));
        }
        voice.note().map(|note| self.note_frequency(note))
    }

    fn retarget(&mut self) {
        for index in 0..self.voices.len() {
            if self.voices[index].is_idle() {
                continue;
            }
            if let Some(hz) = self.voice_frequency(index) {
                self.voices[index].set_target_frequency(hz);
            }
        }
    }

    /// Free voice, or the one to steal
    fn allocate_voice(&mut self) -> Option<usize> {
        if let Some(index) = self.find_idle() {
            return Some(index);
        }
        if !self.voice_stealing {
            return None;
        }

        let oldest = |state: Option<VoiceState>| {
            self.voices
                .iter()
                .enumerate()
                .filter(|(_, v)| state.map_or(true, |s| v.state() == s))
                .min_by_key(|(_, v)| v.started_at())
                .map(|(i, _)| i)
        };
        let index = oldest(Some(VoiceState::Releasing)).or_else(|| oldest(None))?;
        self.detach(index);
        Some(index)
    }

    fn find_idle(&self) -> Option<usize> {
        self.voices.iter().position(Voice::is_idle)
    }

    fn start_voice(&mut self, index: usize, trigger: NoteTrigger, offset: usize) {
        let pooled = trigger.kind == VoiceKind::Keyboard
            && trigger.note.number() >= self.lowest_panned_note;
        let pan = if pooled {
            self.panning.next_pan()
        } else {
            PAN_CENTER
        };

        let voice = &mut self.voices[index];
        if voice.is_idle() {
            voice.assign_pan(pan, pooled);
        } else {
            voice.set_pan(pan, pooled);
        }
        voice.start(trigger, offset, self.clock + offset as u64);
        self.locked[index] = None;
    }

    /// Drop every reference to a voice that stopped or is being stolen
    fn detach(&mut self, index: usize) {
        let voice = &mut self.voices[index];
        if voice.pan_from_pool() {
            let value = voice.pan().value();
            self.panning.release(value);
            voice.set_pan(value, false);
        }
        // A voice that finished has already forgotten its note
        self.note_voices.retain(|_, i| i != index);
        if self.pedal_voice == Some(index) {
            self.pedal_voice = None;
        }
        if self.descant_voice == Some(index) {
            self.descant_voice = None;
        }
        self.locked[index] = None;
    }

    fn release_unheld(&mut self, offset: usize) {
        for (note, index) in self.note_voices.iter() {
            if !self.held.contains(note) {
                self.voices[index].release();
            }
        }
        self.update_auto_voices(offset);
    }

    /// Keep the pedal and descant voices on the current chord edges
    fn update_auto_voices(&mut self, offset: usize) {
        let mut lowest: Option<(MidiNote, u8)> = None;
        let mut highest: Option<(MidiNote, u8)> = None;
        for (note, index) in self.note_voices.iter() {
            let voice = &self.voices[index];
            if voice.state() != VoiceState::Active {
                continue;
            }
            if lowest.is_none() {
                lowest = Some((note, voice.velocity()));
            }
            highest = Some((note, voice.velocity()));
        }

        let pedal = self.pedal;
        let desired = lowest
            .filter(|(note, _)| pedal.enabled && note.number() < pedal.threshold)
            .and_then(|(note, vel)| Some((note.transpose(-(pedal.interval as i16))?, vel)));
        self.pedal_voice = self.follow(self.pedal_voice, desired, VoiceKind::PedalPitch, offset);

        let descant = self.descant;
        let desired = highest
            .filter(|(note, _)| descant.enabled && note.number() > descant.threshold)
            .and_then(|(note, vel)| Some((note.transpose(descant.interval as i16)?, vel)));
        self.descant_voice = self.follow(self.descant_voice, desired, VoiceKind::Descant, offset);
    }

    /// Move an automated voice to `desired`, returning the voice now used
    fn follow(
        &mut self,
        current: Option<usize>,
        desired: Option<(MidiNote, u8)>,
        kind: VoiceKind,
        offset: usize,
    ) -> Option<usize> {
        if let (Some(index), Some((note, _))) = (current, desired) {
            if self.voices[index].note() == Some(note) {
                return current;
            }
        }
        if let Some(index) = current {
            self.voices[index].release();
        }

        let (note, velocity) = desired?;
        let Some(index) = self.find_idle() else {
            self.dropped_notes += 1;
            return None;
        };
        let trigger = NoteTrigger {
            note,
            kind,
            velocity,
            level: self.velocity_level(velocity),
            target_hz: self.note_frequency(note),
        };
        self.start_voice(index, trigger, offset);
        Some(index)
    }
}
