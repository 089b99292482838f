//! Synthesis voices
//!
//! A voice resynthesizes the input at its own target period by copying
//! windowed grains out of the analysis window and overlap-adding them at the
//! target spacing. Each voice owns a fixed pool of grain buffers so scheduling
//! never allocates.

use crate::config::UnvoicedBehavior;
use crate::midi::MidiNote;
use crate::pan::PanState;
use imogen_analysis::{GrainExtractor, WindowCache};
use std::f32::consts::PI;

/// Grains overlap at most three deep, one spare
pub const DEFAULT_GRAINS_PER_VOICE: usize = 4;

/// Corner of the output DC blocker
const DC_CUTOFF_HZ: f32 = 20.0;
/// Gain at which a releasing voice is considered finished
const SILENCE_GAIN: f32 = 1e-4;
/// Shortest grain spacing scheduled
const MIN_SPACING: f32 = 2.0;

/// Lifecycle of one grain buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrainState {
    /// Free for reuse
    #[default]
    Idle,
    /// Before the window centre
    Active,
    /// Past the window centre, fading out while the next grain fades in
    Releasing,
}

/// One windowed grain being written to the output
#[derive(Debug, Clone)]
pub struct SynthesisGrain {
    samples: Vec<f32>,
    source_start: usize,
    write_offset: usize,
    len: usize,
    pos: usize,
    state: GrainState,
}

impl SynthesisGrain {
    fn new(max_len: usize) -> Self {
        Self {
            samples: vec![0.0; max_len],
            source_start: 0,
            write_offset: 0,
            len: 0,
            pos: 0,
            state: GrainState::Idle,
        }
    }

    pub fn state(&self) -> GrainState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == GrainState::Idle
    }

    /// Analysis window index the grain was copied from
    pub fn source_start(&self) -> usize {
        self.source_start
    }

    /// Block index where writing started
    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Samples written so far
    pub fn position(&self) -> usize {
        self.pos
    }

    fn start(&mut self, source: &[f32], window: &[f32], source_start: usize, write_offset: usize) {
        let len = source.len().min(window.len()).min(self.samples.len());
        for ((dst, &x), &w) in self.samples[..len].iter_mut().zip(source).zip(window) {
            *dst = x * w;
        }
        self.source_start = source_start;
        self.write_offset = write_offset;
        self.len = len;
        self.pos = 0;
        self.state = if len > 0 {
            GrainState::Active
        } else {
            GrainState::Idle
        };
    }

    #[inline]
    fn next_sample(&mut self) -> f32 {
        if self.state == GrainState::Idle {
            return 0.0;
        }
        let x = self.samples[self.pos];
        self.pos += 1;
        if self.pos >= self.len {
            self.state = GrainState::Idle;
        } else if self.pos > self.len / 2 {
            self.state = GrainState::Releasing;
        }
        x
    }

    fn stop(&mut self) {
        self.state = GrainState::Idle;
        self.pos = 0;
        self.len = 0;
    }
}

/// Read-only view of the current analysis results, lent to voices for one
/// render call
#[derive(Clone, Copy)]
pub struct SynthesisContext<'a> {
    /// Analysis window, oldest sample first
    pub window: &'a [f32],
    /// Onsets extracted from `window`
    pub grains: &'a GrainExtractor,
    /// Window index of the block's first output sample
    pub block_start: usize,
    /// Period the onsets were extracted at
    pub source_period: f32,
    pub voiced: bool,
    pub unvoiced: UnvoicedBehavior,
}

/// Voice lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceState {
    #[default]
    Idle,
    /// Sounding at its held level
    Active,
    /// Ramping down to silence
    Releasing,
}

/// What started a voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceKind {
    /// A played note
    #[default]
    Keyboard,
    /// Doubling below the lowest held note
    PedalPitch,
    /// Doubling above the highest held note
    Descant,
}

/// Parameters of a note-on, as resolved by the harmonizer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteTrigger {
    pub note: MidiNote,
    pub kind: VoiceKind,
    pub velocity: u8,
    /// Held gain after velocity scaling
    pub level: f32,
    pub target_hz: f32,
}

/// One pitch-shifted copy of the input
#[derive(Debug, Clone)]
pub struct Voice {
    id: usize,
    sample_rate: f32,
    state: VoiceState,
    kind: VoiceKind,
    note: Option<MidiNote>,
    velocity: u8,
    target_hz: f32,
    pan: PanState,
    pan_from_pool: bool,
    grains: Vec<SynthesisGrain>,
    window: WindowCache,
    max_grain_len: usize,
    /// Block index of the next grain, relative to the current block start
    next_synthesis_index: f64,
    gain: f32,
    level: f32,
    attack_step: f32,
    release_step: f32,
    dc_state: f32,
    dc_coeff: f32,
    started_at: u64,
    dropped_grains: u64,
    peak_active_grains: usize,
}

impl Voice {
    /// Create an idle voice with `grain_count` grain buffers of
    /// `max_grain_len` samples
    pub fn new(id: usize, sample_rate: f64, grain_count: usize, max_grain_len: usize) -> Self {
        let sr = sample_rate as f32;
        let mut voice = Self {
            id,
            sample_rate: sr,
            state: VoiceState::Idle,
            kind: VoiceKind::Keyboard,
            note: None,
            velocity: 0,
            target_hz: 0.0,
            pan: PanState::default(),
            pan_from_pool: false,
            grains: (0..grain_count)
                .map(|_| SynthesisGrain::new(max_grain_len))
                .collect(),
            window: WindowCache::new(max_grain_len),
            max_grain_len,
            next_synthesis_index: 0.0,
            gain: 0.0,
            level: 1.0,
            attack_step: 1.0,
            release_step: 1.0,
            dc_state: 0.0,
            dc_coeff: (-2.0 * PI * DC_CUTOFF_HZ / sr).exp(),
            started_at: 0,
            dropped_grains: 0,
            peak_active_grains: 0,
        };
        voice.set_envelope(0.0, 0.0);
        voice
    }

    /// Set linear attack and release times
    pub fn set_envelope(&mut self, attack_ms: f32, release_ms: f32) {
        let samples = |ms: f32| ms.max(0.0) * self.sample_rate / 1000.0;
        let attack = samples(attack_ms);
        let release = samples(release_ms);
        self.attack_step = if attack >= 1.0 { 1.0 / attack } else { 1.0 };
        self.release_step = if release >= 1.0 { 1.0 / release } else { 1.0 };
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == VoiceState::Idle
    }

    pub fn kind(&self) -> VoiceKind {
        self.kind
    }

    pub fn note(&self) -> Option<MidiNote> {
        self.note
    }

    pub fn velocity(&self) -> u8 {
        self.velocity
    }

    pub fn target_frequency(&self) -> f32 {
        self.target_hz
    }

    pub fn set_target_frequency(&mut self, hz: f32) {
        self.target_hz = hz;
    }

    /// Held level; changes ramp at the attack/release rate
    pub fn set_level(&mut self, level: f32) {
        self.level = level.clamp(0.0, 1.0);
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Held level the gain ramps towards
    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn pan(&self) -> &PanState {
        &self.pan
    }

    /// Whether the pan value was taken from the panning pool
    pub fn pan_from_pool(&self) -> bool {
        self.pan_from_pool
    }

    /// Move to `value`, crossfading over the next block
    pub fn set_pan(&mut self, value: u8, from_pool: bool) -> bool {
        self.pan_from_pool = from_pool;
        self.pan.set_pan(value)
    }

    /// Pan `mono` into interleaved stereo `output`
    pub fn mix_into(&mut self, mono: &[f32], output: &mut [f32]) {
        self.pan.mix_into(mono, output);
    }

    /// Sample clock of the last note-on, for stealing the oldest voice
    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn grain_capacity(&self) -> usize {
        self.grains.len()
    }

    pub fn active_grains(&self) -> usize {
        self.grains.iter().filter(|g| !g.is_idle()).count()
    }

    pub fn grains(&self) -> &[SynthesisGrain] {
        &self.grains
    }

    /// Grains skipped because the pool was exhausted
    pub fn dropped_grains(&self) -> u64 {
        self.dropped_grains
    }

    /// Most grains that were sounding at once
    pub fn peak_active_grains(&self) -> usize {
        self.peak_active_grains
    }

    /// Start (or retrigger) a note.
    ///
    /// An idle voice starts fresh at block index `start`, attacking from
    /// silence. A sounding voice keeps its grains and ramps to the new level.
    pub fn start(&mut self, trigger: NoteTrigger, start: usize, clock: u64) {
        if self.state == VoiceState::Idle {
            for grain in &mut self.grains {
                grain.stop();
            }
            self.next_synthesis_index = start as f64;
            self.gain = 0.0;
            self.dc_state = 0.0;
        }
        self.state = VoiceState::Active;
        self.kind = trigger.kind;
        self.note = Some(trigger.note);
        self.velocity = trigger.velocity;
        self.target_hz = trigger.target_hz;
        self.set_level(trigger.level);
        self.started_at = clock;
    }

    /// Place an idle voice at `value` without a crossfade
    pub fn assign_pan(&mut self, value: u8, from_pool: bool) {
        self.pan.reset(value);
        self.pan_from_pool = from_pool;
    }

    /// Begin ramping to silence
    pub fn release(&mut self) {
        if self.state == VoiceState::Active {
            self.state = VoiceState::Releasing;
        }
    }

    /// Silence immediately
    pub fn kill(&mut self) {
        for grain in &mut self.grains {
            grain.stop();
        }
        self.state = VoiceState::Idle;
        self.note = None;
        self.gain = 0.0;
        self.dc_state = 0.0;
    }

    pub fn reset_stats(&mut self) {
        self.dropped_grains = 0;
        self.peak_active_grains = 0;
    }

    /// Render into `out`, whose first sample is block index `start`.
    ///
    /// Overwrites `out`. A releasing voice that reaches silence goes idle and
    /// zero-fills the rest.
    pub fn render(&mut self, ctx: &SynthesisContext<'_>, out: &mut [f32], start: usize) {
        if self.state == VoiceState::Idle {
            out.fill(0.0);
            return;
        }

        let spacing = self.grain_spacing(ctx);
        let grain_len = spacing.map(|t| self.grain_length(ctx, t));

        for k in 0..out.len() {
            let index = start + k;
            match (spacing, grain_len) {
                (Some(spacing), Some(len)) => {
                    while self.next_synthesis_index <= index as f64 {
                        self.spawn_grain(ctx, index, len);
                        self.next_synthesis_index += spacing as f64;
                    }
                }
                _ => {
                    // Resume on schedule once grains are allowed again
                    self.next_synthesis_index = self.next_synthesis_index.max(index as f64);
                }
            }

            let mut sum = 0.0;
            let mut active = 0;
            for grain in &mut self.grains {
                if !grain.is_idle() {
                    active += 1;
                    sum += grain.next_sample();
                }
            }
            self.peak_active_grains = self.peak_active_grains.max(active);

            let y = sum - self.dc_state;
            self.dc_state = sum * (1.0 - self.dc_coeff) + self.dc_state * self.dc_coeff;

            self.advance_gain();
            out[k] = y * self.gain;

            if self.state == VoiceState::Releasing && self.gain <= SILENCE_GAIN {
                self.kill();
                out[k + 1..].fill(0.0);
                return;
            }
        }
    }

    /// Shift the schedule so index 0 is the start of the next block
    pub fn end_block(&mut self, block_len: usize) {
        if self.state != VoiceState::Idle {
            self.next_synthesis_index -= block_len as f64;
        }
    }

    /// Spacing of new grains, or `None` if none should be scheduled
    fn grain_spacing(&self, ctx: &SynthesisContext<'_>) -> Option<f32> {
        if ctx.grains.onsets().is_empty() {
            return None;
        }
        if ctx.voiced {
            if self.target_hz <= 0.0 {
                return None;
            }
            Some((self.sample_rate / self.target_hz).max(MIN_SPACING))
        } else {
            match ctx.unvoiced {
                UnvoicedBehavior::Passthrough => Some(ctx.source_period.max(MIN_SPACING)),
                UnvoicedBehavior::Mute => None,
            }
        }
    }

    /// Twice the shorter of source and target period, within the extracted grain
    fn grain_length(&self, ctx: &SynthesisContext<'_>, spacing: f32) -> usize {
        let len = (2.0 * ctx.source_period.min(spacing)).round() as usize;
        len.clamp(2, ctx.grains.grain_length().max(2))
            .min(self.max_grain_len)
    }

    fn spawn_grain(&mut self, ctx: &SynthesisContext<'_>, index: usize, len: usize) {
        let half = ctx.grains.half_grain();
        let desired = ctx.block_start + index;
        let Some(onset) = ctx.grains.nearest_onset((desired + len / 2).saturating_sub(half)) else {
            return;
        };

        // Centre the (possibly shorter) grain on the pitch mark
        let source_start = (onset + half).saturating_sub(len / 2);
        let source_end = source_start + len;
        if source_end > ctx.window.len() {
            return;
        }

        let Some(slot) = self.grains.iter().position(SynthesisGrain::is_idle) else {
            self.dropped_grains += 1;
            return;
        };
        let coefficients = self.window.get(len);
        self.grains[slot].start(
            &ctx.window[source_start..source_end],
            coefficients,
            source_start,
            index,
        );
    }

    #[inline]
    fn advance_gain(&mut self) {
        let target = if self.state == VoiceState::Releasing {
            0.0
        } else {
            self.level
        };
        if self.gain < target {
            self.gain = (self.gain + self.attack_step).min(target);
        } else if self.gain > target {
            self.gain = (self.gain - self.release_step).max(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f64 = 48000.0;
    const BLOCK: usize = 1200;

    fn sine_window(period: f32) -> Vec<f32> {
        (0..2 * BLOCK)
            .map(|i| (2.0 * PI * i as f32 / period).sin() * 0.5)
            .collect()
    }

    fn extractor(window: &[f32], period: f32) -> GrainExtractor {
        let mut grains = GrainExtractor::new(window.len(), 48);
        grains.extract(window, period);
        grains
    }

    fn context<'a>(
        window: &'a [f32],
        grains: &'a GrainExtractor,
        period: f32,
        voiced: bool,
        unvoiced: UnvoicedBehavior,
    ) -> SynthesisContext<'a> {
        SynthesisContext {
            window,
            grains,
            block_start: BLOCK,
            source_period: period,
            voiced,
            unvoiced,
        }
    }

    fn trigger(note: u8, target_hz: f32) -> NoteTrigger {
        NoteTrigger {
            note: MidiNote::new(note).unwrap(),
            kind: VoiceKind::Keyboard,
            velocity: 127,
            level: 1.0,
            target_hz,
        }
    }

    #[test]
    fn test_idle_voice_is_silent() {
        let window = sine_window(100.0);
        let grains = extractor(&window, 100.0);
        let ctx = context(&window, &grains, 100.0, true, UnvoicedBehavior::Passthrough);
        let mut voice = Voice::new(0, SR, 4, 1200);
        let mut out = vec![1.0; 256];
        voice.render(&ctx, &mut out, 0);
        assert!(out.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_grains_follow_target_spacing() {
        let window = sine_window(100.0);
        let grains = extractor(&window, 100.0);
        let ctx = context(&window, &grains, 100.0, true, UnvoicedBehavior::Passthrough);

        let mut voice = Voice::new(0, SR, 4, 1200);
        // 960 Hz -> 50 samples between grains
        voice.start(trigger(81, 960.0), 0, 0);
        let mut out = vec![0.0; BLOCK];
        voice.render(&ctx, &mut out, 0);

        let offsets: Vec<usize> = voice
            .grains()
            .iter()
            .filter(|g| !g.is_idle())
            .map(|g| g.write_offset())
            .collect();
        assert!(!offsets.is_empty());
        assert!(offsets.iter().all(|&o| o % 50 == 0));
        assert!(voice.grains().iter().all(|g| g.is_idle() || g.len() == 100));
        assert_eq!(voice.dropped_grains(), 0);
        assert!(voice.peak_active_grains() <= voice.grain_capacity());
        assert!(out.iter().any(|&x| x.abs() > 0.05));
    }

    #[test]
    fn test_exhausted_pool_drops_grains() {
        let window = sine_window(100.0);
        let grains = extractor(&window, 100.0);
        let ctx = context(&window, &grains, 100.0, true, UnvoicedBehavior::Passthrough);

        // A single buffer cannot hold two overlapping grains
        let mut voice = Voice::new(0, SR, 1, 1200);
        voice.start(trigger(69, 480.0), 0, 0);
        let mut out = vec![0.0; BLOCK];
        voice.render(&ctx, &mut out, 0);

        assert!(voice.dropped_grains() > 0);
        assert_eq!(voice.peak_active_grains(), 1);
        assert!(out.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_release_returns_to_idle() {
        let window = sine_window(100.0);
        let grains = extractor(&window, 100.0);
        let ctx = context(&window, &grains, 100.0, true, UnvoicedBehavior::Passthrough);

        let mut voice = Voice::new(0, SR, 4, 1200);
        voice.set_envelope(1.0, 10.0);
        voice.start(trigger(69, 480.0), 0, 0);
        let mut out = vec![0.0; BLOCK];
        voice.render(&ctx, &mut out, 0);
        voice.end_block(BLOCK);
        assert_eq!(voice.state(), VoiceState::Active);

        voice.release();
        assert_eq!(voice.state(), VoiceState::Releasing);
        voice.render(&ctx, &mut out, 0);
        // 10 ms at 48 kHz is 480 samples
        assert!(voice.is_idle());
        assert_eq!(voice.note(), None);
        assert_eq!(voice.active_grains(), 0);
        assert!(out[600..].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_mute_stops_scheduling_when_unvoiced() {
        let window = sine_window(100.0);
        let grains = extractor(&window, 100.0);
        let voiced = context(&window, &grains, 100.0, true, UnvoicedBehavior::Mute);
        let unvoiced = context(&window, &grains, 100.0, false, UnvoicedBehavior::Mute);

        let mut voice = Voice::new(0, SR, 4, 1200);
        voice.start(trigger(69, 480.0), 0, 0);
        let mut out = vec![0.0; BLOCK];
        voice.render(&voiced, &mut out, 0);
        voice.end_block(BLOCK);

        voice.render(&unvoiced, &mut out, 0);
        assert_eq!(voice.active_grains(), 0);
        assert_eq!(voice.state(), VoiceState::Active);
        // Grains started before the block finish, then only the DC blocker decays
        assert!(out[600..].iter().all(|&x| x.abs() < 0.01));
    }

    #[test]
    fn test_passthrough_keeps_source_period_when_unvoiced() {
        let window = sine_window(100.0);
        let grains = extractor(&window, 100.0);
        let ctx = context(&window, &grains, 100.0, false, UnvoicedBehavior::Passthrough);

        let mut voice = Voice::new(0, SR, 4, 1200);
        voice.start(trigger(90, 1500.0), 0, 0);
        let mut out = vec![0.0; BLOCK];
        voice.render(&ctx, &mut out, 0);

        assert!(voice
            .grains()
            .iter()
            .filter(|g| !g.is_idle())
            .all(|g| g.write_offset() % 100 == 0 && g.len() == 200));
    }
}
