//! Audio engine - re-blocks host audio through detection, extraction and the
//! harmonizer

use crate::config::{AutoVoiceConfig, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::harmonizer::{Harmonizer, RenderStats};
use crate::midi::{MidiEvent, MidiMessage, MidiNote};
use crate::pan::{pan_gains, PAN_CENTER};
use crate::ring_buffer::RingBuffer;
use crate::voice::SynthesisContext;
use atomic_float::AtomicF32;
use crossbeam_channel::{bounded, Receiver, Sender};
use imogen_analysis::{AnalysisError, GrainExtractor, PitchDetector, PitchEstimate, Stage};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Commands handled per internal block; the rest wait for the next one
const MAX_COMMANDS_PER_BLOCK: usize = 64;
/// Minimum room for queued MIDI events
const MIN_PENDING_EVENTS: usize = 512;
/// How often status is published, in seconds
const STATUS_INTERVAL_SECS: f64 = 0.1;

/// Commands sent to the audio engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AudioCommand {
    NoteOn { note: MidiNote, velocity: u8 },
    NoteOff { note: MidiNote },
    /// Any parsed MIDI message, applied at the next block boundary
    Midi(MidiMessage),
    AllNotesOff,
    SetPan { voice: usize, value: u8 },
    SetLatch(bool),
    SetIntervalLock(bool),
    SetPedalPitch(AutoVoiceConfig),
    SetDescant(AutoVoiceConfig),
    /// Silence and forget all history
    Reset,
    Shutdown,
}

/// Snapshot published by the audio thread
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineStatus {
    pub estimate: PitchEstimate,
    /// Detected input pitch, 0 when unvoiced
    pub input_hz: f32,
    pub latency_samples: usize,
    /// MIDI events discarded because the queue was full
    pub dropped_events: u64,
    /// Counters since the previous status
    pub stats: RenderStats,
}

/// Events sent from the audio engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AudioEvent {
    Status(EngineStatus),
}

/// Continuous parameters shared with the control thread.
///
/// Written from anywhere, read by the audio thread once per internal block.
#[derive(Debug)]
pub struct EngineParams {
    min_hz: AtomicF32,
    max_hz: AtomicF32,
    confidence_threshold: AtomicF32,
    dry_wet: AtomicF32,
    stereo_width: AtomicU8,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl EngineParams {
    pub fn new(config: &EngineConfig) -> Self {
        let params = Self {
            min_hz: AtomicF32::new(0.0),
            max_hz: AtomicF32::new(0.0),
            confidence_threshold: AtomicF32::new(0.0),
            dry_wet: AtomicF32::new(0.0),
            stereo_width: AtomicU8::new(0),
        };
        params.load_config(config);
        params
    }

    /// Overwrite every value from `config`
    pub fn load_config(&self, config: &EngineConfig) {
        self.min_hz.store(config.min_hz, Ordering::Relaxed);
        self.max_hz.store(config.max_hz, Ordering::Relaxed);
        self.confidence_threshold
            .store(config.confidence_threshold, Ordering::Relaxed);
        self.dry_wet.store(config.dry_wet, Ordering::Relaxed);
        self.stereo_width
            .store(config.stereo_width.min(100), Ordering::Relaxed);
    }

    pub fn pitch_range(&self) -> (f32, f32) {
        (
            self.min_hz.load(Ordering::Relaxed),
            self.max_hz.load(Ordering::Relaxed),
        )
    }

    /// Set the detector search range.
    ///
    /// The engine narrows this to the range it was prepared with.
    pub fn set_pitch_range(&self, min_hz: f32, max_hz: f32) -> EngineResult<()> {
        if !(min_hz.is_finite() && max_hz.is_finite() && min_hz > 0.0 && min_hz < max_hz) {
            return Err(AnalysisError::InvalidPitchRange {
                min: min_hz,
                max: max_hz,
            }
            .into());
        }
        self.min_hz.store(min_hz, Ordering::Relaxed);
        self.max_hz.store(max_hz, Ordering::Relaxed);
        Ok(())
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold.load(Ordering::Relaxed)
    }

    pub fn set_confidence_threshold(&self, threshold: f32) -> EngineResult<()> {
        if !(0.0..=2.0).contains(&threshold) {
            return Err(AnalysisError::InvalidThreshold(threshold).into());
        }
        self.confidence_threshold.store(threshold, Ordering::Relaxed);
        Ok(())
    }

    pub fn dry_wet(&self) -> f32 {
        self.dry_wet.load(Ordering::Relaxed)
    }

    /// 0 = input only, 1 = harmony only (clamped)
    pub fn set_dry_wet(&self, mix: f32) {
        let mix = if mix.is_finite() { mix.clamp(0.0, 1.0) } else { 1.0 };
        self.dry_wet.store(mix, Ordering::Relaxed);
    }

    pub fn stereo_width(&self) -> u8 {
        self.stereo_width.load(Ordering::Relaxed)
    }

    /// Width in percent, clamped to 100
    pub fn set_stereo_width(&self, percent: u8) {
        self.stereo_width.store(percent.min(100), Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct TimedEvent {
    /// Absolute input sample index
    time: u64,
    message: MidiMessage,
}

/// Everything allocated by `prepare`
struct Pipeline {
    config: EngineConfig,
    /// Internal block length, also the added latency
    block_size: usize,
    history: RingBuffer,
    /// Last two blocks of input; the current block is the second half
    window: Vec<f32>,
    detector: PitchDetector,
    grains: GrainExtractor,
    harmonizer: Harmonizer,
    input_block: Vec<f32>,
    /// Interleaved stereo output for the block being played back
    output_block: Vec<f32>,
    /// Samples accumulated in `input_block`
    fill: usize,
    /// Input sample index of `input_block[0]`
    block_clock: u64,
    pending: Vec<TimedEvent>,
    estimate: PitchEstimate,
    pitch_range: (f32, f32),
    threshold: f32,
    dry_wet: f32,
    dropped_events: u64,
    status_interval: usize,
    blocks_since_status: usize,
}

impl Pipeline {
    fn new(config: &EngineConfig) -> EngineResult<Self> {
        let sample_rate = config.sample_rate;
        let mut detector = PitchDetector::new(sample_rate, config.min_hz, config.max_hz)?;
        detector.set_confidence_threshold(config.confidence_threshold)?;

        let block_size = detector.frame_size();
        let window_len = 2 * block_size;
        detector.prepare(sample_rate, block_size)?;

        let mut grains = GrainExtractor::new(window_len, detector.min_period());
        grains.set_strategy(config.grain_strategy);
        grains
            .prepare(sample_rate, window_len)
            .unwrap_or_else(|never| match never {});

        let harmonizer = Harmonizer::new(config, block_size + 2, block_size);
        let cycles = (STATUS_INTERVAL_SECS * sample_rate / block_size as f64).round() as usize;

        tracing::debug!(
            detector = detector.name(),
            extractor = grains.name(),
            min_period = detector.min_period(),
            max_period = detector.max_period(),
            "analysis stages ready"
        );

        Ok(Self {
            config: config.clone(),
            block_size,
            history: RingBuffer::new(window_len),
            window: vec![0.0; window_len],
            estimate: PitchEstimate {
                period: detector.max_period() as f32,
                confidence: 0.0,
                voiced: false,
            },
            detector,
            grains,
            harmonizer,
            input_block: vec![0.0; block_size],
            output_block: vec![0.0; 2 * block_size],
            fill: 0,
            block_clock: 0,
            pending: Vec::with_capacity(MIN_PENDING_EVENTS.max(config.max_block_size)),
            pitch_range: (config.min_hz, config.max_hz),
            threshold: config.confidence_threshold,
            dry_wet: config.dry_wet,
            dropped_events: 0,
            status_interval: cycles.max(1),
            blocks_since_status: 0,
        })
    }

    /// Queue host-block MIDI in time order, keeping arrival order for ties
    fn queue_midi(&mut self, midi: &[MidiEvent], frames: usize) {
        let host_clock = self.block_clock + self.fill as u64;
        let last = frames.saturating_sub(1);
        for event in midi {
            if self.pending.len() == self.pending.capacity() {
                self.dropped_events += 1;
                continue;
            }
            let time = host_clock + event.offset.min(last) as u64;
            let index = self.pending.partition_point(|e| e.time <= time);
            self.pending.insert(
                index,
                TimedEvent {
                    time,
                    message: event.message,
                },
            );
        }
    }

    fn apply_params(&mut self, params: &EngineParams) {
        let range = params.pitch_range();
        if range != self.pitch_range {
            self.pitch_range = range;
            // Stay within the lag range the buffers were sized for
            let min_hz = range.0.max(self.config.min_hz);
            let max_hz = range.1.min(self.config.max_hz);
            if min_hz < max_hz {
                let _ = self.detector.set_pitch_range(min_hz, max_hz);
            }
        }

        let threshold = params.confidence_threshold();
        if threshold != self.threshold {
            self.threshold = threshold;
            let _ = self.detector.set_confidence_threshold(threshold);
        }

        self.harmonizer.set_stereo_width(params.stereo_width());
        self.dry_wet = params.dry_wet();
    }

    fn apply_command(&mut self, command: AudioCommand) {
        let h = &mut self.harmonizer;
        match command {
            AudioCommand::NoteOn { note, velocity } => h.note_on(note, velocity, 0),
            AudioCommand::NoteOff { note } => h.note_off(note, 0),
            AudioCommand::Midi(message) => h.handle_midi(message, 0),
            AudioCommand::AllNotesOff => h.all_notes_off(),
            AudioCommand::SetPan { voice, value } => {
                h.set_voice_pan(voice, value);
            }
            AudioCommand::SetLatch(on) => h.set_latch(on, 0),
            AudioCommand::SetIntervalLock(on) => h.set_interval_lock(on),
            AudioCommand::SetPedalPitch(config) => h.set_pedal_pitch(config),
            AudioCommand::SetDescant(config) => h.set_descant(config),
            AudioCommand::Reset => self.reset(),
            AudioCommand::Shutdown => h.all_notes_off(),
        }
    }

    /// Process the completed input block into `output_block`
    fn render_block(
        &mut self,
        params: &EngineParams,
        commands: Option<&Receiver<AudioCommand>>,
        events: Option<&Sender<AudioEvent>>,
    ) {
        let block = self.block_size;
        self.apply_params(params);
        self.harmonizer.set_clock(self.block_clock);
        if let Some(rx) = commands {
            for command in rx.try_iter().take(MAX_COMMANDS_PER_BLOCK) {
                self.apply_command(command);
            }
        }

        self.history.write(&self.input_block);
        self.history.copy_latest_padded(&mut self.window);
        self.estimate = self.detector.detect(&self.window[block..]);
        self.grains.extract(&self.window, self.estimate.period);
        if self.estimate.voiced {
            let hz = self.estimate.frequency(self.config.sample_rate);
            self.harmonizer.set_input_pitch(Some(hz));
        }

        // Split the block at each due MIDI event
        self.output_block.fill(0.0);
        let block_end = self.block_clock + block as u64;
        let due = self.pending.partition_point(|e| e.time < block_end);
        let mut start = 0;
        for i in 0..due {
            let event = self.pending[i];
            let offset = (event.time.saturating_sub(self.block_clock) as usize).min(block);
            if offset > start {
                self.render_segment(start, offset);
                start = offset;
            }
            self.harmonizer.handle_midi(event.message, offset);
        }
        self.pending.drain(..due);
        if start < block {
            self.render_segment(start, block);
        }
        self.harmonizer.end_block(block);

        self.mix_dry();
        self.block_clock = block_end;
        self.publish_status(events);
    }

    fn render_segment(&mut self, start: usize, end: usize) {
        let ctx = SynthesisContext {
            window: &self.window,
            grains: &self.grains,
            block_start: self.block_size,
            source_period: self.estimate.period,
            voiced: self.estimate.voiced,
            unvoiced: self.harmonizer.unvoiced_behavior(),
        };
        self.harmonizer
            .render(&ctx, &mut self.output_block[2 * start..2 * end], start);
    }

    /// Blend the centred input under the harmony
    fn mix_dry(&mut self) {
        let wet = self.dry_wet;
        let dry = 1.0 - wet;
        let (left, right) = pan_gains(PAN_CENTER);
        for (frame, &x) in self.output_block.chunks_exact_mut(2).zip(&self.input_block) {
            frame[0] = frame[0] * wet + x * dry * left;
            frame[1] = frame[1] * wet + x * dry * right;
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            estimate: self.estimate,
            input_hz: if self.estimate.voiced {
                self.estimate.frequency(self.config.sample_rate)
            } else {
                0.0
            },
            latency_samples: self.block_size,
            dropped_events: self.dropped_events,
            stats: self.harmonizer.stats(),
        }
    }

    fn publish_status(&mut self, events: Option<&Sender<AudioEvent>>) {
        let Some(tx) = events else {
            return;
        };
        self.blocks_since_status += 1;
        if self.blocks_since_status < self.status_interval {
            return;
        }
        self.blocks_since_status = 0;
        if tx.try_send(AudioEvent::Status(self.status())).is_ok() {
            self.harmonizer.reset_stats();
            self.dropped_events = 0;
        }
    }

    fn reset(&mut self) {
        self.harmonizer.reset();
        self.history.clear();
        self.window.fill(0.0);
        self.pending.clear();
        self.detector.release();
        self.grains.release();
    }
}

/// The harmonizer as seen by the audio callback
pub struct HarmonizerEngine {
    params: Arc<EngineParams>,
    command_rx: Option<Receiver<AudioCommand>>,
    event_tx: Option<Sender<AudioEvent>>,
    pipeline: Option<Pipeline>,
}

impl Default for HarmonizerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HarmonizerEngine {
    /// Create an unprepared engine driven only through direct calls
    pub fn new() -> Self {
        Self {
            params: Arc::new(EngineParams::default()),
            command_rx: None,
            event_tx: None,
            pipeline: None,
        }
    }

    /// Create an unprepared engine fed by a control thread
    pub fn with_channels(command_rx: Receiver<AudioCommand>, event_tx: Sender<AudioEvent>) -> Self {
        Self {
            command_rx: Some(command_rx),
            event_tx: Some(event_tx),
            ..Self::new()
        }
    }

    /// Parameters to share with an [`EngineHandle`]
    pub fn params(&self) -> Arc<EngineParams> {
        Arc::clone(&self.params)
    }

    /// Allocate everything for `config`. Call again whenever the sample rate
    /// or maximum block size changes.
    pub fn prepare(&mut self, config: &EngineConfig) -> EngineResult<()> {
        if let Err(e) = config.validate() {
            tracing::warn!("Rejected engine config: {}", e);
            return Err(e);
        }
        let pipeline = match Pipeline::new(config) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                tracing::warn!("Failed to prepare engine: {}", e);
                return Err(e);
            }
        };
        self.params.load_config(config);

        tracing::info!(
            sample_rate = config.sample_rate,
            voices = config.num_voices,
            grains_per_voice = config.grains_per_voice,
            latency = pipeline.block_size,
            "Harmonizer engine prepared"
        );
        self.pipeline = Some(pipeline);
        Ok(())
    }

    /// Free everything allocated by `prepare`
    pub fn release(&mut self) {
        if self.pipeline.take().is_some() {
            tracing::info!("Harmonizer engine released");
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Delay between input and output, in samples
    pub fn latency_samples(&self) -> usize {
        self.pipeline.as_ref().map_or(0, |p| p.block_size)
    }

    /// Process one host block.
    ///
    /// `output` is interleaved stereo and should hold two samples per input
    /// sample; extra output is zeroed. MIDI offsets are relative to the start
    /// of this block. `fade_in` / `fade_out` ramp the whole block linearly.
    /// Never allocates, blocks or fails once prepared; unprepared, it outputs
    /// silence.
    pub fn process(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        midi: &[MidiEvent],
        fade_in: bool,
        fade_out: bool,
    ) {
        let Self {
            params,
            command_rx,
            event_tx,
            pipeline,
        } = self;
        let Some(p) = pipeline.as_mut() else {
            output.fill(0.0);
            return;
        };

        let frames = input.len().min(output.len() / 2);
        p.queue_midi(midi, frames);

        let mut done = 0;
        while done < frames {
            let n = (p.block_size - p.fill).min(frames - done);
            let fill = p.fill;
            p.input_block[fill..fill + n].copy_from_slice(&input[done..done + n]);
            output[2 * done..2 * (done + n)]
                .copy_from_slice(&p.output_block[2 * fill..2 * (fill + n)]);
            p.fill += n;
            done += n;

            if p.fill == p.block_size {
                p.render_block(params, command_rx.as_ref(), event_tx.as_ref());
                p.fill = 0;
            }
        }
        output[2 * frames..].fill(0.0);

        if (fade_in || fade_out) && frames > 0 {
            let step = 1.0 / frames as f32;
            for (i, frame) in output[..2 * frames].chunks_exact_mut(2).enumerate() {
                let mut gain = 1.0;
                if fade_in {
                    gain *= i as f32 * step;
                }
                if fade_out {
                    gain *= 1.0 - (i + 1) as f32 * step;
                }
                frame[0] *= gain;
                frame[1] *= gain;
            }
        }
    }

    pub fn set_pitch_range(&self, min_hz: f32, max_hz: f32) -> EngineResult<()> {
        self.params.set_pitch_range(min_hz, max_hz)
    }

    pub fn set_confidence_threshold(&self, threshold: f32) -> EngineResult<()> {
        self.params.set_confidence_threshold(threshold)
    }

    pub fn set_stereo_width(&self, percent: u8) {
        self.params.set_stereo_width(percent);
    }

    pub fn set_dry_wet(&self, mix: f32) {
        self.params.set_dry_wet(mix);
    }

    /// Pin a voice's pan (0-127). Returns `false` if unprepared, the voice
    /// does not exist or the value is unchanged.
    pub fn set_pan(&mut self, voice: usize, value: u8) -> bool {
        self.pipeline
            .as_mut()
            .is_some_and(|p| p.harmonizer.set_voice_pan(voice, value))
    }

    /// Search range currently used by the detector
    pub fn pitch_range(&self) -> Option<(f32, f32)> {
        self.pipeline.as_ref().map(|p| p.detector.pitch_range())
    }

    pub fn status(&self) -> Option<EngineStatus> {
        self.pipeline.as_ref().map(Pipeline::status)
    }

    pub fn harmonizer(&self) -> Option<&Harmonizer> {
        self.pipeline.as_ref().map(|p| &p.harmonizer)
    }
}

/// Re-prepare for a new host rate or block size, keeping every other setting
/// from the last `prepare` (defaults if never prepared)
impl Stage for HarmonizerEngine {
    type Error = EngineError;

    fn prepare(&mut self, sample_rate: f64, max_block_size: usize) -> EngineResult<()> {
        let mut config = self
            .pipeline
            .as_ref()
            .map(|p| p.config.clone())
            .unwrap_or_default();
        config.sample_rate = sample_rate;
        config.max_block_size = max_block_size;
        HarmonizerEngine::prepare(self, &config)
    }

    fn release(&mut self) {
        HarmonizerEngine::release(self);
    }

    fn name(&self) -> &'static str {
        "HarmonizerEngine"
    }
}

/// Handle to communicate with the audio engine
pub struct EngineHandle {
    /// Send commands to audio thread
    pub command_tx: Sender<AudioCommand>,
    /// Receive events from audio thread
    pub event_rx: Receiver<AudioEvent>,
    params: Arc<EngineParams>,
    /// Shutdown flag
    shutdown: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Create channels for engine communication
    pub fn create_channels() -> (
        Sender<AudioCommand>,
        Receiver<AudioCommand>,
        Sender<AudioEvent>,
        Receiver<AudioEvent>,
    ) {
        let (cmd_tx, cmd_rx) = bounded(1024);
        let (evt_tx, evt_rx) = bounded(256);
        (cmd_tx, cmd_rx, evt_tx, evt_rx)
    }

    pub fn new(
        command_tx: Sender<AudioCommand>,
        event_rx: Receiver<AudioEvent>,
        params: Arc<EngineParams>,
    ) -> Self {
        Self {
            command_tx,
            event_rx,
            params,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    /// Send a command; returns `false` if the queue is full
    pub fn send(&self, cmd: AudioCommand) -> bool {
        self.command_tx.try_send(cmd).is_ok()
    }

    pub fn note_on(&self, note: MidiNote, velocity: u8) -> bool {
        self.send(AudioCommand::NoteOn { note, velocity })
    }

    pub fn note_off(&self, note: MidiNote) -> bool {
        self.send(AudioCommand::NoteOff { note })
    }

    pub fn set_pitch_range(&self, min_hz: f32, max_hz: f32) -> EngineResult<()> {
        self.params.set_pitch_range(min_hz, max_hz)
    }

    pub fn set_confidence_threshold(&self, threshold: f32) -> EngineResult<()> {
        self.params.set_confidence_threshold(threshold)
    }

    pub fn set_stereo_width(&self, percent: u8) {
        self.params.set_stereo_width(percent);
    }

    pub fn set_dry_wet(&self, mix: f32) {
        self.params.set_dry_wet(mix);
    }

    pub fn set_pan(&self, voice: usize, value: u8) -> EngineResult<()> {
        if value > 127 {
            return Err(EngineError::InvalidParameter {
                name: "pan",
                value: value as f32,
            });
        }
        if self.send(AudioCommand::SetPan { voice, value }) {
            Ok(())
        } else {
            Err(EngineError::QueueFull)
        }
    }

    /// Drain pending events without blocking
    pub fn poll_events(&self) -> impl Iterator<Item = AudioEvent> + '_ {
        self.event_rx.try_iter()
    }

    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Request shutdown
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.command_tx.try_send(AudioCommand::Shutdown);
    }
}
