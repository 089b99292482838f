//! Harmonizer engine for Imogen
//!
//! Provides the synthesis half of the PSOLA pipeline:
//! - RingBuffer: rolling input history for analysis
//! - Voice: grain overlap-add at a target pitch
//! - Harmonizer: MIDI voice allocation, panning and mixing
//! - Engine: host-block re-blocking, control channels and shared parameters

mod config;
mod engine;
mod error;
mod harmonizer;
pub mod midi;
mod pan;
mod panning;
mod ring_buffer;
mod voice;

pub use config::{AutoVoiceConfig, EngineConfig, UnvoicedBehavior, MAX_GRAINS_PER_VOICE, MAX_VOICES};
pub use engine::{
    AudioCommand, AudioEvent, EngineHandle, EngineParams, EngineStatus, HarmonizerEngine,
};
pub use error::{EngineError, EngineResult, NoteError, RingBufferError};
pub use harmonizer::{Harmonizer, RenderStats};
pub use midi::{MidiEvent, MidiMessage, MidiNote, NoteTable};
pub use pan::{pan_gains, PanState, PAN_CENTER, PAN_MAX};
pub use panning::{PanningManager, DEFAULT_STEREO_WIDTH};
pub use ring_buffer::RingBuffer;
pub use voice::{
    GrainState, NoteTrigger, SynthesisContext, SynthesisGrain, Voice, VoiceKind, VoiceState,
    DEFAULT_GRAINS_PER_VOICE,
};
