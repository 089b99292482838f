//! Engine configuration applied at prepare time

use crate::error::{EngineError, EngineResult};
use crate::midi::DEFAULT_CONCERT_PITCH;
use crate::panning::DEFAULT_STEREO_WIDTH;
use crate::voice::DEFAULT_GRAINS_PER_VOICE;
use imogen_analysis::{
    GrainStrategy, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MAX_HZ, DEFAULT_MIN_HZ,
};

/// Most voices a harmonizer can be prepared with
pub const MAX_VOICES: usize = 32;
/// Most grains a single voice may overlap
pub const MAX_GRAINS_PER_VOICE: usize = 16;

/// What the voices do while the input has no detectable pitch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnvoicedBehavior {
    /// Keep resynthesizing at the source period so consonants pass through
    #[default]
    Passthrough,
    /// Stop scheduling grains until the input is voiced again
    Mute,
}

/// An automatically doubled voice below or above the held chord
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoVoiceConfig {
    pub enabled: bool,
    /// Note the held chord must reach below (pedal) or above (descant)
    pub threshold: u8,
    /// Distance from the chord edge, in semitones
    pub interval: u8,
}

impl AutoVoiceConfig {
    pub const fn disabled(threshold: u8, interval: u8) -> Self {
        Self {
            enabled: false,
            threshold,
            interval,
        }
    }
}

/// Everything `prepare` needs to size and configure the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub sample_rate: f64,
    /// Largest host block `process` will see
    pub max_block_size: usize,
    pub num_voices: usize,
    pub grains_per_voice: usize,
    pub min_hz: f32,
    pub max_hz: f32,
    pub confidence_threshold: f32,
    pub grain_strategy: GrainStrategy,
    /// Spread of voice pan values, 0-100 %
    pub stereo_width: u8,
    /// Notes below this are always centred
    pub lowest_panned_note: u8,
    pub concert_pitch: f32,
    /// Pitch wheel range in semitones
    pub bend_up: f32,
    pub bend_down: f32,
    /// 0 = every note at full level, 1 = level follows velocity
    pub velocity_sensitivity: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    /// 0 = input only, 1 = harmony only
    pub dry_wet: f32,
    pub unvoiced: UnvoicedBehavior,
    pub voice_stealing: bool,
    pub pedal_pitch: AutoVoiceConfig,
    pub descant: AutoVoiceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            max_block_size: 512,
            num_voices: 12,
            grains_per_voice: DEFAULT_GRAINS_PER_VOICE,
            min_hz: DEFAULT_MIN_HZ,
            max_hz: DEFAULT_MAX_HZ,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            grain_strategy: GrainStrategy::PeakPicking,
            stereo_width: DEFAULT_STEREO_WIDTH,
            lowest_panned_note: 0,
            concert_pitch: DEFAULT_CONCERT_PITCH,
            bend_up: 2.0,
            bend_down: 2.0,
            velocity_sensitivity: 1.0,
            attack_ms: 15.0,
            release_ms: 80.0,
            dry_wet: 1.0,
            unvoiced: UnvoicedBehavior::Passthrough,
            voice_stealing: true,
            pedal_pitch: AutoVoiceConfig::disabled(0, 12),
            descant: AutoVoiceConfig::disabled(127, 12),
        }
    }
}

impl EngineConfig {
    /// Check every field, reporting the first problem found
    pub fn validate(&self) -> EngineResult<()> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(EngineError::InvalidSampleRate(self.sample_rate));
        }
        if self.max_block_size == 0 {
            return Err(EngineError::InvalidBlockSize(self.max_block_size));
        }
        if !(1..=MAX_VOICES).contains(&self.num_voices) {
            return Err(EngineError::InvalidVoiceCount {
                count: self.num_voices,
                max: MAX_VOICES,
            });
        }
        if !(2..=MAX_GRAINS_PER_VOICE).contains(&self.grains_per_voice) {
            return Err(EngineError::InvalidGrainCount {
                count: self.grains_per_voice,
                max: MAX_GRAINS_PER_VOICE,
            });
        }

        check_range("confidence_threshold", self.confidence_threshold, 0.0, 2.0)?;
        check_range("concert_pitch", self.concert_pitch, 200.0, 1000.0)?;
        check_range("bend_up", self.bend_up, 0.0, 24.0)?;
        check_range("bend_down", self.bend_down, 0.0, 24.0)?;
        check_range("velocity_sensitivity", self.velocity_sensitivity, 0.0, 1.0)?;
        check_range("attack_ms", self.attack_ms, 0.0, 5000.0)?;
        check_range("release_ms", self.release_ms, 0.0, 5000.0)?;
        check_range("dry_wet", self.dry_wet, 0.0, 1.0)?;
        if self.stereo_width > 100 {
            return Err(EngineError::InvalidParameter {
                name: "stereo_width",
                value: self.stereo_width as f32,
            });
        }
        if self.lowest_panned_note > 127 {
            return Err(EngineError::InvalidParameter {
                name: "lowest_panned_note",
                value: self.lowest_panned_note as f32,
            });
        }
        Ok(())
    }
}

fn check_range(name: &'static str, value: f32, min: f32, max: f32) -> EngineResult<()> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(EngineError::InvalidParameter { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let config = EngineConfig {
            sample_rate: 0.0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(EngineError::InvalidSampleRate(0.0)));

        let config = EngineConfig {
            max_block_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(EngineError::InvalidBlockSize(0)));

        let config = EngineConfig {
            num_voices: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidVoiceCount { count: 0, .. })
        ));

        let config = EngineConfig {
            grains_per_voice: 1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidGrainCount { count: 1, .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_range_parameters() {
        let config = EngineConfig {
            dry_wet: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidParameter { name: "dry_wet", .. })
        ));

        let config = EngineConfig {
            stereo_width: 101,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            attack_ms: f32::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
