//! Configuration persistence for the Imogen host
//!
//! Engine settings and device choices live in a key=value file under the
//! user's config directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use imogen_analysis::GrainStrategy;
use imogen_audio::{EngineConfig, UnvoicedBehavior};

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Input device name, default device when unset
    pub input_device: Option<String>,
    /// Output device name, default device when unset
    pub output_device: Option<String>,
    /// Engine settings; the sample rate is taken from the device
    pub engine: EngineConfig,
}

impl Config {
    /// Load config from the default location
    ///
    /// Returns default config if the file doesn't exist or can't be read.
    pub fn load() -> Self {
        let path = Self::config_path();
        Self::load_from(&path).unwrap_or_default()
    }

    /// Load config from a specific path
    pub fn load_from(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("imogen")
            .join("config.txt")
    }

    /// Parse config from simple key=value format
    ///
    /// Unknown keys are ignored. Values that don't parse keep their default.
    fn parse(content: &str) -> Self {
        let mut config = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            config.apply(key.trim(), value.trim());
        }

        config
    }

    fn apply(&mut self, key: &str, value: &str) {
        let engine = &mut self.engine;
        match key {
            "input_device" => self.input_device = non_empty(value),
            "output_device" => self.output_device = non_empty(value),
            "max_block_size" => set(&mut engine.max_block_size, key, value),
            "voices" => set(&mut engine.num_voices, key, value),
            "grains_per_voice" => set(&mut engine.grains_per_voice, key, value),
            "min_hz" => set(&mut engine.min_hz, key, value),
            "max_hz" => set(&mut engine.max_hz, key, value),
            "confidence_threshold" => set(&mut engine.confidence_threshold, key, value),
            "grain_strategy" => match value {
                "peak" => engine.grain_strategy = GrainStrategy::PeakPicking,
                "zero_crossing" => engine.grain_strategy = GrainStrategy::ZeroCrossing,
                _ => invalid(key, value),
            },
            "stereo_width" => set(&mut engine.stereo_width, key, value),
            "lowest_panned_note" => set(&mut engine.lowest_panned_note, key, value),
            "concert_pitch" => set(&mut engine.concert_pitch, key, value),
            "bend_up" => set(&mut engine.bend_up, key, value),
            "bend_down" => set(&mut engine.bend_down, key, value),
            "velocity_sensitivity" => set(&mut engine.velocity_sensitivity, key, value),
            "attack_ms" => set(&mut engine.attack_ms, key, value),
            "release_ms" => set(&mut engine.release_ms, key, value),
            "dry_wet" => set(&mut engine.dry_wet, key, value),
            "unvoiced" => match value {
                "passthrough" => engine.unvoiced = UnvoicedBehavior::Passthrough,
                "mute" => engine.unvoiced = UnvoicedBehavior::Mute,
                _ => invalid(key, value),
            },
            "voice_stealing" => set(&mut engine.voice_stealing, key, value),
            "pedal_enabled" => set(&mut engine.pedal_pitch.enabled, key, value),
            "pedal_threshold" => set(&mut engine.pedal_pitch.threshold, key, value),
            "pedal_interval" => set(&mut engine.pedal_pitch.interval, key, value),
            "descant_enabled" => set(&mut engine.descant.enabled, key, value),
            "descant_threshold" => set(&mut engine.descant.threshold, key, value),
            "descant_interval" => set(&mut engine.descant.interval, key, value),
            _ => {} // Ignore unknown keys
        }
    }

    /// Serialize config to simple key=value format
    fn serialize(&self) -> String {
        let e = &self.engine;
        let mut lines = vec!["# Imogen Configuration".to_string()];

        if let Some(ref name) = self.input_device {
            lines.push(format!("input_device={name}"));
        }
        if let Some(ref name) = self.output_device {
            lines.push(format!("output_device={name}"));
        }

        let strategy = match e.grain_strategy {
            GrainStrategy::PeakPicking => "peak",
            GrainStrategy::ZeroCrossing => "zero_crossing",
        };
        let unvoiced = match e.unvoiced {
            UnvoicedBehavior::Passthrough => "passthrough",
            UnvoicedBehavior::Mute => "mute",
        };

        lines.push(format!("max_block_size={}", e.max_block_size));
        lines.push(format!("voices={}", e.num_voices));
        lines.push(format!("grains_per_voice={}", e.grains_per_voice));
        lines.push(format!("min_hz={}", e.min_hz));
        lines.push(format!("max_hz={}", e.max_hz));
        lines.push(format!("confidence_threshold={}", e.confidence_threshold));
        lines.push(format!("grain_strategy={strategy}"));
        lines.push(format!("stereo_width={}", e.stereo_width));
        lines.push(format!("lowest_panned_note={}", e.lowest_panned_note));
        lines.push(format!("concert_pitch={}", e.concert_pitch));
        lines.push(format!("bend_up={}", e.bend_up));
        lines.push(format!("bend_down={}", e.bend_down));
        lines.push(format!("velocity_sensitivity={}", e.velocity_sensitivity));
        lines.push(format!("attack_ms={}", e.attack_ms));
        lines.push(format!("release_ms={}", e.release_ms));
        lines.push(format!("dry_wet={}", e.dry_wet));
        lines.push(format!("unvoiced={unvoiced}"));
        lines.push(format!("voice_stealing={}", e.voice_stealing));
        lines.push(format!("pedal_enabled={}", e.pedal_pitch.enabled));
        lines.push(format!("pedal_threshold={}", e.pedal_pitch.threshold));
        lines.push(format!("pedal_interval={}", e.pedal_pitch.interval));
        lines.push(format!("descant_enabled={}", e.descant.enabled));
        lines.push(format!("descant_threshold={}", e.descant.threshold));
        lines.push(format!("descant_interval={}", e.descant.interval));

        lines.join("\n")
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn set<T: FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => invalid(key, value),
    }
}

fn invalid(key: &str, value: &str) {
    tracing::warn!(key, value, "ignoring invalid config value");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let config = Config::parse("");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_engine_values() {
        let content = "voices=4\nmin_hz = 100\nstereo_width=50\nunvoiced=mute\n\
                       grain_strategy=zero_crossing\npedal_enabled=true\npedal_threshold=60";
        let config = Config::parse(content);
        assert_eq!(config.engine.num_voices, 4);
        assert_eq!(config.engine.min_hz, 100.0);
        assert_eq!(config.engine.stereo_width, 50);
        assert_eq!(config.engine.unvoiced, UnvoicedBehavior::Mute);
        assert_eq!(config.engine.grain_strategy, GrainStrategy::ZeroCrossing);
        assert!(config.engine.pedal_pitch.enabled);
        assert_eq!(config.engine.pedal_pitch.threshold, 60);
    }

    #[test]
    fn test_parse_with_comments_and_devices() {
        let content = "# Comment\ninput_device=USB Mic\noutput_device=\n# Another comment";
        let config = Config::parse(content);
        assert_eq!(config.input_device.as_deref(), Some("USB Mic"));
        assert!(config.output_device.is_none());
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = Config::parse("voices=many\ndry_wet=\nunvoiced=whisper\nnot_a_key=1");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut config = Config {
            input_device: Some("Built-in".to_string()),
            ..Default::default()
        };
        config.engine.num_voices = 6;
        config.engine.release_ms = 120.5;
        config.engine.descant.enabled = true;
        config.engine.unvoiced = UnvoicedBehavior::Mute;

        let parsed = Config::parse(&config.serialize());
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_save_and_load_file() {
        let path = std::env::temp_dir()
            .join(format!("imogen-config-test-{}", std::process::id()))
            .join("config.txt");
        let mut config = Config::default();
        config.engine.stereo_width = 30;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(Config::load_from(&path.with_file_name("missing.txt")).is_err());

        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }
}
