//! Line-based control console
//!
//! Reads commands from stdin and forwards them to the engine handle.

use anyhow::{bail, Context};

use imogen_audio::{AudioCommand, EngineHandle, MidiMessage, MidiNote};

pub const HELP: &str = "\
commands:
  on <note> [velocity]    start a harmony note (MIDI number)
  off <note>              release a harmony note
  panic                   release every note
  cc <controller> <value> send a control change (64 = sustain)
  bend <value>            pitch wheel, 0-16383
  width <percent>         stereo width, 0-100
  range <min> <max>       pitch detection range in Hz
  threshold <value>       pitch confidence threshold
  drywet <value>          0 = input only, 1 = harmony only
  pan <voice> <value>     pin a voice's pan, 0-127
  latch on|off            hold notes after release
  lock on|off             freeze the chord as intervals from the input
  reset                   silence and clear all voices
  quit                    exit";

/// A parsed console line
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    NoteOn { note: MidiNote, velocity: u8 },
    NoteOff(MidiNote),
    Panic,
    ControlChange { controller: u8, value: u8 },
    PitchBend(u16),
    Width(u8),
    Range(f32, f32),
    Threshold(f32),
    DryWet(f32),
    Pan { voice: usize, value: u8 },
    Latch(bool),
    Lock(bool),
    Reset,
    Help,
    Quit,
}

impl Command {
    /// Parse one console line
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            bail!("empty command");
        };
        let args: Vec<&str> = words.collect();

        let command = match (name, args.as_slice()) {
            ("on", [note]) => Command::NoteOn {
                note: note_arg(note)?,
                velocity: 100,
            },
            ("on", [note, velocity]) => Command::NoteOn {
                note: note_arg(note)?,
                velocity: bounded(velocity, "velocity", 127)?,
            },
            ("off", [note]) => Command::NoteOff(note_arg(note)?),
            ("panic", []) => Command::Panic,
            ("cc", [controller, value]) => Command::ControlChange {
                controller: bounded(controller, "controller", 127)?,
                value: bounded(value, "value", 127)?,
            },
            ("bend", [value]) => Command::PitchBend(
                value
                    .parse::<u16>()
                    .ok()
                    .filter(|v| *v <= 16383)
                    .with_context(|| format!("bend must be 0-16383, got {value}"))?,
            ),
            ("width", [percent]) => Command::Width(bounded(percent, "width", 100)?),
            ("range", [min, max]) => Command::Range(float_arg(min)?, float_arg(max)?),
            ("threshold", [value]) => Command::Threshold(float_arg(value)?),
            ("drywet", [value]) => Command::DryWet(float_arg(value)?),
            ("pan", [voice, value]) => Command::Pan {
                voice: voice
                    .parse()
                    .with_context(|| format!("invalid voice index {voice}"))?,
                value: bounded(value, "pan", 127)?,
            },
            ("latch", [state]) => Command::Latch(switch_arg(state)?),
            ("lock", [state]) => Command::Lock(switch_arg(state)?),
            ("reset", []) => Command::Reset,
            ("help" | "?", []) => Command::Help,
            ("quit" | "exit", []) => Command::Quit,
            _ => bail!("unknown command '{line}', type 'help'"),
        };
        Ok(command)
    }

    /// Forward to the engine. Returns `false` once the console should stop.
    pub fn execute(self, handle: &EngineHandle) -> anyhow::Result<bool> {
        let sent = match self {
            Command::NoteOn { note, velocity } => handle.note_on(note, velocity),
            Command::NoteOff(note) => handle.note_off(note),
            Command::Panic => handle.send(AudioCommand::AllNotesOff),
            Command::ControlChange { controller, value } => {
                handle.send(AudioCommand::Midi(MidiMessage::ControlChange { controller, value }))
            }
            Command::PitchBend(value) => {
                handle.send(AudioCommand::Midi(MidiMessage::PitchBend(value)))
            }
            Command::Width(percent) => {
                handle.set_stereo_width(percent);
                true
            }
            Command::Range(min, max) => {
                handle.set_pitch_range(min, max)?;
                true
            }
            Command::Threshold(value) => {
                handle.set_confidence_threshold(value)?;
                true
            }
            Command::DryWet(value) => {
                handle.set_dry_wet(value);
                true
            }
            Command::Pan { voice, value } => {
                handle.set_pan(voice, value)?;
                true
            }
            Command::Latch(on) => handle.send(AudioCommand::SetLatch(on)),
            Command::Lock(on) => handle.send(AudioCommand::SetIntervalLock(on)),
            Command::Reset => handle.send(AudioCommand::Reset),
            Command::Help => {
                println!("{HELP}");
                true
            }
            Command::Quit => {
                handle.shutdown();
                return Ok(false);
            }
        };

        if !sent {
            tracing::warn!(command = ?self, "command queue full, dropped");
        }
        Ok(true)
    }
}

fn note_arg(word: &str) -> anyhow::Result<MidiNote> {
    let number: u8 = word
        .parse()
        .with_context(|| format!("invalid note '{word}'"))?;
    Ok(MidiNote::new(number)?)
}

fn bounded(word: &str, name: &str, max: u8) -> anyhow::Result<u8> {
    word.parse::<u8>()
        .ok()
        .filter(|v| *v <= max)
        .with_context(|| format!("{name} must be 0-{max}, got '{word}'"))
}

fn float_arg(word: &str) -> anyhow::Result<f32> {
    let value: f32 = word
        .parse()
        .with_context(|| format!("invalid number '{word}'"))?;
    if !value.is_finite() {
        bail!("invalid number '{word}'");
    }
    Ok(value)
}

fn switch_arg(word: &str) -> anyhow::Result<bool> {
    match word {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        _ => bail!("expected on or off, got '{word}'"),
    }
}
