//! MIDI messages, validated note numbers and note-indexed tables

use crate::error::NoteError;

/// MIDI 1.0 status bytes (upper nibble)
pub mod status {
    pub const NOTE_OFF: u8 = 0x80;
    pub const NOTE_ON: u8 = 0x90;
    pub const CONTROL_CHANGE: u8 = 0xB0;
    pub const PITCH_BEND: u8 = 0xE0;
}

/// Controller numbers the harmonizer responds to
pub mod cc {
    pub const SUSTAIN: u8 = 64;
    pub const ALL_SOUND_OFF: u8 = 120;
    pub const ALL_NOTES_OFF: u8 = 123;
}

/// Pitch wheel rest position
pub const PITCH_BEND_CENTER: u16 = 8192;
/// Largest 14-bit pitch wheel value
pub const PITCH_BEND_MAX: u16 = 16383;
/// Number of MIDI notes
pub const NOTE_COUNT: usize = 128;
/// Reference pitch of A4 (note 69)
pub const DEFAULT_CONCERT_PITCH: f32 = 440.0;

/// Frequency of a (possibly fractional) MIDI note
pub fn midi_to_frequency(note: f32, concert_pitch: f32) -> f32 {
    concert_pitch * 2f32.powf((note - 69.0) / 12.0)
}

/// Fractional MIDI note of a frequency
pub fn frequency_to_midi(hz: f32, concert_pitch: f32) -> f32 {
    if hz <= 0.0 || concert_pitch <= 0.0 {
        return 0.0;
    }
    69.0 + 12.0 * (hz / concert_pitch).log2()
}

/// A note number known to be within 0-127
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MidiNote(u8);

impl MidiNote {
    pub const MAX: u8 = 127;

    pub fn new(number: u8) -> Result<Self, NoteError> {
        if number > Self::MAX {
            return Err(NoteError::OutOfRange(number));
        }
        Ok(Self(number))
    }

    pub fn number(self) -> u8 {
        self.0
    }

    /// Frequency in Hz for the given A4 reference
    pub fn frequency(self, concert_pitch: f32) -> f32 {
        midi_to_frequency(self.0 as f32, concert_pitch)
    }

    /// Shift by `semitones`, or `None` if the result leaves the MIDI range
    pub fn transpose(self, semitones: i16) -> Option<Self> {
        let shifted = self.0 as i16 + semitones;
        if (0..=Self::MAX as i16).contains(&shifted) {
            Some(Self(shifted as u8))
        } else {
            None
        }
    }
}

impl TryFrom<u8> for MidiNote {
    type Error = NoteError;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        Self::new(number)
    }
}

impl From<MidiNote> for u8 {
    fn from(note: MidiNote) -> u8 {
        note.0
    }
}

/// Fixed table with one optional slot per MIDI note.
///
/// Backed by an inline array so inserting and removing never allocate.
#[derive(Debug, Clone, Copy)]
pub struct NoteTable<T: Copy> {
    slots: [Option<T>; NOTE_COUNT],
}

impl<T: Copy> Default for NoteTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> NoteTable<T> {
    pub fn new() -> Self {
        Self {
            slots: [None; NOTE_COUNT],
        }
    }

    pub fn get(&self, note: MidiNote) -> Option<T> {
        self.slots[note.0 as usize]
    }

    /// Store `value` for `note`, returning the previous entry
    pub fn insert(&mut self, note: MidiNote, value: T) -> Option<T> {
        self.slots[note.0 as usize].replace(value)
    }

    pub fn remove(&mut self, note: MidiNote) -> Option<T> {
        self.slots[note.0 as usize].take()
    }

    pub fn contains(&self, note: MidiNote) -> bool {
        self.slots[note.0 as usize].is_some()
    }

    pub fn clear(&mut self) {
        self.slots = [None; NOTE_COUNT];
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Occupied entries in ascending note order
    pub fn iter(&self) -> impl Iterator<Item = (MidiNote, T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.map(|value| (MidiNote(i as u8), value)))
    }

    /// Keep only the entries for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(MidiNote, T) -> bool) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = *slot {
                if !keep(MidiNote(i as u8), value) {
                    *slot = None;
                }
            }
        }
    }
}

/// Channel voice messages understood by the harmonizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { note: MidiNote, velocity: u8 },
    NoteOff { note: MidiNote, velocity: u8 },
    ControlChange { controller: u8, value: u8 },
    /// 14-bit wheel position, 8192 at rest
    PitchBend(u16),
}

impl MidiMessage {
    /// Parse a raw channel message, ignoring the channel nibble.
    ///
    /// Note-on with velocity 0 is reported as note-off. Unsupported or
    /// truncated messages yield `None`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (&status_byte, data) = bytes.split_first()?;
        if status_byte & 0x80 == 0 {
            return None;
        }
        let data1 = *data.first()? & 0x7F;
        let data2 = data.get(1).map(|b| b & 0x7F);

        match status_byte & 0xF0 {
            status::NOTE_OFF => Some(Self::NoteOff {
                note: MidiNote(data1),
                velocity: data2?,
            }),
            status::NOTE_ON => {
                let velocity = data2?;
                let note = MidiNote(data1);
                if velocity == 0 {
                    Some(Self::NoteOff { note, velocity: 0 })
                } else {
                    Some(Self::NoteOn { note, velocity })
                }
            }
            status::CONTROL_CHANGE => Some(Self::ControlChange {
                controller: data1,
                value: data2?,
            }),
            status::PITCH_BEND => Some(Self::PitchBend(data1 as u16 | (data2? as u16) << 7)),
            _ => None,
        }
    }

    /// Encode as a three-byte message on `channel` (0-15)
    pub fn to_bytes(self, channel: u8) -> [u8; 3] {
        let ch = channel & 0x0F;
        match self {
            Self::NoteOn { note, velocity } => [status::NOTE_ON | ch, note.0, velocity & 0x7F],
            Self::NoteOff { note, velocity } => [status::NOTE_OFF | ch, note.0, velocity & 0x7F],
            Self::ControlChange { controller, value } => {
                [status::CONTROL_CHANGE | ch, controller & 0x7F, value & 0x7F]
            }
            Self::PitchBend(value) => {
                let value = value.min(PITCH_BEND_MAX);
                [status::PITCH_BEND | ch, (value & 0x7F) as u8, (value >> 7) as u8]
            }
        }
    }
}

/// A message timestamped by its sample offset within the host block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub offset: usize,
    pub message: MidiMessage,
}

impl MidiEvent {
    pub fn new(offset: usize, message: MidiMessage) -> Self {
        Self { offset, message }
    }

    pub fn note_on(offset: usize, note: MidiNote, velocity: u8) -> Self {
        Self::new(offset, MidiMessage::NoteOn { note, velocity })
    }

    pub fn note_off(offset: usize, note: MidiNote) -> Self {
        Self::new(offset, MidiMessage::NoteOff { note, velocity: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(n: u8) -> MidiNote {
        MidiNote::new(n).unwrap()
    }

    #[test]
    fn test_note_validation() {
        assert!(MidiNote::new(0).is_ok());
        assert!(MidiNote::new(127).is_ok());
        assert_eq!(MidiNote::new(128), Err(NoteError::OutOfRange(128)));
        assert!(MidiNote::try_from(200u8).is_err());
    }

    #[test]
    fn test_note_frequency() {
        assert!((note(69).frequency(440.0) - 440.0).abs() < 1e-3);
        assert!((note(81).frequency(440.0) - 880.0).abs() < 1e-2);
        assert!((note(60).frequency(440.0) - 261.626).abs() < 1e-2);
        assert!((frequency_to_midi(220.0, 440.0) - 57.0).abs() < 1e-4);
    }

    #[test]
    fn test_transpose_bounds() {
        assert_eq!(note(60).transpose(-12), Some(note(48)));
        assert_eq!(note(120).transpose(12), None);
        assert_eq!(note(3).transpose(-4), None);
    }

    #[test]
    fn test_note_table() {
        let mut table: NoteTable<usize> = NoteTable::new();
        assert!(table.is_empty());
        assert_eq!(table.insert(note(64), 1), None);
        assert_eq!(table.insert(note(60), 2), None);
        assert_eq!(table.insert(note(64), 3), Some(1));
        assert_eq!(table.len(), 2);

        let entries: Vec<_> = table.iter().map(|(n, v)| (n.number(), v)).collect();
        assert_eq!(entries, vec![(60, 2), (64, 3)]);

        table.retain(|_, v| v != 2);
        assert!(!table.contains(note(60)));
        assert_eq!(table.remove(note(64)), Some(3));
        assert!(table.is_empty());
    }

    #[test]
    fn test_parse_channel_messages() {
        assert_eq!(
            MidiMessage::from_bytes(&[0x93, 60, 100]),
            Some(MidiMessage::NoteOn { note: note(60), velocity: 100 })
        );
        assert_eq!(
            MidiMessage::from_bytes(&[0x90, 60, 0]),
            Some(MidiMessage::NoteOff { note: note(60), velocity: 0 })
        );
        assert_eq!(
            MidiMessage::from_bytes(&[0xB0, cc::SUSTAIN, 127]),
            Some(MidiMessage::ControlChange { controller: 64, value: 127 })
        );
        assert_eq!(
            MidiMessage::from_bytes(&[0xE0, 0x00, 0x40]),
            Some(MidiMessage::PitchBend(PITCH_BEND_CENTER))
        );
    }

    #[test]
    fn test_parse_rejects_unsupported() {
        assert_eq!(MidiMessage::from_bytes(&[]), None);
        assert_eq!(MidiMessage::from_bytes(&[0x90, 60]), None);
        assert_eq!(MidiMessage::from_bytes(&[0x40, 60, 100]), None);
        assert_eq!(MidiMessage::from_bytes(&[0xC0, 5]), None);
    }

    #[test]
    fn test_encode_matches_parse() {
        let msg = MidiMessage::PitchBend(12000);
        assert_eq!(MidiMessage::from_bytes(&msg.to_bytes(2)), Some(msg));
    }
}
