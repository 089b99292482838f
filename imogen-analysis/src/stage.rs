//! Processing stage capability shared by every part of the pipeline

/// Resource lifecycle every pipeline stage implements.
///
/// `prepare` is the only place a stage may allocate. Each stage's process
/// call has its own inputs and outputs (`PitchDetector::detect` takes a frame,
/// `GrainExtractor::extract` a buffer and a period, `HarmonizerEngine::process`
/// host audio plus MIDI), so processing is left to the implementor.
pub trait Stage {
    /// Error returned when the stage cannot be configured
    type Error;

    /// (Re)allocate for a sample rate and the largest block the stage will see
    fn prepare(&mut self, sample_rate: f64, max_block_size: usize) -> Result<(), Self::Error>;

    /// Drop runtime state so the next block starts from silence
    fn release(&mut self);

    /// Stage name for logging
    fn name(&self) -> &'static str;
}
