/// Peak absolute amplitude of a block of normalized samples; 0 for an empty block.
pub fn peak_amplitude(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
}
