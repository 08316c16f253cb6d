//! Energy measures for silence detection.

/// Root-mean-square of zero-centered samples, clamped to [0, 1].
///
/// Samples are expected in [-1, 1]; out-of-range input is clipped first so
/// the result stays normalized.
pub fn rms(chunk: &[f32]) -> f32 {
    if chunk.is_empty() {
        return 0.0;
    }
    let sum: f32 = chunk
        .iter()
        .map(|s| {
            let s = s.clamp(-1.0, 1.0);
            s * s
        })
        .sum();
    (sum / chunk.len() as f32).sqrt().min(1.0)
}
