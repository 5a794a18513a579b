use std::path::Path;

use hound::WavReader;

/// Length of the synthesized clip, read from the wav header only.
pub fn wav_duration_seconds(path: &Path) -> anyhow::Result<f64> {
    let reader = WavReader::open(path)?;
    let frames = reader.duration();
    Ok(frames as f64 / reader.spec().sample_rate as f64)
}
