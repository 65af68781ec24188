//! Random calibration ("DRA") samples for each primary input.

use crate::core::types::Port;
use crate::error::ExportError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

/// Samples are integers in `[0, SAMPLE_MAX)` stored as float32.
pub const SAMPLE_MAX: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationEntry {
    pub input: String,
    pub shape: Vec<usize>,
    /// Raw little-endian float32 samples
    pub bin_path: PathBuf,
    /// Text file holding `bin_path`
    pub list_path: PathBuf,
}

pub fn sample(numel: usize, rng: &mut impl Rng) -> Vec<f32> {
    (0..numel).map(|_| rng.gen_range(0..SAMPLE_MAX) as f32).collect()
}

fn write(path: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    std::fs::write(path, bytes).map_err(|source| ExportError::Io { path: path.to_path_buf(), source })
}

pub fn write_calibration(inputs: &[Port], dir: &Path, seed: Option<u64>) -> Result<Vec<CalibrationEntry>, ExportError> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut entries = Vec::with_capacity(inputs.len());
    for port in inputs {
        let values = sample(port.shape.iter().product(), &mut rng);
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

        let bin_path = dir.join(format!("{}_dra.bin", port.name));
        write(&bin_path, &bytes)?;
        let list_path = dir.join(format!("{}_dra.txt", port.name));
        write(&list_path, bin_path.to_string_lossy().as_bytes())?;

        entries.push(CalibrationEntry { input: port.name.clone(), shape: port.shape.clone(), bin_path, list_path });
    }
    Ok(entries)
}

pub fn read_samples(path: &Path) -> Result<Vec<f32>, ExportError> {
    let bytes = std::fs::read(path).map_err(|source| ExportError::Io { path: path.to_path_buf(), source })?;
    Ok(bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
}
