//! CSV sample tables
//!
//! One row per sample with the header
//! `commanded_z_um,measured_z_um,error,intensity`; an empty `measured_z_um`
//! means the stage had no readback. Floats are written in shortest
//! round-trip form so a reloaded table refits to the identical report.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use super::types::CalibrationSample;
use super::CalibrationError;

/// Write samples as CSV to any writer
pub fn write_samples<W: Write>(writer: W, samples: &[CalibrationSample]) -> Result<(), CalibrationError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for sample in samples {
        csv_writer.serialize(sample)?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Read samples from CSV produced by [`write_samples`]
pub fn read_samples<R: Read>(reader: R) -> Result<Vec<CalibrationSample>, CalibrationError> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let samples = csv_reader
        .deserialize()
        .collect::<Result<Vec<CalibrationSample>, _>>()?;
    Ok(samples)
}

/// Save samples to a CSV file, replacing it if present
pub fn save_samples_csv<P: AsRef<Path>>(
    path: P,
    samples: &[CalibrationSample],
) -> Result<(), CalibrationError> {
    let file = File::create(path.as_ref())?;
    write_samples(file, samples)?;
    log::info!(
        "Saved {} calibration samples to {}",
        samples.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Load samples from a CSV file
pub fn load_samples_csv<P: AsRef<Path>>(path: P) -> Result<Vec<CalibrationSample>, CalibrationError> {
    let file = File::open(path.as_ref())?;
    read_samples(file)
}
