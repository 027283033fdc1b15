//! Conversion of combined complex structures into separate protein and ligand files

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("CIF conversion not yet implemented")]
    Unsupported,
}

/// Splits a combined structure into `(protein, ligand)` files inside `work_dir`
pub trait StructureConverter {
    fn convert(&self, structure: &Path, work_dir: &Path) -> Result<(PathBuf, PathBuf), ConversionError>;
}

/// Converter used when no CIF backend is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedConverter;

impl StructureConverter for UnsupportedConverter {
    fn convert(&self, _structure: &Path, _work_dir: &Path) -> Result<(PathBuf, PathBuf), ConversionError> {
        Err(ConversionError::Unsupported)
    }
}
