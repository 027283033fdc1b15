//! Energy decomposition: complex, protein, bound ligand and free ligand energies
//!
//! The pipeline runs a fixed sequence of stages inside one working directory:
//!
//! 1. complete the ligand's hydrogens, form the complex and write `complex.pdb` (optionally chopped to
//!    `complex_chopped.pdb`)
//! 2. evaluate the complex, optimizing it with the protein restrained
//! 3. split the evaluated complex into `prot_split.pdb` and `lig_split.pdb`
//! 4. evaluate protein and bound ligand as single points
//! 5. relax a copy of the ligand (`lig_opt.pdb`) without restraints
//!
//! Interaction and strain are then derived from the four energies. A stage that
//! fails stops the pipeline; nothing is retried here.

use log::{debug, info};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::chop::{chop, DEFAULT_DISTANCE_CUTOFF};
use crate::forcefield::{CalculationOptions, Constraints, EnergyOracle, ForceFieldError};
use crate::hydrogens;
use crate::io::{self, IoError};
use crate::partition::{self, PartitionError, LIGAND_LABEL};

/// Long-range cutoff used for chopped subsystems (Angstroms)
pub const CHOPPED_LR_CUTOFF: f64 = 12.0;

/// Long-range cutoff used for full complexes (Angstroms)
pub const FULL_LR_CUTOFF: f64 = 20.0;

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preparing,
    ComplexEnergy,
    Split,
    ProteinEnergy,
    LigandBoundEnergy,
    LigandFreeEnergy,
    DeriveScores,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preparing => "structure preparation",
            Stage::ComplexEnergy => "complex energy",
            Stage::Split => "complex split",
            Stage::ProteinEnergy => "protein energy",
            Stage::LigandBoundEnergy => "bound ligand energy",
            Stage::LigandFreeEnergy => "free ligand energy",
            Stage::DeriveScores => "score derivation",
        };
        f.write_str(name)
    }
}

/// What went wrong inside a stage
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Structure(#[from] IoError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    ForceField(#[from] ForceFieldError),

    #[error("File system error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("{0} energy is not a finite number")]
    NonFiniteEnergy(&'static str),
}

/// A stage failure
#[derive(Error, Debug)]
#[error("{stage} failed: {source}")]
pub struct DecompositionError {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl DecompositionError {
    pub fn new(stage: Stage, source: impl Into<StageError>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }

    /// Whether the failure came from the accelerator rather than the chemistry
    pub fn is_device_fault(&self) -> bool {
        matches!(&self.source, StageError::ForceField(e) if e.is_device_fault())
    }
}

/// Attach a stage to any error a step produces
trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, DecompositionError>;
}

impl<T, E: Into<StageError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: Stage) -> Result<T, DecompositionError> {
        self.map_err(|e| DecompositionError::new(stage, e))
    }
}

/// Knobs of one decomposition run
#[derive(Debug, Clone, PartialEq)]
pub struct DecompositionParams {
    /// Reduce the complex to the residues around the ligand
    pub use_chopping: bool,

    /// Optimize the complex with the protein restrained
    pub optimize_complex: bool,

    /// Relax the free ligand; when off, strain is zero
    pub optimize_ligand: bool,

    /// Chopping distance in Angstroms
    pub distance_cutoff: f64,

    /// Long-range cutoff override; defaults depend on chopping
    pub lr_cutoff: Option<f64>,

    /// Bridge single-residue gaps in chopped chains
    pub expand_chain_breaks: bool,

    /// Residue label given to ligand atoms
    pub ligand_label: String,

    /// Total charge of the complex
    pub charge: f64,
}

impl Default for DecompositionParams {
    fn default() -> Self {
        Self {
            use_chopping: true,
            optimize_complex: true,
            optimize_ligand: true,
            distance_cutoff: DEFAULT_DISTANCE_CUTOFF,
            lr_cutoff: None,
            expand_chain_breaks: false,
            ligand_label: LIGAND_LABEL.to_string(),
            charge: 0.0,
        }
    }
}

impl DecompositionParams {
    pub fn effective_lr_cutoff(&self) -> f64 {
        self.lr_cutoff.unwrap_or(if self.use_chopping {
            CHOPPED_LR_CUTOFF
        } else {
            FULL_LR_CUTOFF
        })
    }

    fn calculation_options(&self) -> CalculationOptions {
        CalculationOptions {
            lr_cutoff: self.effective_lr_cutoff(),
            charge: self.charge,
        }
    }
}

/// Separate protein and ligand structure files
#[derive(Debug, Clone)]
pub struct DecompositionInput {
    pub protein: PathBuf,
    pub ligand: PathBuf,
}

/// The four raw energies of a decomposition, in the oracle's native unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyBreakdown {
    pub complex: f64,
    pub protein: f64,
    pub ligand_bound: f64,
    pub ligand_free: f64,

    /// Conversion from the native unit to kcal/mol
    pub kcal_per_unit: f64,
}

impl EnergyBreakdown {
    /// complex - protein - bound ligand, native unit
    pub fn interaction_native(&self) -> f64 {
        self.complex - self.protein - self.ligand_bound
    }

    /// bound ligand - free ligand, native unit
    pub fn strain_native(&self) -> f64 {
        self.ligand_bound - self.ligand_free
    }

    pub fn interaction(&self) -> f64 {
        self.interaction_native() * self.kcal_per_unit
    }

    pub fn strain(&self) -> f64 {
        self.strain_native() * self.kcal_per_unit
    }

    pub fn total(&self) -> f64 {
        self.interaction() + self.strain()
    }

    /// Native energy converted to kcal/mol
    pub fn to_kcal(&self, native: f64) -> f64 {
        native * self.kcal_per_unit
    }
}

/// Energies plus the structure files a run produced
#[derive(Debug, Clone)]
pub struct DecompositionOutput {
    pub energies: EnergyBreakdown,

    /// Optimized complex, when complex optimization ran
    pub complex_opt: Option<PathBuf>,

    /// Protein half of the evaluated complex
    pub protein: PathBuf,

    /// Ligand half of the evaluated complex
    pub ligand_bound: PathBuf,

    /// Relaxed free ligand, when ligand optimization ran
    pub ligand_opt: Option<PathBuf>,
}

fn finite(value: f64, what: &'static str) -> Result<f64, DecompositionError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(DecompositionError::new(
            Stage::DeriveScores,
            StageError::NonFiniteEnergy(what),
        ))
    }
}

/// Run the full decomposition for one pose inside `work_dir`
pub fn decompose(
    oracle: &dyn EnergyOracle,
    input: &DecompositionInput,
    params: &DecompositionParams,
    work_dir: &Path,
    pose_id: &str,
) -> Result<DecompositionOutput, DecompositionError> {
    let options = params.calculation_options();
    let label = params.ligand_label.as_str();

    // Preparing
    let protein = io::read_structure(&input.protein).at(Stage::Preparing)?;
    let ligand = hydrogens::read_ligand(&input.ligand).at(Stage::Preparing)?;
    let complex = partition::form_complex(&protein, &ligand, label).at(Stage::Preparing)?;

    let complex_path = work_dir.join("complex.pdb");
    io::write_pdb(&complex, &complex_path).at(Stage::Preparing)?;

    let target = if params.use_chopping {
        let chopped = chop(&complex, label, params.distance_cutoff, params.expand_chain_breaks);
        let chopped_path = work_dir.join("complex_chopped.pdb");
        io::write_pdb(&chopped, &chopped_path).at(Stage::Preparing)?;
        info!(
            "[{}] Chopped complex: {} -> {} atoms (cutoff {:.1} A)",
            pose_id,
            complex.len(),
            chopped.len(),
            params.distance_cutoff
        );
        chopped_path
    } else {
        complex_path
    };

    // Serials must match the numbering the oracle will see in the written file
    let written = io::parse_pdb(&target).at(Stage::Preparing)?;
    let serials = partition::protein_atom_serials(&written, label, false);
    let constraints = Constraints::from_serials(&serials, oracle.index_base());
    debug!("[{}] {} protein heavy atoms restrained", pose_id, serials.len());

    // ComplexEnergy
    let (complex_energy, evaluated, complex_opt) = if params.optimize_complex {
        info!("[{}] Optimizing complex with {}", pose_id, oracle.name());
        let output = work_dir.join("complex_opt.pdb");
        let energy = oracle
            .optimize(&target, &output, &constraints, &options)
            .at(Stage::ComplexEnergy)?;
        (energy, output.clone(), Some(output))
    } else {
        info!("[{}] Complex single point with {}", pose_id, oracle.name());
        let energy = oracle.energy(&target, &options).at(Stage::ComplexEnergy)?;
        (energy, target.clone(), None)
    };

    // Split
    let evaluated_structure = io::parse_pdb(&evaluated).at(Stage::Split)?;
    let split = partition::split_structure(&evaluated_structure, label).at(Stage::Split)?;
    let protein_path = work_dir.join("prot_split.pdb");
    let ligand_path = work_dir.join("lig_split.pdb");
    io::write_pdb(&split.protein, &protein_path).at(Stage::Split)?;
    io::write_pdb(&split.ligand, &ligand_path).at(Stage::Split)?;

    // ProteinEnergy
    info!("[{}] Protein single point", pose_id);
    let protein_energy = oracle.energy(&protein_path, &options).at(Stage::ProteinEnergy)?;

    // LigandBoundEnergy
    info!("[{}] Bound ligand single point", pose_id);
    let ligand_bound_energy = oracle
        .energy(&ligand_path, &options)
        .at(Stage::LigandBoundEnergy)?;

    // LigandFreeEnergy
    let (ligand_free_energy, ligand_opt) = if params.optimize_ligand {
        info!("[{}] Relaxing free ligand", pose_id);
        let free_path = work_dir.join("lig_opt.pdb");
        fs::copy(&ligand_path, &free_path).at(Stage::LigandFreeEnergy)?;
        let energy = oracle
            .optimize(&free_path, &free_path, &Constraints::None, &options)
            .at(Stage::LigandFreeEnergy)?;
        (energy, Some(free_path))
    } else {
        (ligand_bound_energy, None)
    };

    // DeriveScores
    let energies = EnergyBreakdown {
        complex: finite(complex_energy, "complex")?,
        protein: finite(protein_energy, "protein")?,
        ligand_bound: finite(ligand_bound_energy, "bound ligand")?,
        ligand_free: finite(ligand_free_energy, "free ligand")?,
        kcal_per_unit: oracle.kcal_per_unit(),
    };

    info!(
        "[{}] Interaction {:.2} kcal/mol, strain {:.2} kcal/mol",
        pose_id,
        energies.interaction(),
        energies.strain()
    );

    Ok(DecompositionOutput {
        energies,
        complex_opt,
        protein: protein_path,
        ligand_bound: ligand_path,
        ligand_opt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_scores_from_energies() {
        let energies = EnergyBreakdown {
            complex: -100.0,
            protein: -80.0,
            ligand_bound: -20.0,
            ligand_free: -20.0,
            kcal_per_unit: 627.5095,
        };
        assert_eq!(energies.interaction_native(), 0.0);
        assert_eq!(energies.interaction(), 0.0);
        assert_eq!(energies.strain(), 0.0);
    }

    #[test]
    fn test_strain_is_bound_minus_free() {
        let energies = EnergyBreakdown {
            complex: -10.0,
            protein: -6.0,
            ligand_bound: -3.0,
            ligand_free: -3.5,
            kcal_per_unit: 2.0,
        };
        assert_approx_eq!(energies.interaction(), -2.0);
        assert_approx_eq!(energies.strain(), 1.0);
        assert_approx_eq!(energies.total(), -1.0);
    }

    #[test]
    fn test_lr_cutoff_depends_on_chopping() {
        let mut params = DecompositionParams::default();
        assert_eq!(params.effective_lr_cutoff(), CHOPPED_LR_CUTOFF);
        params.use_chopping = false;
        assert_eq!(params.effective_lr_cutoff(), FULL_LR_CUTOFF);
        params.lr_cutoff = Some(15.0);
        assert_eq!(params.effective_lr_cutoff(), 15.0);
    }

    #[test]
    fn test_device_fault_detection() {
        let err = DecompositionError::new(
            Stage::ComplexEnergy,
            ForceFieldError::Device {
                device: crate::forcefield::Device::Cuda(0),
                detail: "CUDA error".to_string(),
            },
        );
        assert!(err.is_device_fault());
        assert!(err.to_string().starts_with("complex energy failed"));

        let err = DecompositionError::new(Stage::Preparing, PartitionError::EmptyLigand);
        assert!(!err.is_device_fault());
    }
}
