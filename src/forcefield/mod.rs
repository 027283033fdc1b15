//! Energy oracles: external force-field engines behind one capability set

pub mod device;
pub mod process;
pub mod so3lr;
pub mod xtb;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub use device::Device;

/// Hartree to kcal/mol
pub const HARTREE_TO_KCAL: f64 = 627.5095;

/// Electron-volt to kcal/mol
pub const EV_TO_KCAL: f64 = 23.0609;

/// Errors that can occur in force-field evaluations
#[derive(Error, Debug)]
pub enum ForceFieldError {
    #[error("{0}")]
    Unavailable(String),

    #[error("{program} exited with status {status}: {detail}")]
    ProcessFailed {
        program: String,
        status: String,
        detail: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("No energy found in {0} output")]
    MissingEnergy(String),

    #[error("Accelerator failure on {device}: {detail}")]
    Device { device: Device, detail: String },

    #[error("Constraint kind not supported by {oracle}: {detail}")]
    InvalidConstraints { oracle: &'static str, detail: String },

    #[error("Optimized geometry was not written to {0}")]
    MissingGeometry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForceFieldError {
    /// Whether this error was raised by the accelerator rather than the calculation
    pub fn is_device_fault(&self) -> bool {
        matches!(self, ForceFieldError::Device { .. })
    }
}

/// Supported energy methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnergyMethod {
    /// xTB GFN2 semi-empirical tight binding (CPU only)
    Gfn2,
    /// SO3LR machine-learned force field (GPU or CPU)
    So3lr,
}

impl EnergyMethod {
    pub const ALL: [EnergyMethod; 2] = [EnergyMethod::Gfn2, EnergyMethod::So3lr];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnergyMethod::Gfn2 => "gfn2",
            EnergyMethod::So3lr => "so3lr",
        }
    }
}

impl Default for EnergyMethod {
    fn default() -> Self {
        EnergyMethod::Gfn2
    }
}

impl fmt::Display for EnergyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an energy method name that is neither `gfn2` nor `so3lr`
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid energy_method '{0}'. Must be 'gfn2' or 'so3lr'")]
pub struct UnknownMethod(pub String);

impl FromStr for EnergyMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gfn2" => Ok(EnergyMethod::Gfn2),
            "so3lr" => Ok(EnergyMethod::So3lr),
            _ => Err(UnknownMethod(s.to_string())),
        }
    }
}

/// Atom numbering an oracle expects in its constraint lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBase {
    /// PDB serial numbers, first atom is 1
    OneBased,
    /// Array positions, first atom is 0
    ZeroBased,
}

/// Positional constraints for a geometry optimization
#[derive(Debug, Clone, PartialEq)]
pub enum Constraints {
    /// Everything moves
    None,
    /// Every non-hydrogen atom is restrained
    HeavyAtoms,
    /// Restrain the listed 1-indexed atom serials
    Serials(Vec<u32>),
    /// Freeze the listed 0-indexed atom positions
    Frozen(Vec<usize>),
}

impl Constraints {
    /// Build the constraint list an oracle expects from 1-indexed serials
    ///
    /// Zero-based oracles get every serial shifted down by one.
    pub fn from_serials(serials: &[u32], base: IndexBase) -> Self {
        if serials.is_empty() {
            return Constraints::None;
        }
        match base {
            IndexBase::OneBased => Constraints::Serials(serials.to_vec()),
            IndexBase::ZeroBased => Constraints::Frozen(
                serials
                    .iter()
                    .filter(|&&s| s > 0)
                    .map(|&s| s as usize - 1)
                    .collect(),
            ),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Constraints::None => true,
            Constraints::HeavyAtoms => false,
            Constraints::Serials(s) => s.is_empty(),
            Constraints::Frozen(f) => f.is_empty(),
        }
    }
}

/// Per-call settings shared by every oracle
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationOptions {
    /// Long-range interaction cutoff in Angstroms (ML oracle only)
    pub lr_cutoff: f64,

    /// Total molecular charge
    pub charge: f64,
}

impl Default for CalculationOptions {
    fn default() -> Self {
        Self {
            lr_cutoff: 12.0,
            charge: 0.0,
        }
    }
}

/// Capability set of an energy-evaluation engine
///
/// Implementations treat the engine as a black box: a structure file goes in,
/// an energy in the oracle's native unit comes out.
pub trait EnergyOracle: Send {
    /// Which method this oracle implements
    fn method(&self) -> EnergyMethod;

    /// Get the name of the oracle
    fn name(&self) -> &'static str;

    /// Check that the engine can run; the message describes the version or the fault
    fn check_availability(&self) -> Result<String, ForceFieldError>;

    /// Device calculations currently run on
    fn device(&self) -> Device;

    /// Move subsequent calculations to another device
    fn set_device(&mut self, device: Device);

    /// Numbering expected in [`Constraints`]
    fn index_base(&self) -> IndexBase;

    /// Factor converting this oracle's native energy unit to kcal/mol
    fn kcal_per_unit(&self) -> f64;

    /// Single-point energy of a structure file
    fn energy(&self, structure: &Path, options: &CalculationOptions) -> Result<f64, ForceFieldError>;

    /// Optimize `structure` under `constraints`, write the geometry to `output`
    /// and return the energy of the optimized geometry
    fn optimize(
        &self,
        structure: &Path,
        output: &Path,
        constraints: &Constraints,
        options: &CalculationOptions,
    ) -> Result<f64, ForceFieldError>;
}
