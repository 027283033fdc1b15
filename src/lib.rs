//! pose-rank: ranking of protein-ligand binding poses by energy decomposition
//!
//! Each pose is turned into a complex, optionally chopped to the residues around
//! the ligand, and evaluated with an external force field. The complex, protein,
//! bound-ligand and free-ligand energies give an interaction score and a ligand
//! strain score.

pub mod atom;
pub mod chop;
pub mod config;
pub mod convert;
pub mod decomposition;
pub mod fallback;
pub mod forcefield;
pub mod hydrogens;
pub mod io;
pub mod model;
pub mod partition;
pub mod runner;
pub mod storage;
pub mod structure;

// Re-export commonly used types and functions
pub use atom::Atom;
pub use decomposition::{decompose, DecompositionParams, EnergyBreakdown};
pub use forcefield::{EnergyMethod, EnergyOracle};
pub use model::{Pose, PoseBatch, RankingResult};
pub use runner::{rank_records, RankingRunner};
pub use structure::Structure;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
