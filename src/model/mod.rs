//! Pose, batch and result records

pub mod batch;
pub mod pose;
pub mod result;

use thiserror::Error;

use crate::forcefield::UnknownMethod;

pub use batch::PoseBatch;
pub use pose::{Pose, PoseInputs};
pub use result::{OutputRefs, RankingResult, ScoredEnergies};

/// Errors that reject a pose or a batch before any computation
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Pose batch is empty")]
    EmptyBatch,

    #[error("Pose ID is required")]
    MissingPoseId,

    #[error("Pose {0}: must provide either structure_cif or both protein_pdb and ligand_sdf")]
    MissingInputs(String),

    #[error("Pose {pose_id}: {source}")]
    InvalidMethod {
        pose_id: String,
        #[source]
        source: UnknownMethod,
    },

    #[error("Record {index} is not a valid pose: {message}")]
    InvalidRecord { index: usize, message: String },

    #[error("Invalid pose data in batch: {}", .0.join("; "))]
    InvalidPoses(Vec<String>),
}
