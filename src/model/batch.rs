//! Ordered collection of poses ranked together

use serde_json::Value;

use super::{Pose, ValidationError};
use crate::forcefield::EnergyMethod;

/// A validated, non-empty batch of poses
#[derive(Debug, Clone)]
pub struct PoseBatch {
    poses: Vec<Pose>,
    default_method: Option<EnergyMethod>,
}

impl PoseBatch {
    /// Validate the poses as a whole; any invalid pose rejects the batch
    pub fn new(poses: Vec<Pose>, default_method: Option<EnergyMethod>) -> Result<Self, ValidationError> {
        if poses.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }

        let errors: Vec<String> = poses
            .iter()
            .enumerate()
            .filter_map(|(i, pose)| pose.validate().err().map(|e| format!("pose {}: {}", i, e)))
            .collect();
        if !errors.is_empty() {
            return Err(ValidationError::InvalidPoses(errors));
        }

        Ok(Self {
            poses,
            default_method,
        })
    }

    /// Build a batch from raw JSON records
    pub fn from_records(records: &[Value], default_method: Option<EnergyMethod>) -> Result<Self, ValidationError> {
        let poses = records
            .iter()
            .enumerate()
            .map(|(i, record)| {
                Pose::from_record(record).map_err(|e| ValidationError::InvalidRecord {
                    index: i,
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(poses, default_method)
    }

    pub fn poses(&self) -> &[Pose] {
        &self.poses
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    pub fn default_method(&self) -> Option<EnergyMethod> {
        self.default_method
    }

    /// Pose override, then batch default, then GFN2
    pub fn effective_method(&self, pose: &Pose) -> EnergyMethod {
        pose.method_override()
            .ok()
            .flatten()
            .or(self.default_method)
            .unwrap_or_default()
    }
}
