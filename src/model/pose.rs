//! A single protein-ligand pose to be ranked

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ValidationError;
use crate::forcefield::EnergyMethod;

/// Where a pose's structures come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoseInputs {
    /// Separate protein and ligand references
    Separate { protein: String, ligand: String },
    /// One combined structure that must be converted first
    Combined { structure: String },
}

/// One pose record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    #[serde(default)]
    pub pose_id: String,

    /// Combined protein-ligand structure (mmCIF)
    #[serde(default)]
    pub structure_cif: Option<String>,

    #[serde(default)]
    pub protein_pdb: Option<String>,

    #[serde(default)]
    pub ligand_sdf: Option<String>,

    /// Destination for the optimized complex
    #[serde(default)]
    pub structure_path: Option<String>,

    /// Per-pose energy method override
    #[serde(default)]
    pub energy_method: Option<String>,

    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl Pose {
    /// Build a pose from separate protein and ligand references
    pub fn from_files(pose_id: &str, protein: &str, ligand: &str) -> Self {
        Self {
            pose_id: pose_id.to_string(),
            protein_pdb: Some(protein.to_string()),
            ligand_sdf: Some(ligand.to_string()),
            ..Self::default()
        }
    }

    /// Parse a pose from one JSON record; unknown keys are ignored
    pub fn from_record(record: &Value) -> Result<Self, serde_json::Error> {
        Pose::deserialize(record)
    }

    /// Resolve the input option, preferring protein+ligand over the combined structure
    pub fn inputs(&self) -> Result<PoseInputs, ValidationError> {
        let separate = present(&self.protein_pdb).zip(present(&self.ligand_sdf));
        let combined = present(&self.structure_cif);

        match (separate, combined) {
            (Some((protein, ligand)), combined) => {
                if combined.is_some() {
                    warn!(
                        "[{}] Both structure_cif and protein_pdb+ligand_sdf given, using protein_pdb+ligand_sdf",
                        self.pose_id
                    );
                }
                Ok(PoseInputs::Separate {
                    protein: protein.to_string(),
                    ligand: ligand.to_string(),
                })
            }
            (None, Some(structure)) => Ok(PoseInputs::Combined {
                structure: structure.to_string(),
            }),
            (None, None) => Err(ValidationError::MissingInputs(self.pose_id.clone())),
        }
    }

    /// Parsed per-pose method override
    pub fn method_override(&self) -> Result<Option<EnergyMethod>, ValidationError> {
        match present(&self.energy_method) {
            None => Ok(None),
            Some(name) => name
                .parse()
                .map(Some)
                .map_err(|source| ValidationError::InvalidMethod {
                    pose_id: self.pose_id.clone(),
                    source,
                }),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.pose_id.trim().is_empty() {
            return Err(ValidationError::MissingPoseId);
        }
        self.inputs()?;
        self.method_override()?;
        Ok(())
    }

    pub fn metadata(&self) -> Map<String, Value> {
        self.metadata.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_record_ignores_unknown_keys() {
        let record = json!({
            "pose_id": "p1",
            "protein_pdb": "s3://bucket/p1_protein.pdb",
            "ligand_sdf": "s3://bucket/p1_ligand.sdf",
            "energy_method": null,
            "metadata": {"score": 3},
            "docking_rank": 1
        });
        let pose = Pose::from_record(&record).unwrap();
        assert_eq!(pose.pose_id, "p1");
        assert!(pose.energy_method.is_none());
        assert_eq!(pose.metadata()["score"], json!(3));
        assert!(pose.validate().is_ok());
    }

    #[test]
    fn test_inputs_prefer_separate_files() {
        let mut pose = Pose::from_files("p1", "protein.pdb", "ligand.sdf");
        pose.structure_cif = Some("complex.cif".to_string());
        assert_eq!(
            pose.inputs().unwrap(),
            PoseInputs::Separate {
                protein: "protein.pdb".to_string(),
                ligand: "ligand.sdf".to_string()
            }
        );
    }

    #[test]
    fn test_inputs_combined_only() {
        let pose = Pose {
            pose_id: "p1".to_string(),
            structure_cif: Some("complex.cif".to_string()),
            protein_pdb: Some("protein.pdb".to_string()),
            ..Pose::default()
        };
        assert!(matches!(pose.inputs().unwrap(), PoseInputs::Combined { .. }));
    }

    #[test]
    fn test_validation_failures() {
        let missing_id = Pose::from_files("", "protein.pdb", "ligand.sdf");
        assert!(matches!(missing_id.validate(), Err(ValidationError::MissingPoseId)));

        let no_inputs = Pose {
            pose_id: "p1".to_string(),
            protein_pdb: Some("protein.pdb".to_string()),
            ..Pose::default()
        };
        assert!(matches!(no_inputs.validate(), Err(ValidationError::MissingInputs(_))));

        let mut bad_method = Pose::from_files("p1", "protein.pdb", "ligand.sdf");
        bad_method.energy_method = Some("mmff".to_string());
        assert!(matches!(
            bad_method.validate(),
            Err(ValidationError::InvalidMethod { .. })
        ));
    }
}
