//! Outcome of ranking one pose

use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::decomposition::EnergyBreakdown;
use crate::forcefield::{Device, EnergyMethod};

/// Energies of a successful ranking, all in kcal/mol
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredEnergies {
    pub complex: f64,
    pub protein: f64,
    pub ligand_bound: f64,
    pub ligand_free: f64,
    pub interaction: f64,
    pub strain: f64,
}

impl From<&EnergyBreakdown> for ScoredEnergies {
    fn from(energies: &EnergyBreakdown) -> Self {
        Self {
            complex: energies.to_kcal(energies.complex),
            protein: energies.to_kcal(energies.protein),
            ligand_bound: energies.to_kcal(energies.ligand_bound),
            ligand_free: energies.to_kcal(energies.ligand_free),
            interaction: energies.interaction(),
            strain: energies.strain(),
        }
    }
}

/// References to published output structures
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputRefs {
    pub optimized_complex_pdb: Option<String>,
    pub split_protein_pdb: Option<String>,
    pub split_ligand_pdb: Option<String>,
    pub optimized_ligand_pdb: Option<String>,
}

/// Result record for one pose
///
/// Energies and status are fixed at construction. Output references and the
/// computation time are filled in afterwards by the runner.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingResult {
    pose_id: String,
    success: bool,
    error_message: String,
    energies: Option<ScoredEnergies>,
    method: Option<EnergyMethod>,
    device: Option<Device>,
    metadata: Map<String, Value>,

    pub outputs: OutputRefs,
    pub computation_time_seconds: Option<f64>,
}

impl RankingResult {
    pub fn success(
        pose_id: &str,
        method: EnergyMethod,
        device: Device,
        energies: ScoredEnergies,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            pose_id: pose_id.to_string(),
            success: true,
            error_message: String::new(),
            energies: Some(energies),
            method: Some(method),
            device: Some(device),
            metadata,
            outputs: OutputRefs::default(),
            computation_time_seconds: None,
        }
    }

    pub fn failure(pose_id: &str, message: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            pose_id: pose_id.to_string(),
            success: false,
            error_message: message.into(),
            energies: None,
            method: None,
            device: None,
            metadata,
            outputs: OutputRefs::default(),
            computation_time_seconds: None,
        }
    }

    /// Record which method and device a failed run was using
    pub fn ran_with(mut self, method: EnergyMethod, device: Option<Device>) -> Self {
        self.method = Some(method);
        self.device = device;
        self
    }

    pub fn pose_id(&self) -> &str {
        &self.pose_id
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn energies(&self) -> Option<&ScoredEnergies> {
        self.energies.as_ref()
    }

    pub fn method(&self) -> Option<EnergyMethod> {
        self.method
    }

    pub fn device(&self) -> Option<Device> {
        self.device
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn interaction_energy(&self) -> Option<f64> {
        self.energies.map(|e| e.interaction)
    }

    pub fn strain_energy(&self) -> Option<f64> {
        self.energies.map(|e| e.strain)
    }

    /// Interaction plus strain, computed on demand
    pub fn total_score(&self) -> Option<f64> {
        self.energies.map(|e| e.interaction + e.strain)
    }

    /// Flat JSON record of every result field
    pub fn to_record(&self) -> Map<String, Value> {
        let energy = |f: fn(&ScoredEnergies) -> f64| self.energies.as_ref().map(f);

        let record = json!({
            "pose_id": self.pose_id,
            "ranking_success": self.success,
            "error_message": self.error_message,
            "interaction_energy": self.interaction_energy(),
            "strain_energy": self.strain_energy(),
            "total_score": self.total_score(),
            "complex_energy": energy(|e| e.complex),
            "protein_energy": energy(|e| e.protein),
            "ligand_bound_energy": energy(|e| e.ligand_bound),
            "ligand_free_energy": energy(|e| e.ligand_free),
            "energy_method": self.method.map(|m| m.to_string()),
            "force_field_device": self.device.map(|d| d.to_string()),
            "optimized_complex_pdb": self.outputs.optimized_complex_pdb,
            "split_protein_pdb": self.outputs.split_protein_pdb,
            "split_ligand_pdb": self.outputs.split_ligand_pdb,
            "optimized_ligand_pdb": self.outputs.optimized_ligand_pdb,
            "computation_time_seconds": self.computation_time_seconds,
            "metadata": self.metadata,
        });

        match record {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

impl Serialize for RankingResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_record().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn energies(interaction: f64, strain: f64) -> ScoredEnergies {
        ScoredEnergies {
            complex: -100.0,
            protein: -80.0,
            ligand_bound: -20.0,
            ligand_free: -22.3,
            interaction,
            strain,
        }
    }

    #[test]
    fn test_total_score_is_interaction_plus_strain() {
        let result = RankingResult::success(
            "p1",
            EnergyMethod::Gfn2,
            Device::Cpu,
            energies(-10.5, 2.3),
            Map::new(),
        );
        assert_approx_eq!(result.total_score().unwrap(), -8.2);

        let record = serde_json::to_value(&result).unwrap();
        assert_approx_eq!(record["total_score"].as_f64().unwrap(), -8.2);
        assert_eq!(record["ranking_success"], json!(true));
        assert_eq!(record["energy_method"], json!("gfn2"));
        assert_eq!(record["force_field_device"], json!("cpu"));
    }

    #[test]
    fn test_failure_record() {
        let mut metadata = Map::new();
        metadata.insert("batch".to_string(), json!("b7"));
        let result = RankingResult::failure("p2", "xtb timed out", metadata)
            .ran_with(EnergyMethod::So3lr, Some(Device::Cuda(0)));

        assert!(!result.is_success());
        assert!(result.total_score().is_none());

        let record = result.to_record();
        assert_eq!(record["error_message"], json!("xtb timed out"));
        assert_eq!(record["total_score"], Value::Null);
        assert_eq!(record["energy_method"], json!("so3lr"));
        assert_eq!(record["metadata"]["batch"], json!("b7"));
    }

    #[test]
    fn test_output_refs_are_serialized() {
        let mut result = RankingResult::success(
            "p1",
            EnergyMethod::Gfn2,
            Device::Cpu,
            energies(-1.0, 0.5),
            Map::new(),
        );
        result.outputs.optimized_complex_pdb = Some("s3://bucket/out/p1_complex_opt.pdb".to_string());
        result.computation_time_seconds = Some(12.5);

        let record = result.to_record();
        assert_eq!(record["optimized_complex_pdb"], json!("s3://bucket/out/p1_complex_opt.pdb"));
        assert_eq!(record["split_protein_pdb"], Value::Null);
        assert_eq!(record["computation_time_seconds"], json!(12.5));
    }
}
