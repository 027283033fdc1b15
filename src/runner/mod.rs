//! Batch orchestration: one isolated decomposition per pose, results in input order

use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

use crate::config::{extract_param_values, parse_log_level, RankingParams, Settings};
use crate::convert::{ConversionError, StructureConverter, UnsupportedConverter};
use crate::decomposition::{decompose, DecompositionError, DecompositionInput, DecompositionOutput, DecompositionParams};
use crate::fallback::DeviceFallback;
use crate::forcefield::device::DeviceRequest;
use crate::forcefield::so3lr::So3lrAdapter;
use crate::forcefield::xtb::XtbAdapter;
use crate::forcefield::{Device, EnergyMethod, EnergyOracle};
use crate::model::{OutputRefs, Pose, PoseBatch, PoseInputs, RankingResult, ScoredEnergies, ValidationError};
use crate::storage::{publish_outputs, resolve_input, Destination, LocalObjectStore, ObjectStore, StorageError};

const BANNER: &str = "================================================================================";

/// Why a pose could not be ranked
#[derive(Error, Debug)]
pub enum RankError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{method} force field unavailable: {message}")]
    Unavailable { method: EnergyMethod, message: String },

    #[error("{0}")]
    Stage(DecompositionError),

    #[error("Device failure: {0}")]
    Device(DecompositionError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("Input error: {0}")]
    Storage(#[from] StorageError),

    #[error("Working directory error: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("Unexpected failure: {0}")]
    Unexpected(String),
}

impl From<DecompositionError> for RankError {
    fn from(error: DecompositionError) -> Self {
        if error.is_device_fault() {
            RankError::Device(error)
        } else {
            RankError::Stage(error)
        }
    }
}

/// Builds an oracle for a method on a device
pub type OracleFactory = Box<dyn Fn(EnergyMethod, Device) -> Box<dyn EnergyOracle>>;

/// One lazily created oracle per method, kept for the rest of the batch
pub struct OracleRegistry {
    factory: OracleFactory,
    device_request: DeviceRequest,
    oracles: HashMap<EnergyMethod, Box<dyn EnergyOracle>>,
    available: HashSet<EnergyMethod>,
}

impl OracleRegistry {
    pub fn new(device_request: DeviceRequest, factory: OracleFactory) -> Self {
        Self {
            factory,
            device_request,
            oracles: HashMap::new(),
            available: HashSet::new(),
        }
    }

    /// Registry of the xtb and SO3LR adapters configured from `settings`
    pub fn from_settings(settings: &Settings, device_request: DeviceRequest) -> Self {
        let xtb = settings.xtb_config();
        let so3lr = settings.so3lr_config();
        Self::new(
            device_request,
            Box::new(move |method: EnergyMethod, device: Device| -> Box<dyn EnergyOracle> {
                match method {
                    EnergyMethod::Gfn2 => Box::new(XtbAdapter::new(xtb.clone())),
                    EnergyMethod::So3lr => Box::new(So3lrAdapter::new(so3lr.clone(), device)),
                }
            }),
        )
    }

    /// Oracle for `method`, created on first use
    pub fn get(&mut self, method: EnergyMethod) -> &mut dyn EnergyOracle {
        let factory = &self.factory;
        let request = self.device_request;
        let oracle = self.oracles.entry(method).or_insert_with(|| {
            let device = match method {
                EnergyMethod::Gfn2 => Device::Cpu,
                EnergyMethod::So3lr => request.resolve(),
            };
            info!("Initializing {} force field on {}", method, device);
            factory(method, device)
        });
        oracle.as_mut()
    }

    /// Device of an already created oracle
    pub fn device(&self, method: EnergyMethod) -> Option<Device> {
        self.oracles.get(&method).map(|o| o.device())
    }

    /// Check availability once per method; failures are re-checked on the next pose
    fn ensure_available(&mut self, method: EnergyMethod) -> Result<(), RankError> {
        if self.available.contains(&method) {
            return Ok(());
        }
        match self.get(method).check_availability() {
            Ok(version) => {
                info!("{} available: {}", method, version);
                self.available.insert(method);
                Ok(())
            }
            Err(e) => Err(RankError::Unavailable {
                method,
                message: e.to_string(),
            }),
        }
    }
}

/// Replace characters that do not belong in a directory name
fn sanitize(pose_id: &str) -> String {
    pose_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

fn local_refs(output: &DecompositionOutput) -> OutputRefs {
    let show = |p: &PathBuf| p.display().to_string();
    OutputRefs {
        optimized_complex_pdb: output.complex_opt.as_ref().map(show),
        split_protein_pdb: Some(show(&output.protein)),
        split_ligand_pdb: Some(show(&output.ligand_bound)),
        optimized_ligand_pdb: output.ligand_opt.as_ref().map(show),
    }
}

/// Ranks poses one at a time, each in its own working directory
pub struct RankingRunner {
    registry: OracleRegistry,
    store: Box<dyn ObjectStore>,
    converter: Box<dyn StructureConverter>,
    destination: Option<Destination>,
    params: DecompositionParams,
    gpu_fallback: bool,
    scratch_root: Option<PathBuf>,
}

impl RankingRunner {
    pub fn new(registry: OracleRegistry, store: Box<dyn ObjectStore>, params: DecompositionParams) -> Self {
        Self {
            registry,
            store,
            converter: Box::new(UnsupportedConverter),
            destination: None,
            params,
            gpu_fallback: true,
            scratch_root: None,
        }
    }

    /// Publish outputs of successful poses here
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_converter(mut self, converter: Box<dyn StructureConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_gpu_fallback(mut self, enabled: bool) -> Self {
        self.gpu_fallback = enabled;
        self
    }

    /// Create working directories under `root` instead of the system temp dir
    pub fn with_scratch_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn registry(&self) -> &OracleRegistry {
        &self.registry
    }

    fn create_workspace(&self, pose_id: &str) -> Result<tempfile::TempDir, std::io::Error> {
        let prefix = format!("tpose_{}_", sanitize(pose_id));
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        match &self.scratch_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }

    fn resolve_inputs(&self, pose: &Pose, work_dir: &Path) -> Result<DecompositionInput, RankError> {
        let inputs_dir = work_dir.join("inputs");
        fs::create_dir_all(&inputs_dir)?;

        match pose.inputs()? {
            PoseInputs::Separate { protein, ligand } => Ok(DecompositionInput {
                protein: resolve_input(self.store.as_ref(), &protein, &inputs_dir)?,
                ligand: resolve_input(self.store.as_ref(), &ligand, &inputs_dir)?,
            }),
            PoseInputs::Combined { structure } => {
                let structure = resolve_input(self.store.as_ref(), &structure, &inputs_dir)?;
                let (protein, ligand) = self.converter.convert(&structure, &inputs_dir)?;
                Ok(DecompositionInput { protein, ligand })
            }
        }
    }

    fn rank_in(&mut self, pose: &Pose, method: EnergyMethod, work_dir: &Path) -> Result<RankingResult, RankError> {
        let pose_id = pose.pose_id.as_str();
        let input = self.resolve_inputs(pose, work_dir)?;

        self.registry.ensure_available(method)?;

        let mut fallback = if method == EnergyMethod::So3lr && self.gpu_fallback {
            DeviceFallback::new()
        } else {
            DeviceFallback::disabled()
        };

        let params = &self.params;
        let oracle = self.registry.get(method);
        info!("[{}] Ranking with {} on {}", pose_id, method, oracle.device());
        let output = fallback.run(oracle, work_dir, pose_id, |oracle, attempt_dir| {
            decompose(oracle, &input, params, attempt_dir, pose_id)
        })?;

        let mut result = RankingResult::success(
            pose_id,
            method,
            oracle.device(),
            ScoredEnergies::from(&output.energies),
            pose.metadata(),
        );

        if let Some(destination) = &self.destination {
            result.outputs = publish_outputs(
                self.store.as_ref(),
                destination,
                pose_id,
                pose.structure_path.as_deref(),
                &local_refs(&output),
            );
        } else {
            debug!("[{}] No output destination; structures are discarded", pose_id);
        }

        Ok(result)
    }

    fn rank_in_workspace(&mut self, pose: &Pose, method: EnergyMethod) -> Result<RankingResult, RankError> {
        let workspace = self.create_workspace(&pose.pose_id)?;
        debug!("[{}] Working directory {}", pose.pose_id, workspace.path().display());

        let outcome = self.rank_in(pose, method, workspace.path());

        let path = workspace.path().to_path_buf();
        if let Err(e) = workspace.close() {
            warn!(
                "[{}] Failed to remove working directory {}: {}",
                pose.pose_id,
                path.display(),
                e
            );
        }
        outcome
    }

    /// Rank one pose; never fails, never panics
    pub fn rank_single_pose(&mut self, pose: &Pose, method: EnergyMethod) -> RankingResult {
        let start = Instant::now();
        let pose_id = pose.pose_id.clone();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.rank_in_workspace(pose, method)))
            .unwrap_or_else(|payload| Err(RankError::Unexpected(panic_message(payload.as_ref()))));

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                error!("[{}] Ranking failed: {}", pose_id, e);
                RankingResult::failure(&pose_id, e.to_string(), pose.metadata())
                    .ran_with(method, self.registry.device(method))
            }
        };

        let elapsed = start.elapsed().as_secs_f64();
        result.computation_time_seconds = Some(elapsed);
        if result.is_success() {
            info!("[{}] Ranking completed in {:.2}s", pose_id, elapsed);
        }
        result
    }

    /// Rank every pose of a validated batch in input order
    pub fn rank_batch(&mut self, batch: &PoseBatch) -> Vec<RankingResult> {
        info!("Ranking batch of {} poses", batch.len());
        let results: Vec<RankingResult> = batch
            .poses()
            .iter()
            .enumerate()
            .map(|(i, pose)| {
                let method = batch.effective_method(pose);
                info!("Pose {}/{}: {} ({})", i + 1, batch.len(), pose.pose_id, method);
                self.rank_single_pose(pose, method)
            })
            .collect();

        let successful = results.iter().filter(|r| r.is_success()).count();
        info!("Batch finished: {}/{} poses ranked", successful, results.len());
        results
    }

    /// Validate and rank raw poses; an invalid batch fails every pose uniformly
    pub fn rank_poses(&mut self, poses: Vec<Pose>, default_method: Option<EnergyMethod>) -> Vec<RankingResult> {
        match PoseBatch::new(poses.clone(), default_method) {
            Ok(batch) => self.rank_batch(&batch),
            Err(e) => {
                error!("Batch validation failed: {}", e);
                poses
                    .iter()
                    .map(|pose| RankingResult::failure(&pose.pose_id, e.to_string(), pose.metadata()))
                    .collect()
            }
        }
    }
}

fn record_pose_id(record: &Value) -> String {
    match record.get("pose_id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn record_metadata(record: &Value) -> Map<String, Value> {
    match record.get("metadata") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

/// Overwrite result keys onto the original record
fn merge(record: Value, result: &RankingResult) -> Value {
    let mut merged = match record {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (key, value) in result.to_record() {
        merged.insert(key, value);
    }
    Value::Object(merged)
}

fn uniform_failure(records: Vec<Value>, message: &str) -> Vec<Value> {
    error!("{}", message);
    records
        .into_iter()
        .map(|record| {
            let failure = RankingResult::failure(&record_pose_id(&record), message, record_metadata(&record));
            merge(record, &failure)
        })
        .collect()
}

fn log_summary(results: &[RankingResult]) {
    let successful: Vec<&RankingResult> = results.iter().filter(|r| r.is_success()).collect();
    info!("{}", BANNER);
    info!("POSE RANKING - Completed");
    info!("Successful: {}/{}", successful.len(), results.len());
    info!("Failed: {}/{}", results.len() - successful.len(), results.len());

    if !successful.is_empty() {
        let count = successful.len() as f64;
        let avg_time = successful
            .iter()
            .filter_map(|r| r.computation_time_seconds)
            .sum::<f64>()
            / count;
        info!("Average computation time: {:.2}s per pose", avg_time);

        let avg_interaction = successful
            .iter()
            .filter_map(|r| r.interaction_energy())
            .sum::<f64>()
            / count;
        info!("Average interaction energy: {:.2} kcal/mol", avg_interaction);
    }
    info!("{}", BANNER);
}

/// Rank raw records with an already configured runner and merge the results in
pub fn rank_records_with(runner: &mut RankingRunner, records: Vec<Value>, default_method: EnergyMethod) -> Vec<Value> {
    let batch = match PoseBatch::from_records(&records, Some(default_method)) {
        Ok(batch) => batch,
        Err(e) => {
            error!("Batch validation failed: {}", e);
            return uniform_failure(records, "Invalid pose data in batch");
        }
    };
    info!("Pose batch validation passed ({} poses)", batch.len());

    let results = runner.rank_batch(&batch);
    log_summary(&results);

    records
        .into_iter()
        .zip(results.iter())
        .map(|(record, result)| merge(record, result))
        .collect()
}

/// Entry point: rank pose records under a raw parameter map
///
/// Parameters may be wrapped as `{"value": x}`. A missing bucket or an invalid
/// global method, device or parameter fails every record the same way.
pub fn rank_records(records: Vec<Value>, raw_params: &Map<String, Value>, settings: &Settings) -> Vec<Value> {
    let params = extract_param_values(raw_params);

    info!("{}", BANNER);
    info!("POSE RANKING - Starting");
    info!("Received {} poses to process", records.len());
    info!("Parameters: {:?}", params.keys().collect::<Vec<_>>());
    info!("{}", BANNER);

    let ranking = match RankingParams::from_map(&params) {
        Ok(ranking) => ranking,
        Err(e) => return uniform_failure(records, &e.to_string()),
    };

    if let Some(level) = ranking.log_level.as_deref() {
        match parse_log_level(level) {
            Ok(level) => log::set_max_level(level),
            Err(e) => warn!("{}", e),
        }
    }

    let bucket = match ranking.s3_bucket.clone().or_else(|| settings.s3_bucket.clone()) {
        Some(bucket) if !bucket.trim().is_empty() => bucket,
        _ => return uniform_failure(records, "Missing required parameter: s3_bucket"),
    };
    let folder = ranking
        .s3_output_folder
        .clone()
        .or_else(|| settings.s3_output_folder.clone());
    let destination = Destination::new(&bucket, folder.as_deref());
    info!("Output destination: s3://{}/{}", destination.bucket, destination.folder);

    let method = match ranking.method() {
        Ok(Some(method)) => method,
        Ok(None) => match settings.energy_method.parse::<EnergyMethod>() {
            Ok(method) => method,
            Err(e) => return uniform_failure(records, &e.to_string()),
        },
        Err(e) => return uniform_failure(records, &e.to_string()),
    };
    info!("Global energy method: {}", method);

    let device_request = match ranking.device_request() {
        Ok(request) => request,
        Err(e) => return uniform_failure(records, &e.to_string()),
    };

    let registry = OracleRegistry::from_settings(settings, device_request);
    let mut runner = RankingRunner::new(
        registry,
        Box::new(LocalObjectStore::new(settings.storage_root.clone())),
        ranking.decomposition_params(),
    )
    .with_destination(destination)
    .with_gpu_fallback(settings.enable_gpu_fallback);

    rank_records_with(&mut runner, records, method)
}
