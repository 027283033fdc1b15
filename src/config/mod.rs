//! Service settings and per-batch ranking parameters

use log::LevelFilter;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::chop::DEFAULT_DISTANCE_CUTOFF;
use crate::decomposition::DecompositionParams;
use crate::forcefield::device::{DeviceRequest, InvalidDevice};
use crate::forcefield::so3lr::So3lrConfig;
use crate::forcefield::xtb::XtbConfig;
use crate::forcefield::{EnergyMethod, UnknownMethod};
use crate::partition::LIGAND_LABEL;

/// Errors in settings or parameters
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error(transparent)]
    InvalidMethod(#[from] UnknownMethod),

    #[error(transparent)]
    InvalidDevice(#[from] InvalidDevice),

    #[error("Invalid log level '{0}'")]
    InvalidLogLevel(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(#[from] serde_json::Error),
}

/// Parse a log level, accepting the WARNING/CRITICAL spellings as well
pub fn parse_log_level(level: &str) -> Result<LevelFilter, ConfigError> {
    match level.trim().to_ascii_uppercase().as_str() {
        "WARNING" => Ok(LevelFilter::Warn),
        "CRITICAL" => Ok(LevelFilter::Error),
        other => LevelFilter::from_str(other).map_err(|_| ConfigError::InvalidLogLevel(level.to_string())),
    }
}

/// Process-wide settings read from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub s3_bucket: Option<String>,
    pub s3_output_folder: Option<String>,
    pub energy_method: String,
    pub log_level: String,

    /// Root directory of the file-system object store
    pub storage_root: PathBuf,

    pub xtb_binary: PathBuf,
    pub xtb_timeout: Option<Duration>,
    pub so3lr_worker: PathBuf,
    pub so3lr_timeout: Option<Duration>,

    /// Retry on the CPU after an accelerator fault
    pub enable_gpu_fallback: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            s3_bucket: None,
            s3_output_folder: None,
            energy_method: EnergyMethod::Gfn2.to_string(),
            log_level: "INFO".to_string(),
            storage_root: PathBuf::from("object-store"),
            xtb_binary: PathBuf::from("xtb"),
            xtb_timeout: None,
            so3lr_worker: PathBuf::from("so3lr-worker"),
            so3lr_timeout: None,
            enable_gpu_fallback: true,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Settings::default();

        let timeout = |key: &str| -> Result<Option<Duration>, ConfigError> {
            get(key)
                .map(|v| {
                    v.parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|_| ConfigError::InvalidValue {
                            key: key.to_string(),
                            value: v.clone(),
                        })
                })
                .transpose()
        };

        let enable_gpu_fallback = match get("POSE_RANK_GPU_FALLBACK") {
            None => defaults.enable_gpu_fallback,
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "POSE_RANK_GPU_FALLBACK".to_string(),
                        value: v,
                    })
                }
            },
        };

        Ok(Self {
            s3_bucket: get("S3_BUCKET"),
            s3_output_folder: get("S3_OUTPUT_FOLDER"),
            energy_method: get("ENERGY_METHOD").unwrap_or(defaults.energy_method),
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
            storage_root: get("POSE_RANK_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            xtb_binary: get("XTB_BINARY").map(PathBuf::from).unwrap_or(defaults.xtb_binary),
            xtb_timeout: timeout("XTB_TIMEOUT_SECS")?,
            so3lr_worker: get("SO3LR_WORKER")
                .map(PathBuf::from)
                .unwrap_or(defaults.so3lr_worker),
            so3lr_timeout: timeout("SO3LR_TIMEOUT_SECS")?,
            enable_gpu_fallback,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.energy_method.parse::<EnergyMethod>()?;
        parse_log_level(&self.log_level)?;
        Ok(())
    }

    pub fn xtb_config(&self) -> XtbConfig {
        XtbConfig {
            binary: self.xtb_binary.clone(),
            timeout: self.xtb_timeout,
            ..XtbConfig::default()
        }
    }

    pub fn so3lr_config(&self) -> So3lrConfig {
        So3lrConfig {
            worker: self.so3lr_worker.clone(),
            timeout: self.so3lr_timeout,
            ..So3lrConfig::default()
        }
    }
}

/// Unwrap `{"value": x, "description": ...}` parameter entries to `x`
pub fn extract_param_values(params: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::Object(inner) if inner.contains_key("value") => inner["value"].clone(),
                other => other.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_true() -> bool {
    true
}

fn default_distance_cutoff() -> f64 {
    DEFAULT_DISTANCE_CUTOFF
}

/// Older parameter names and the keys they stand for
const LEGACY_KEYS: &[(&str, &str)] = &[
    ("so3lr_use_chopping", "use_chopping"),
    ("so3lr_lr_cutoff", "lr_cutoff"),
];

/// Parameters of one ranking batch
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RankingParams {
    #[serde(default)]
    pub energy_method: Option<String>,

    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_true")]
    pub use_chopping: bool,

    #[serde(default)]
    pub optimize_complex: Option<bool>,

    #[serde(default)]
    pub optimize_ligand: Option<bool>,

    /// Legacy switch covering both optimizations
    #[serde(default)]
    pub so3lr_optimize: Option<bool>,

    #[serde(default = "default_distance_cutoff")]
    pub distance_cutoff: f64,

    #[serde(default)]
    pub lr_cutoff: Option<f64>,

    #[serde(default)]
    pub expand_chain_breaks: bool,

    #[serde(default)]
    pub charge: f64,

    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub s3_bucket: Option<String>,

    #[serde(default)]
    pub s3_output_folder: Option<String>,
}

impl Default for RankingParams {
    fn default() -> Self {
        Self {
            energy_method: None,
            device: default_device(),
            use_chopping: true,
            optimize_complex: None,
            optimize_ligand: None,
            so3lr_optimize: None,
            distance_cutoff: DEFAULT_DISTANCE_CUTOFF,
            lr_cutoff: None,
            expand_chain_breaks: false,
            charge: 0.0,
            log_level: None,
            s3_bucket: None,
            s3_output_folder: None,
        }
    }
}

impl RankingParams {
    /// Parse an already unwrapped parameter map; nulls count as absent
    pub fn from_map(params: &Map<String, Value>) -> Result<Self, ConfigError> {
        let mut present: Map<String, Value> = params
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        // Legacy names fill in only when the canonical key is absent
        for (legacy, canonical) in LEGACY_KEYS {
            if let Some(value) = present.remove(*legacy) {
                present.entry(canonical.to_string()).or_insert(value);
            }
        }
        Ok(RankingParams::deserialize(Value::Object(present))?)
    }

    /// Batch-wide method, if one was given
    pub fn method(&self) -> Result<Option<EnergyMethod>, ConfigError> {
        match self.energy_method.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(name) => Ok(Some(name.parse()?)),
        }
    }

    pub fn device_request(&self) -> Result<DeviceRequest, ConfigError> {
        Ok(self.device.parse()?)
    }

    pub fn decomposition_params(&self) -> DecompositionParams {
        let both = self.so3lr_optimize.unwrap_or(true);
        DecompositionParams {
            use_chopping: self.use_chopping,
            optimize_complex: self.optimize_complex.unwrap_or(both),
            optimize_ligand: self.optimize_ligand.unwrap_or(both),
            distance_cutoff: self.distance_cutoff,
            lr_cutoff: self.lr_cutoff,
            expand_chain_breaks: self.expand_chain_breaks,
            ligand_label: LIGAND_LABEL.to_string(),
            charge: self.charge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_extract_param_values() {
        let raw = as_map(json!({
            "energy_method": {"value": "so3lr", "description": "force field"},
            "distance_cutoff": 6.5,
            "metadata": {"note": "kept as is"}
        }));
        let clean = extract_param_values(&raw);
        assert_eq!(clean["energy_method"], json!("so3lr"));
        assert_eq!(clean["distance_cutoff"], json!(6.5));
        assert_eq!(clean["metadata"], json!({"note": "kept as is"}));
    }

    #[test]
    fn test_ranking_params_defaults() {
        let params = RankingParams::from_map(&Map::new()).unwrap();
        assert_eq!(params, RankingParams::default());

        let decomposition = params.decomposition_params();
        assert!(decomposition.use_chopping);
        assert!(decomposition.optimize_complex);
        assert!(decomposition.optimize_ligand);
        assert_eq!(decomposition.distance_cutoff, 5.0);
        assert_eq!(decomposition.effective_lr_cutoff(), 12.0);
        assert_eq!(params.device_request().unwrap(), DeviceRequest::Auto);
    }

    #[test]
    fn test_ranking_params_legacy_names() {
        let params = RankingParams::from_map(&as_map(json!({
            "energy_method": "so3lr",
            "so3lr_use_chopping": false,
            "so3lr_optimize": false,
            "so3lr_lr_cutoff": 18.0,
            "device": null
        })))
        .unwrap();

        assert_eq!(params.method().unwrap(), Some(EnergyMethod::So3lr));
        assert_eq!(params.device, "auto");
        let decomposition = params.decomposition_params();
        assert!(!decomposition.use_chopping);
        assert!(!decomposition.optimize_complex);
        assert!(!decomposition.optimize_ligand);
        assert_eq!(decomposition.effective_lr_cutoff(), 18.0);
    }

    #[test]
    fn test_canonical_name_wins_over_legacy() {
        let params = RankingParams::from_map(&as_map(json!({
            "use_chopping": false,
            "so3lr_use_chopping": true,
            "lr_cutoff": 14.0,
            "so3lr_lr_cutoff": 18.0
        })))
        .unwrap();
        assert!(!params.use_chopping);
        assert_eq!(params.lr_cutoff, Some(14.0));

        let params = RankingParams::from_map(&as_map(json!({
            "use_chopping": false,
            "so3lr_use_chopping": false
        })))
        .unwrap();
        assert!(!params.use_chopping);

        // A null canonical value defers to the legacy one
        let params = RankingParams::from_map(&as_map(json!({
            "lr_cutoff": null,
            "so3lr_lr_cutoff": 16.0
        })))
        .unwrap();
        assert_eq!(params.lr_cutoff, Some(16.0));
    }

    #[test]
    fn test_invalid_method_and_device() {
        let params = RankingParams::from_map(&as_map(json!({
            "energy_method": "dft",
            "device": "tpu"
        })))
        .unwrap();
        assert!(params.method().is_err());
        assert!(params.device_request().is_err());
    }

    #[test]
    fn test_settings_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("S3_BUCKET", "poses"),
            ("XTB_TIMEOUT_SECS", "600"),
            ("POSE_RANK_GPU_FALLBACK", "off"),
            ("LOG_LEVEL", "WARNING"),
        ]
        .into_iter()
        .collect();
        let settings = Settings::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(settings.s3_bucket.as_deref(), Some("poses"));
        assert_eq!(settings.xtb_timeout, Some(Duration::from_secs(600)));
        assert!(!settings.enable_gpu_fallback);
        assert_eq!(settings.energy_method, "gfn2");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_rejects_bad_values() {
        let bad_timeout = Settings::from_lookup(|k| (k == "SO3LR_TIMEOUT_SECS").then(|| "soon".to_string()));
        assert!(matches!(bad_timeout, Err(ConfigError::InvalidValue { .. })));

        let settings = Settings {
            energy_method: "ani".to_string(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), LevelFilter::Debug);
        assert_eq!(parse_log_level("CRITICAL").unwrap(), LevelFilter::Error);
        assert!(parse_log_level("chatty").is_err());
    }
}
