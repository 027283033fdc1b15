//! SO3LR adapter: machine-learned force field driven through a worker process
//!
//! The network itself runs in an external worker (`so3lr-worker` by default)
//! that evaluates one structure per invocation and prints a single JSON line:
//!
//! ```text
//! so3lr-worker energy   --structure <pdb> --lr-cutoff 12 --charge 0 --device cuda:0
//! so3lr-worker optimize --structure <pdb> --output <pdb> --fmax 0.05 --optimizer fire \
//!                       --lr-cutoff 12 --charge 0 --device cpu [--freeze 0,1,2]
//! {"energy": -1234.5678}
//! ```
//!
//! Energies are in eV. A reply of the form `{"error": "..."}` or a non-zero
//! exit is a failure; failures that mention the accelerator are reported as
//! [`ForceFieldError::Device`] so the caller can retry on the CPU.

use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use super::device::indicates_device_fault;
use super::process::run_command;
use super::{
    CalculationOptions, Constraints, Device, EnergyMethod, EnergyOracle, ForceFieldError,
    IndexBase, EV_TO_KCAL,
};

/// Configuration for the SO3LR worker
#[derive(Debug, Clone)]
pub struct So3lrConfig {
    /// Worker executable, resolved through PATH when not absolute
    pub worker: PathBuf,

    /// Force convergence threshold in eV/Angstrom
    pub fmax: f64,

    /// Kill a calculation that runs longer than this
    pub timeout: Option<Duration>,
}

impl Default for So3lrConfig {
    fn default() -> Self {
        Self {
            worker: PathBuf::from("so3lr-worker"),
            fmax: 0.05,
            timeout: None,
        }
    }
}

/// One JSON line printed by the worker
#[derive(Debug, Deserialize)]
struct WorkerReply {
    #[serde(default)]
    energy: Option<f64>,

    #[serde(default)]
    error: Option<String>,
}

/// SO3LR oracle running on a GPU or the CPU
#[derive(Debug, Clone)]
pub struct So3lrAdapter {
    pub config: So3lrConfig,
    device: Device,
}

impl So3lrAdapter {
    pub fn new(config: So3lrConfig, device: Device) -> Self {
        Self { config, device }
    }

    fn program(&self) -> String {
        self.config.worker.display().to_string()
    }

    fn command(&self, action: &str, structure: &Path, options: &CalculationOptions) -> Result<Command, ForceFieldError> {
        let structure = structure.canonicalize()?;
        let work_dir = structure
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut command = Command::new(&self.config.worker);
        command
            .arg(action)
            .arg("--structure")
            .arg(&structure)
            .arg("--lr-cutoff")
            .arg(options.lr_cutoff.to_string())
            .arg("--charge")
            .arg(options.charge.to_string())
            .arg("--device")
            .arg(self.device.to_string())
            .current_dir(work_dir);
        Ok(command)
    }

    fn failure(&self, status: String, detail: String) -> ForceFieldError {
        if !self.device.is_cpu() && indicates_device_fault(&detail) {
            ForceFieldError::Device {
                device: self.device,
                detail,
            }
        } else {
            ForceFieldError::ProcessFailed {
                program: self.program(),
                status,
                detail,
            }
        }
    }

    fn execute(&self, command: Command) -> Result<f64, ForceFieldError> {
        debug!("Running {:?}", command);
        let output = run_command(command, &self.program(), self.config.timeout)?;
        if !output.success() {
            return Err(self.failure(output.status.to_string(), output.failure_detail()));
        }

        match parse_reply(&output.stdout) {
            Some(WorkerReply { error: Some(message), .. }) => {
                Err(self.failure(output.status.to_string(), message))
            }
            Some(WorkerReply { energy: Some(energy), .. }) if energy.is_finite() => Ok(energy),
            _ => Err(ForceFieldError::MissingEnergy(self.program())),
        }
    }
}

impl EnergyOracle for So3lrAdapter {
    fn method(&self) -> EnergyMethod {
        EnergyMethod::So3lr
    }

    fn name(&self) -> &'static str {
        "so3lr"
    }

    fn check_availability(&self) -> Result<String, ForceFieldError> {
        let mut command = Command::new(&self.config.worker);
        command.arg("--version");
        let output = run_command(command, &self.program(), Some(Duration::from_secs(60)))?;
        if !output.success() {
            return Err(ForceFieldError::Unavailable(format!(
                "{} --version failed: {}",
                self.program(),
                output.failure_detail()
            )));
        }
        let version = output.stdout.trim();
        Ok(if version.is_empty() {
            format!("{} available", self.program())
        } else {
            version.to_string()
        })
    }

    fn device(&self) -> Device {
        self.device
    }

    fn set_device(&mut self, device: Device) {
        self.device = device;
    }

    fn index_base(&self) -> IndexBase {
        IndexBase::ZeroBased
    }

    fn kcal_per_unit(&self) -> f64 {
        EV_TO_KCAL
    }

    fn energy(&self, structure: &Path, options: &CalculationOptions) -> Result<f64, ForceFieldError> {
        let command = self.command("energy", structure, options)?;
        self.execute(command)
    }

    fn optimize(
        &self,
        structure: &Path,
        output: &Path,
        constraints: &Constraints,
        options: &CalculationOptions,
    ) -> Result<f64, ForceFieldError> {
        let frozen = match constraints {
            Constraints::None => None,
            Constraints::Frozen(indices) => Some(freeze_list(indices)),
            Constraints::HeavyAtoms | Constraints::Serials(_) => {
                return Err(ForceFieldError::InvalidConstraints {
                    oracle: self.name(),
                    detail: "so3lr freezes 0-indexed positions only".to_string(),
                })
            }
        };

        let mut command = self.command("optimize", structure, options)?;
        command
            .arg("--output")
            .arg(output)
            .arg("--fmax")
            .arg(self.config.fmax.to_string())
            .arg("--optimizer")
            .arg("fire");
        if let Some(frozen) = frozen.filter(|f| !f.is_empty()) {
            command.arg("--freeze").arg(frozen);
        }

        let energy = self.execute(command)?;
        if !output.exists() {
            return Err(ForceFieldError::MissingGeometry(output.display().to_string()));
        }
        Ok(energy)
    }
}

fn freeze_list(indices: &[usize]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse the last JSON line the worker printed
fn parse_reply(stdout: &str) -> Option<WorkerReply> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str(line).ok())
}
