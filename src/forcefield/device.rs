//! Compute devices and GPU detection

use log::{info, warn};
use std::fmt;
use std::process::Command;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use super::process::run_command;

/// Device a calculation runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(n) => write!(f, "cuda:{}", n),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid device '{0}'. Must be 'auto', 'cpu' or 'cuda:N'")]
pub struct InvalidDevice(pub String);

impl FromStr for Device {
    type Err = InvalidDevice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse::<u32>().ok())
                .map(Device::Cuda)
                .ok_or_else(|| InvalidDevice(s.to_string())),
        }
    }
}

/// Requested device before auto-detection is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    Auto,
    Explicit(Device),
}

impl FromStr for DeviceRequest {
    type Err = InvalidDevice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(DeviceRequest::Auto)
        } else {
            s.parse().map(DeviceRequest::Explicit)
        }
    }
}

impl DeviceRequest {
    /// Resolve `auto` by probing for a GPU
    pub fn resolve(&self) -> Device {
        match self {
            DeviceRequest::Explicit(device) => *device,
            DeviceRequest::Auto => detect_gpu(),
        }
    }
}

/// Markers of accelerator failures in engine error text
const DEVICE_FAULT_MARKERS: [&str; 4] = ["CUDA", "CUBLAS", "CUDNN", "GPU"];

/// Whether an error message describes a GPU/accelerator failure
pub fn indicates_device_fault(message: &str) -> bool {
    let upper = message.to_ascii_uppercase();
    DEVICE_FAULT_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// Count the GPUs listed by `nvidia-smi -L` output
fn count_gpus(listing: &str) -> usize {
    listing
        .lines()
        .filter(|line| line.trim_start().starts_with("GPU "))
        .count()
}

/// Probe for a CUDA GPU, falling back to the CPU when none answers
pub fn detect_gpu() -> Device {
    let mut command = Command::new("nvidia-smi");
    command.arg("-L");

    match run_command(command, "nvidia-smi", Some(Duration::from_secs(10))) {
        Ok(output) if output.success() => {
            let count = count_gpus(&output.stdout);
            if count > 0 {
                info!("GPU detected: {} device(s), using cuda:0", count);
                Device::Cuda(0)
            } else {
                info!("No GPU detected, using CPU");
                Device::Cpu
            }
        }
        Ok(output) => {
            warn!("nvidia-smi exited with {}, using CPU", output.status);
            Device::Cpu
        }
        Err(e) => {
            info!("GPU detection unavailable ({}), using CPU", e);
            Device::Cpu
        }
    }
}
