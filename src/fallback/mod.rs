//! GPU to CPU failover for accelerated oracles
//!
//! A run starts on the oracle's current device. If it fails with an accelerator
//! fault while that device is not the CPU, the oracle is moved to the CPU and the
//! whole run repeats once, in a fresh attempt directory. The retry budget is a
//! single attempt; a second failure of any kind is final.

use log::warn;
use std::fs;
use std::path::{Path, PathBuf};

use crate::decomposition::{DecompositionError, Stage};
use crate::forcefield::{Device, EnergyOracle};

/// Bounded retry state for one pose
#[derive(Debug, Clone)]
pub struct DeviceFallback {
    retries_remaining: u32,
    attempts: u32,
}

impl Default for DeviceFallback {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceFallback {
    /// One CPU retry available
    pub fn new() -> Self {
        Self {
            retries_remaining: 1,
            attempts: 0,
        }
    }

    /// No retries: the first failure is final
    pub fn disabled() -> Self {
        Self {
            retries_remaining: 0,
            attempts: 0,
        }
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    /// Number of attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn should_retry(&self, device: Device, error: &DecompositionError) -> bool {
        self.retries_remaining > 0 && !device.is_cpu() && error.is_device_fault()
    }

    fn attempt_dir(&self, work_dir: &Path) -> Result<PathBuf, DecompositionError> {
        let dir = work_dir.join(format!("run-{}", self.attempts));
        fs::create_dir_all(&dir).map_err(|e| DecompositionError::new(Stage::Preparing, e))?;
        Ok(dir)
    }

    /// Run `attempt` against `oracle`, falling back to the CPU once on a device fault
    ///
    /// Each attempt receives its own subdirectory of `work_dir`. The oracle keeps
    /// the CPU device after a fallback.
    pub fn run<T, F>(
        &mut self,
        oracle: &mut dyn EnergyOracle,
        work_dir: &Path,
        pose_id: &str,
        mut attempt: F,
    ) -> Result<T, DecompositionError>
    where
        F: FnMut(&dyn EnergyOracle, &Path) -> Result<T, DecompositionError>,
    {
        loop {
            self.attempts += 1;
            let dir = self.attempt_dir(work_dir)?;

            match attempt(&*oracle, &dir) {
                Ok(value) => return Ok(value),
                Err(error) if self.should_retry(oracle.device(), &error) => {
                    warn!(
                        "[{}] {} failed on {}: {}. Retrying on CPU",
                        pose_id,
                        oracle.name(),
                        oracle.device(),
                        error
                    );
                    self.retries_remaining -= 1;
                    oracle.set_device(Device::Cpu);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposition::StageError;
    use crate::forcefield::{
        CalculationOptions, Constraints, EnergyMethod, ForceFieldError, IndexBase,
    };
    use tempfile::tempdir;

    struct StubOracle {
        device: Device,
    }

    impl EnergyOracle for StubOracle {
        fn method(&self) -> EnergyMethod {
            EnergyMethod::So3lr
        }
        fn name(&self) -> &'static str {
            "stub"
        }
        fn check_availability(&self) -> Result<String, ForceFieldError> {
            Ok("stub".to_string())
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
            1.0
        }
        fn energy(&self, _: &Path, _: &CalculationOptions) -> Result<f64, ForceFieldError> {
            Ok(0.0)
        }
        fn optimize(
            &self,
            _: &Path,
            _: &Path,
            _: &Constraints,
            _: &CalculationOptions,
        ) -> Result<f64, ForceFieldError> {
            Ok(0.0)
        }
    }

    fn device_fault(device: Device) -> DecompositionError {
        DecompositionError::new(
            Stage::ComplexEnergy,
            ForceFieldError::Device {
                device,
                detail: "CUDA error: out of memory".to_string(),
            },
        )
    }

    #[test]
    fn test_single_cpu_retry_after_device_fault() {
        let dir = tempdir().unwrap();
        let mut oracle = StubOracle { device: Device::Cuda(0) };
        let mut fallback = DeviceFallback::new();
        let mut seen = Vec::new();

        let result = fallback.run(&mut oracle, dir.path(), "p1", |oracle, attempt_dir| {
            seen.push((oracle.device(), attempt_dir.to_path_buf()));
            if oracle.device().is_cpu() {
                Ok(42)
            } else {
                Err(device_fault(oracle.device()))
            }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, Device::Cuda(0));
        assert_eq!(seen[1].0, Device::Cpu);
        assert_ne!(seen[0].1, seen[1].1);
        assert_eq!(oracle.device, Device::Cpu);
        assert_eq!(fallback.retries_remaining(), 0);
    }

    #[test]
    fn test_second_failure_is_final() {
        let dir = tempdir().unwrap();
        let mut oracle = StubOracle { device: Device::Cuda(0) };
        let mut fallback = DeviceFallback::new();
        let mut calls = 0;

        let result: Result<(), _> = fallback.run(&mut oracle, dir.path(), "p1", |_, _| {
            calls += 1;
            Err(device_fault(Device::Cuda(0)))
        });

        assert!(result.is_err());
        assert_eq!(calls, 2);
        assert_eq!(fallback.attempts(), 2);
    }

    #[test]
    fn test_no_retry_on_cpu_or_chemistry_failure() {
        let dir = tempdir().unwrap();
        let mut oracle = StubOracle { device: Device::Cpu };
        let mut fallback = DeviceFallback::new();
        let mut calls = 0;
        let _: Result<(), _> = fallback.run(&mut oracle, dir.path(), "p1", |_, _| {
            calls += 1;
            Err(device_fault(Device::Cpu))
        });
        assert_eq!(calls, 1);

        let mut oracle = StubOracle { device: Device::Cuda(0) };
        let mut fallback = DeviceFallback::new();
        let mut calls = 0;
        let _: Result<(), _> = fallback.run(&mut oracle, dir.path(), "p2", |_, _| {
            calls += 1;
            Err(DecompositionError::new(
                Stage::ProteinEnergy,
                StageError::NonFiniteEnergy("protein"),
            ))
        });
        assert_eq!(calls, 1);
        assert_eq!(oracle.device, Device::Cuda(0));
    }

    #[test]
    fn test_disabled_never_retries() {
        let dir = tempdir().unwrap();
        let mut oracle = StubOracle { device: Device::Cuda(0) };
        let mut fallback = DeviceFallback::disabled();
        let mut calls = 0;
        let _: Result<(), _> = fallback.run(&mut oracle, dir.path(), "p1", |_, _| {
            calls += 1;
            Err(device_fault(Device::Cuda(0)))
        });
        assert_eq!(calls, 1);
    }
}
