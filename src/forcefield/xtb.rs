//! xTB adapter: GFN2 semi-empirical energies through the `xtb` binary

use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use super::process::{run_command, ProcessOutput};
use super::{
    CalculationOptions, Constraints, Device, EnergyMethod, EnergyOracle, ForceFieldError,
    IndexBase, HARTREE_TO_KCAL,
};

/// Scratch files xtb leaves in its working directory
const SCRATCH_FILES: [&str; 18] = [
    "wbo",
    "charges",
    "xtbopt.log",
    "xtbopt.sdf",
    "xtbout.log",
    "xtb.out",
    "xtbrestart",
    "xtbtopo.mol",
    "xtbtopo.sdf",
    "xtbout.json",
    ".xtboptok",
    "xtblast.pdb",
    "xtbopt.pdb",
    "gfnff_adjacency",
    "gfnff_charges",
    "gfnff_topo",
    "gfnff_lists.json",
    "xtb.inp",
];

/// Element numbers restrained by [`Constraints::HeavyAtoms`]
const HEAVY_ELEMENTS: &str = "6, 7, 8, 9, 15, 16, 17, 53";

/// Configuration for the xtb adapter
#[derive(Debug, Clone)]
pub struct XtbConfig {
    /// xtb executable, resolved through PATH when not absolute
    pub binary: PathBuf,

    /// Implicit solvent model passed to `--alpb`
    pub solvent: String,

    /// Harmonic force constant for restrained atoms (Eh/Bohr^2)
    pub force_constant: f64,

    /// Kill a calculation that runs longer than this
    pub timeout: Option<Duration>,
}

impl Default for XtbConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("xtb"),
            solvent: "water".to_string(),
            force_constant: 2.0,
            timeout: None,
        }
    }
}

/// Which Hamiltonian an xtb call runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    /// GFN-FF force field, used to pre-relax restrained geometries
    ForceField,
    /// GFN2-xTB tight binding
    Gfn2,
}

impl Level {
    fn args(&self) -> &'static [&'static str] {
        match self {
            Level::ForceField => &["--gfnff"],
            Level::Gfn2 => &["--gfn", "2"],
        }
    }
}

/// CPU-only GFN2-xTB oracle
#[derive(Debug, Clone, Default)]
pub struct XtbAdapter {
    pub config: XtbConfig,
}

impl XtbAdapter {
    pub fn new(config: XtbConfig) -> Self {
        Self { config }
    }

    fn program(&self) -> String {
        self.config.binary.display().to_string()
    }

    /// Run one xtb call in the directory holding `structure`
    fn run(
        &self,
        level: Level,
        structure: &Path,
        optimize: bool,
        input: Option<&Path>,
    ) -> Result<ProcessOutput, ForceFieldError> {
        let structure = structure.canonicalize()?;
        let work_dir = parent_dir(&structure);

        let mut command = Command::new(&self.config.binary);
        command
            .args(level.args())
            .arg(&structure)
            .arg("--alpb")
            .arg(&self.config.solvent)
            .current_dir(&work_dir);
        if optimize {
            command.arg("--opt");
        }
        if let Some(input) = input {
            command.arg("--input").arg(input);
        }

        debug!("Running {:?}", command);
        let output = run_command(command, &self.program(), self.config.timeout)?;
        if !output.success() {
            return Err(ForceFieldError::ProcessFailed {
                program: self.program(),
                status: output.status.to_string(),
                detail: output.failure_detail(),
            });
        }
        Ok(output)
    }

    fn energy_from(&self, output: &ProcessOutput) -> Result<f64, ForceFieldError> {
        parse_total_energy(&output.stdout).ok_or_else(|| ForceFieldError::MissingEnergy(self.program()))
    }

    /// Write the `$constrain` block for restrained atoms next to the structure
    fn write_constraint_input(
        &self,
        work_dir: &Path,
        constraints: &Constraints,
    ) -> Result<PathBuf, ForceFieldError> {
        let text = constraint_input(constraints, self.config.force_constant)?;
        let path = work_dir.join("xtb.inp");
        fs::write(&path, text)?;
        Ok(path)
    }

    /// Move xtb's optimized geometry to `output`
    fn collect_geometry(&self, structure: &Path, output: &Path) -> Result<(), ForceFieldError> {
        let extension = structure
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("pdb");
        let produced = parent_dir(structure).join(format!("xtbopt.{}", extension));
        if !produced.exists() {
            return Err(ForceFieldError::MissingGeometry(produced.display().to_string()));
        }
        if produced != output {
            fs::copy(&produced, output)?;
        }
        Ok(())
    }

    fn optimize_in_place(
        &self,
        structure: &Path,
        output: &Path,
        constraints: &Constraints,
    ) -> Result<f64, ForceFieldError> {
        let structure = structure.canonicalize()?;
        let work_dir = parent_dir(&structure);

        if constraints.is_empty() {
            let result = self.run(Level::Gfn2, &structure, true, None)?;
            let energy = self.energy_from(&result)?;
            self.collect_geometry(&structure, output)?;
            return Ok(energy);
        }

        let input = self.write_constraint_input(&work_dir, constraints)?;
        self.run(Level::ForceField, &structure, true, Some(&input))?;
        self.collect_geometry(&structure, output)?;

        let result = self.run(Level::Gfn2, output, false, None)?;
        self.energy_from(&result)
    }
}

impl EnergyOracle for XtbAdapter {
    fn method(&self) -> EnergyMethod {
        EnergyMethod::Gfn2
    }

    fn name(&self) -> &'static str {
        "xtb"
    }

    fn check_availability(&self) -> Result<String, ForceFieldError> {
        let mut command = Command::new(&self.config.binary);
        command.arg("--version");
        let output = run_command(command, &self.program(), Some(Duration::from_secs(30)))?;

        if !output.success() {
            return Err(ForceFieldError::Unavailable(format!(
                "{} --version failed: {}",
                self.program(),
                output.failure_detail()
            )));
        }

        let version = output
            .stdout
            .lines()
            .chain(output.stderr.lines())
            .find(|line| line.contains("version"))
            .map(|line| line.trim().to_string())
            .unwrap_or_else(|| format!("{} available", self.program()));
        Ok(version)
    }

    fn device(&self) -> Device {
        Device::Cpu
    }

    fn set_device(&mut self, device: Device) {
        if !device.is_cpu() {
            warn!("xtb runs on CPU only; ignoring device {}", device);
        }
    }

    fn index_base(&self) -> IndexBase {
        IndexBase::OneBased
    }

    fn kcal_per_unit(&self) -> f64 {
        HARTREE_TO_KCAL
    }

    fn energy(&self, structure: &Path, _options: &CalculationOptions) -> Result<f64, ForceFieldError> {
        let structure = structure.canonicalize()?;
        let result = self.run(Level::Gfn2, &structure, false, None);
        clean_scratch(&parent_dir(&structure), None);
        self.energy_from(&result?)
    }

    fn optimize(
        &self,
        structure: &Path,
        output: &Path,
        constraints: &Constraints,
        _options: &CalculationOptions,
    ) -> Result<f64, ForceFieldError> {
        if let Constraints::Frozen(_) = constraints {
            return Err(ForceFieldError::InvalidConstraints {
                oracle: self.name(),
                detail: "xtb takes 1-indexed serials, not 0-indexed positions".to_string(),
            });
        }

        let result = self.optimize_in_place(structure, output, constraints);
        let work_dir = structure
            .canonicalize()
            .map(|p| parent_dir(&p))
            .unwrap_or_else(|_| parent_dir(structure));
        clean_scratch(&work_dir, Some(output));
        result
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Extract the energy (Hartree) from the first `TOTAL ENERGY` line of xtb output
pub fn parse_total_energy(stdout: &str) -> Option<f64> {
    let line = stdout.lines().find(|line| line.contains("TOTAL ENERGY"))?;
    let (_, rest) = line.split_once("TOTAL ENERGY")?;
    rest.split_whitespace()
        .find_map(|token| token.parse::<f64>().ok())
}

/// Render the `$constrain` block for an xtb `--input` file
pub fn constraint_input(constraints: &Constraints, force_constant: f64) -> Result<String, ForceFieldError> {
    let selection = match constraints {
        Constraints::HeavyAtoms => format!("elements: {}", HEAVY_ELEMENTS),
        Constraints::Serials(serials) => {
            let list: Vec<String> = serials.iter().map(|s| s.to_string()).collect();
            format!("atoms: {}", list.join(","))
        }
        Constraints::None | Constraints::Frozen(_) => {
            return Err(ForceFieldError::InvalidConstraints {
                oracle: "xtb",
                detail: format!("cannot write a constraint block for {:?}", constraints),
            })
        }
    };

    Ok(format!(
        "$constrain\n   {}\n   force constant {}\n$end\n",
        selection, force_constant
    ))
}

/// Remove xtb scratch files from `work_dir`, sparing `keep`
fn clean_scratch(work_dir: &Path, keep: Option<&Path>) {
    for name in SCRATCH_FILES {
        let path = work_dir.join(name);
        if keep.map_or(false, |k| k == path) || !path.exists() {
            continue;
        }
        if let Err(e) = fs::remove_file(&path) {
            debug!("Could not remove xtb scratch file {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE_OUTPUT: &str = "
          -------------------------------------------------
          |                Property Printout                |
          -------------------------------------------------
          | TOTAL ENERGY              -42.123456789012 Eh   |
          | GRADIENT NORM               0.000312345678 Eh/a0 |
          | HOMO-LUMO GAP               4.123456789012 eV   |
          -------------------------------------------------
          | TOTAL ENERGY              -99.0 Eh   |
";

    #[test]
    fn test_parse_total_energy() {
        let energy = parse_total_energy(SAMPLE_OUTPUT).unwrap();
        assert_eq!(energy, -42.123456789012);
    }

    #[test]
    fn test_parse_total_energy_missing_or_garbled() {
        assert!(parse_total_energy("normal termination of xtb").is_none());
        assert!(parse_total_energy("| TOTAL ENERGY    nan-ish Eh |").is_none());
    }

    #[test]
    fn test_constraint_input_heavy_atoms() {
        let text = constraint_input(&Constraints::HeavyAtoms, 2.0).unwrap();
        assert_eq!(
            text,
            "$constrain\n   elements: 6, 7, 8, 9, 15, 16, 17, 53\n   force constant 2\n$end\n"
        );
    }

    #[test]
    fn test_constraint_input_serials() {
        let text = constraint_input(&Constraints::Serials(vec![1, 2, 7]), 2.0).unwrap();
        assert!(text.contains("   atoms: 1,2,7\n"));
        assert!(constraint_input(&Constraints::Frozen(vec![0]), 2.0).is_err());
    }

    #[test]
    fn test_rejects_zero_based_constraints() {
        let adapter = XtbAdapter::default();
        let err = adapter
            .optimize(
                Path::new("complex.pdb"),
                Path::new("complex_opt.pdb"),
                &Constraints::Frozen(vec![0, 1]),
                &CalculationOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ForceFieldError::InvalidConstraints { .. }));
    }

    #[test]
    fn test_clean_scratch_spares_output() {
        let dir = tempdir().unwrap();
        for name in ["wbo", "charges", "xtbopt.pdb", "complex.pdb"] {
            fs::write(dir.path().join(name), "x").unwrap();
        }
        let keep = dir.path().join("xtbopt.pdb");
        clean_scratch(dir.path(), Some(&keep));

        assert!(!dir.path().join("wbo").exists());
        assert!(!dir.path().join("charges").exists());
        assert!(keep.exists());
        assert!(dir.path().join("complex.pdb").exists());
    }

    #[test]
    fn test_adapter_contract() {
        let mut adapter = XtbAdapter::default();
        adapter.set_device(Device::Cuda(0));
        assert_eq!(adapter.device(), Device::Cpu);
        assert_eq!(adapter.index_base(), IndexBase::OneBased);
        assert_eq!(adapter.kcal_per_unit(), HARTREE_TO_KCAL);
        assert_eq!(adapter.method(), EnergyMethod::Gfn2);
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let adapter = XtbAdapter::new(XtbConfig {
            binary: PathBuf::from("xtb-binary-that-does-not-exist"),
            ..XtbConfig::default()
        });
        assert!(matches!(
            adapter.check_availability(),
            Err(ForceFieldError::Unavailable(_))
        ));
    }

    /// GNU `false --version` prints a "GPL version 3" banner and still exits 1
    #[cfg(unix)]
    #[test]
    fn test_failed_version_check_is_unavailable() {
        let adapter = XtbAdapter::new(XtbConfig {
            binary: PathBuf::from("false"),
            ..XtbConfig::default()
        });
        match adapter.check_availability() {
            Err(ForceFieldError::Unavailable(message)) => assert!(message.contains("--version failed")),
            other => panic!("expected unavailable, got {:?}", other),
        }
    }
}
