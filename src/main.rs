//! Main executable for pose-rank

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use pose_rank::chop::{chop, DEFAULT_DISTANCE_CUTOFF};
use pose_rank::config::{parse_log_level, Settings};
use pose_rank::forcefield::device::DeviceRequest;
use pose_rank::forcefield::so3lr::So3lrAdapter;
use pose_rank::forcefield::xtb::XtbAdapter;
use pose_rank::forcefield::{EnergyMethod, EnergyOracle};
use pose_rank::io::{read_structure, write_pdb};
use pose_rank::partition::LIGAND_LABEL;
use pose_rank::runner::rank_records;

/// Command-line arguments for the application
#[derive(Parser, Debug)]
#[clap(
    name = "pose-rank",
    version = pose_rank::VERSION,
    about = "Rank protein-ligand poses by force-field interaction and strain energies"
)]
struct Cli {
    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[clap(long, global = true)]
    log_level: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rank a batch of pose records
    Rank {
        /// JSON file holding an array of pose records
        #[clap(long, value_parser)]
        poses: PathBuf,

        /// JSON file holding the parameter map
        #[clap(long, value_parser)]
        params: Option<PathBuf>,

        /// Output file for the ranked records (stdout when omitted)
        #[clap(long, short, value_parser)]
        out: Option<PathBuf>,
    },

    /// Check that a force field can run
    Check {
        /// Energy method to check (gfn2, so3lr)
        #[clap(long, default_value = "gfn2")]
        method: String,

        /// Device for GPU-capable methods (auto, cpu, cuda:N)
        #[clap(long, default_value = "auto")]
        device: String,
    },

    /// Reduce a complex to the residues around its ligand
    Chop {
        /// PDB file containing the complex
        #[clap(long, value_parser)]
        input: PathBuf,

        /// Distance cutoff in Angstroms
        #[clap(long, default_value_t = DEFAULT_DISTANCE_CUTOFF)]
        cutoff: f64,

        /// Residue name of the ligand
        #[clap(long, default_value = LIGAND_LABEL)]
        ligand_label: String,

        /// Pull residues that continue a retained run into the selection
        #[clap(long)]
        expand_chain_breaks: bool,

        /// Output PDB file
        #[clap(long, short, value_parser)]
        out: PathBuf,
    },
}

fn init_logging(cli_level: Option<&str>, settings: &Settings) -> Result<()> {
    let level = parse_log_level(cli_level.unwrap_or(&settings.log_level))?;
    env_logger::Builder::new()
        .filter_level(level)
        .parse_env("RUST_LOG")
        .init();
    Ok(())
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse JSON in {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::from_env().context("Invalid environment configuration")?;
    init_logging(cli.log_level.as_deref(), &settings)?;
    if let Err(e) = settings.validate() {
        warn!("Settings: {}", e);
    }

    match cli.command {
        Commands::Rank { poses, params, out } => {
            let records = match read_json(&poses)? {
                Value::Array(records) => records,
                _ => bail!("{} must contain a JSON array of pose records", poses.display()),
            };

            let params = match params {
                Some(path) => match read_json(&path)? {
                    Value::Object(map) => map,
                    _ => bail!("{} must contain a JSON object", path.display()),
                },
                None => Map::new(),
            };

            let ranked = rank_records(records, &params, &settings);
            let text = serde_json::to_string_pretty(&ranked)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, text)
                        .with_context(|| format!("Failed to write results to {}", path.display()))?;
                    info!("Results written to {}", path.display());
                }
                None => println!("{}", text),
            }
        }

        Commands::Check { method, device } => {
            let method: EnergyMethod = method.parse()?;
            let oracle: Box<dyn EnergyOracle> = match method {
                EnergyMethod::Gfn2 => Box::new(XtbAdapter::new(settings.xtb_config())),
                EnergyMethod::So3lr => {
                    let device = device.parse::<DeviceRequest>()?.resolve();
                    Box::new(So3lrAdapter::new(settings.so3lr_config(), device))
                }
            };

            match oracle.check_availability() {
                Ok(version) => {
                    info!("{} available on {}", oracle.name(), oracle.device());
                    println!("{}: {}", method, version);
                }
                Err(e) => {
                    error!("{} unavailable: {}", oracle.name(), e);
                    bail!("{} unavailable: {}", method, e);
                }
            }
        }

        Commands::Chop {
            input,
            cutoff,
            ligand_label,
            expand_chain_breaks,
            out,
        } => {
            info!("Loading complex: {}", input.display());
            let complex = read_structure(&input)
                .with_context(|| format!("Failed to parse complex file: {}", input.display()))?;

            let chopped = chop(&complex, &ligand_label, cutoff, expand_chain_breaks);
            if chopped.atoms.iter().all(|a| a.residue_name.trim() != ligand_label) {
                warn!("No residue labelled {} found in {}", ligand_label, input.display());
            }

            write_pdb(&chopped, &out)
                .with_context(|| format!("Failed to write chopped complex to {}", out.display()))?;
            info!(
                "Chopped {} atoms to {} atoms, written to {}",
                complex.len(),
                chopped.len(),
                out.display()
            );
        }
    }

    Ok(())
}
