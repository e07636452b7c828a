use crate::{
    codes::CodeOptions, codes::spice::SpiceOptions, input::DeckError, machine::MachineRegistry,
    machine::Walltime,
};
use serde::Deserialize;
use std::{fs, io, path::Path, path::PathBuf};
use thiserror::Error;
use tracing::error;

/// Structurally invalid or infeasible configuration. Always raised before
/// any filesystem mutation and surfaced to the caller verbatim.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read the config file")]
    Io(#[from] io::Error),
    #[error("config file is not valid YAML")]
    Yaml(#[from] serde_yaml::Error),
    #[error("n_cpus must be a positive integer")]
    NoCpusRequested,
    #[error("nodes must be a positive integer when given")]
    ZeroNodes,
    #[error("{cpus} cpus cannot be split evenly across {nodes} nodes")]
    UnevenCpuSplit { cpus: u32, nodes: u32 },
    #[error("{cpus_per_node} cpus per node exceeds the {max} available on {machine}")]
    NodeOversubscribed {
        cpus_per_node: u32,
        max: u32,
        machine: String,
    },
    #[error("number of nodes requested ({nodes}) is greater than the maximum available on {machine} ({max})")]
    TooManyNodes {
        nodes: u32,
        max: u32,
        machine: String,
    },
    #[error("walltime '{0}' is not of the form H:MM:SS, H:MM or whole hours")]
    InvalidWalltime(String),
    #[error("isolating the first node needs at least two nodes and two cpus, got {nodes} node(s)")]
    IsolationNeedsTwoNodes { nodes: u32 },
    #[error("invalid restart copy mode '{0}', expected 0-3 or none/new/stay_out/stay_in")]
    InvalidRestartCopyMode(String),
    #[error("unknown machine '{0}'")]
    UnknownMachine(String),
    #[error("code '{0}' is not supported")]
    UnsupportedCode(String),
    #[error("the config file has no '{code}' section for the selected code")]
    MissingCodeSection { code: String },
    #[error("spice_version given ({0}) was not valid, must be either 2 or 3")]
    UnsupportedVersion(u32),
    #[error(
        "the soft and full restart flags were both set to true, please select only one: a full \
         restart uses all available information (including diagnostics), a soft restart only \
         particle positions, velocities and the iteration count"
    )]
    ConflictingRestartFlags,
    #[error("time_limit must be a positive, integer number of hours")]
    InvalidTimeLimit,
    #[error("invalid simulation window size ({dimension}={size}), must be a power of 2 in 3D simulations")]
    WindowNotPowerOfTwo { dimension: &'static str, size: i64 },
    #[error("invalid x-y decomposition ({areas} decomposition areas), must be a power of 2 in 3D simulations")]
    DecompositionNotPowerOfTwo { areas: i64 },
    #[error("invalid x-y decomposition ({areas} decomposition areas), must equal the number of cpus requested ({cpus})")]
    DecompositionCpuMismatch { areas: i64, cpus: u32 },
    #[error("invalid mpi_rank on species {species}, must be set to -1")]
    SpeciesRankAssigned { species: String },
    #[error("desired directory ({0}) is not a code output directory and therefore not restartable")]
    RestartTargetNotADirectory(PathBuf),
    #[error("input deck is invalid")]
    Deck(#[from] DeckError),
}

/// A referenced file, executable or restart target does not exist.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("no input file found at {0}")]
    InputFile(PathBuf),
    #[error("no executable file found at {0}")]
    Executable(PathBuf),
    #[error("the 'bin' option must be a valid directory with a binary in it: {0}")]
    ExecutableDir(PathBuf),
    #[error("no directory found to restart at {0}")]
    RestartTarget(PathBuf),
}

/// The `scheduler` section: who submits what, where, with which resources.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerOpts {
    pub machine: String,
    pub user: String,
    pub job_name: String,
    pub n_cpus: u32,
    pub walltime: String,
    #[serde(default)]
    pub nodes: Option<u32>,
    /// Requested memory in GB; clamped to the machine's capacity.
    #[serde(default)]
    pub memory: Option<u32>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub qos: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_events: Option<String>,
    /// Place a single task on the first node and pack the rest evenly.
    #[serde(default)]
    pub isolate_first_node: bool,
}

/// The `code` section: which code to run and where its files live.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeOpts {
    pub code_name: String,
    /// Directory holding the binary and its helper scripts.
    pub bin: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    pub executable: PathBuf,
    /// Copy the executable into the output directory and run the copy.
    #[serde(default)]
    pub copy_exe: bool,
    /// Requested scan dimensionality; 0 picks one dimension per distinct
    /// scan length.
    #[serde(default)]
    pub scan_dims: usize,
}

/// The whole submit config. No defaults are provided for the required
/// parameters, so the file is a complete record of the job options used for
/// the simulation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitConfig {
    pub scheduler: SchedulerOpts,
    pub code: CodeOpts,
    #[serde(default)]
    pub spice: Option<SpiceOptions>,
    /// Where this config was loaded from; staged into the output directory
    /// alongside the input deck.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl SubmitConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&text)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// The typed option set of the selected code.
    pub fn code_options(&self) -> Result<CodeOptions, ConfigError> {
        match self.code.code_name.as_str() {
            "spice" => self
                .spice
                .clone()
                .map(CodeOptions::Spice)
                .ok_or(ConfigError::MissingCodeSection {
                    code: self.code.code_name.clone(),
                }),
            _ => Err(ConfigError::UnsupportedCode(self.code.code_name.clone())),
        }
    }

    /// Catch as many config problems as possible in one pass instead of
    /// piece-by-piece, to make debugging easier for users. Returns whether
    /// an error was found; details go to the log.
    pub fn preflight_checks(&self, registry: &MachineRegistry) -> bool {
        let mut contains_error = false;

        if registry.get(&self.scheduler.machine).is_none() {
            error!(
                "scheduler.machine '{}' is not supported, available machines: {:?}",
                self.scheduler.machine,
                registry.names().collect::<Vec<_>>()
            );
            contains_error = true;
        }

        if self.scheduler.n_cpus == 0 {
            error!("scheduler.n_cpus cannot be 0");
            contains_error = true;
        }

        if let Err(error) = self.scheduler.walltime.parse::<Walltime>() {
            error!("scheduler.walltime is invalid: {error}");
            contains_error = true;
        }

        match self.code.code_name.as_str() {
            "spice" => {
                if self.spice.is_none() {
                    error!("the config file needs a 'spice' section for the selected code");
                    contains_error = true;
                }
            }
            other => {
                error!("code.code_name '{other}' is not supported, currently implemented codes: [\"spice\"]");
                contains_error = true;
            }
        }

        contains_error
    }
}
