use super::{assemble_sections, CallParams, RestartMode, ScriptSection, LOG_PREFIX};
use crate::{
    config::{ConfigError, NotFoundError},
    input::InputDeck,
    machine::Machine,
    restart::{copy_on_restart, RestartCopyMode, RestartError},
    scan::ScanParameter,
    util::next_available_dir,
};
use globset::{Glob, GlobMatcher};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

/// Subfolder of the output directory that receives a copy of the executable
/// when `copy_exe` is requested.
pub const EXE_COPY_SUBFOLDER: &str = "localbin";

/// Options of the `[spice]` config section. Serde enforces the label set and
/// the boolean typing; [`Spice::validate_options`] enforces the cross-field
/// rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpiceOptions {
    #[serde(alias = "spice_version")]
    pub version: u32,
    pub verbose: bool,
    pub soft_restart: bool,
    pub full_restart: bool,
    /// Hard time limit handed to the binary via `-l`, in hours. Overrides
    /// the safe-walltime injection.
    #[serde(default)]
    pub time_limit: Option<u32>,
}

/// Spice 2 and 3: config verification, input-deck verification and the
/// submission-script body for both versions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Spice;

/// Column of the percentage-progress line in the ongoing log, per version.
fn log_percentage_column(version: u32) -> &'static str {
    match version {
        3 => "$2",
        _ => "$1",
    }
}

impl Spice {
    pub fn validate_options(&self, options: &SpiceOptions) -> Result<(), ConfigError> {
        if !matches!(options.version, 2 | 3) {
            return Err(ConfigError::UnsupportedVersion(options.version));
        }
        if options.soft_restart && options.full_restart {
            return Err(ConfigError::ConflictingRestartFlags);
        }
        match options.time_limit {
            Some(0) => return Err(ConfigError::InvalidTimeLimit),
            Some(limit) => warn!(
                "a hard time limit of {limit}hr(s) is set on spice; this overrides the \
                 safe job time"
            ),
            None => {}
        }
        Ok(())
    }

    pub fn restart_mode(&self, options: &SpiceOptions) -> RestartMode {
        if options.full_restart {
            RestartMode::Full
        } else if options.soft_restart {
            RestartMode::Soft
        } else {
            RestartMode::None
        }
    }

    /// Arguments the binary takes from the config options: restart flag,
    /// verbosity, explicit time limit.
    pub fn command_line_args(&self, options: &SpiceOptions) -> Vec<String> {
        let mut args = Vec::new();
        match self.restart_mode(options) {
            RestartMode::Soft => args.push("-r".to_owned()),
            RestartMode::Full => args.push("-c".to_owned()),
            RestartMode::None => {}
        }
        if options.verbose {
            args.push("-v".to_owned());
        }
        if let Some(limit) = options.time_limit {
            args.push(format!("-l {limit}"));
        }
        args
    }

    /// Spice-3 decks carry extra invariants: the simulation window must be
    /// power-of-two sized, the x-y domain decomposition must be a power of
    /// two matching the cpu request, and species must leave their MPI rank
    /// unassigned.
    pub fn verify_input_deck(
        &self,
        deck: &InputDeck,
        options: &SpiceOptions,
        cpus_total: u32,
    ) -> Result<(), ConfigError> {
        if options.version != 3 {
            return Ok(());
        }

        for dimension in ["Lx", "Ly", "Lz"] {
            let size = deck.require_int("geom", dimension)?;
            if !is_power_of_two(size) {
                return Err(ConfigError::WindowNotPowerOfTwo {
                    dimension,
                    size,
                });
            }
        }

        let areas = deck.require_int("geom", "decompose_x")? * deck.require_int("geom", "decompose_y")?;
        if !is_power_of_two(areas) {
            return Err(ConfigError::DecompositionNotPowerOfTwo { areas });
        }
        if areas != i64::from(cpus_total) {
            return Err(ConfigError::DecompositionCpuMismatch {
                areas,
                cpus: cpus_total,
            });
        }

        let species = deck.require_int("num_spec", "no_species")?;
        for index in 0..species {
            let section = format!("specie{index}");
            if deck.require_int(&section, "mpi_rank")? != -1 {
                let name = deck.get(&section, "name").unwrap_or(&section).to_owned();
                return Err(ConfigError::SpeciesRankAssigned { species: name });
            }
        }

        Ok(())
    }

    pub fn is_parameter_scan(&self, input_file: &Path) -> Result<bool, ConfigError> {
        let deck = InputDeck::load(input_file)?;
        Ok(!deck.scanning_params().is_empty())
    }

    pub fn scanning_parameters(
        &self,
        input_file: &Path,
    ) -> Result<(Vec<ScanParameter>, InputDeck), ConfigError> {
        let deck = InputDeck::load(input_file)?;
        let params = deck.scanning_params();
        Ok((params, deck))
    }

    /// The shell body: environment preamble, the (possibly rank-placed) run
    /// invocation, the stitcher pass for version 3, and the post-run
    /// rotate/backup/self-cancel block.
    pub fn render_body(
        &self,
        machine: &Machine,
        call: &CallParams,
        options: &SpiceOptions,
        multi_submission: bool,
        safe_job_time: bool,
        backup: bool,
    ) -> String {
        let output_dir = call.output_dir.display();
        let executable_dir = call.executable_dir.display();
        let job_name = call
            .output_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let t_file = call.output_dir.join(format!("t-{job_name}"));
        let o_file = call.output_dir.join(&job_name);

        let mut args = self.command_line_args(options);
        if multi_submission && !self.restart_mode(options).is_restart() {
            // chained continuation of a fresh run
            args.push("-c".to_owned());
        }
        if options.time_limit.is_none() && safe_job_time {
            if let Ok(hours) = machine.safe_walltime_hours() {
                args.push(format!("-l {hours}"));
            }
        }

        let preamble = format!(
            "source $HOME/.bashrc\n\
             \n\
             echo \"Date is: $(env TZ=GB date)\"\n\
             echo \"MPI version is: \"\n\
             echo \"\"\n\
             mpirun --version\n\
             echo \"\"\n\
             echo \"Changing directory to {executable_dir}\"\n\
             cd {executable_dir}\n\
             \n\
             if [ $(ulimit -s) != \"unlimited\" ]; then\n\
             \techo \"ulimit is:\"\n\
             \tulimit -s\n\
             \n\
             \techo \"\"\n\
             \tulimit -s unlimited\n\
             \techo \"new ulimit is:\"\n\
             \tulimit -s\n\
             \techo \"\"\n\
             fi\n\
             \n"
        );

        let run_command = match &call.node_distribution {
            // arbitrary rank placement: one task on the first node
            Some(distribution) => format!(
                "srun -n {} -m arbitrary -w `{}/arbitrary.pl {distribution}`",
                call.cpus_total, executable_dir
            ),
            None => format!("mpirun -np {}", call.cpus_total),
        };
        let spice_command = [
            call.executable.display().to_string(),
            args.join(" "),
            format!("-o {}", o_file.display()),
            format!("-i {}", call.input_file.display()),
            format!("-t {}", t_file.display()),
        ]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

        let run = format!(
            "echo \"\"\n\
             echo \"executing: {run_command} {spice_command}\"\n\
             echo \"\"\n\
             time {run_command} {spice_command}\n\
             \n"
        );

        let stitcher = if options.version == 3 {
            let stitcher_command = format!(
                "{}/stitcher.bin -i {} -t {} -n {}",
                executable_dir,
                call.input_file.display(),
                t_file.display(),
                call.cpus_total
            );
            format!(
                "echo \"\"\n\
                 echo \"executing: {stitcher_command}\"\n\
                 echo \"\"\n\
                 {stitcher_command}\n\
                 \n"
            )
        } else {
            String::new()
        };

        let mut postrun = format!(
            "\n\
             sleep 600\n\
             cat {output_dir}/{LOG_PREFIX}.out >> {output_dir}/{LOG_PREFIX}.ongoing.out\n\
             cat {output_dir}/{LOG_PREFIX}.err >> {output_dir}/{LOG_PREFIX}.ongoing.err\n\
             \n\
             BU_FOLDER=\"{output_dir}/backup_$(env TZ=GB date +\"%Y%m%d-%H%M\")\"\n\
             echo \"Making backup of simulation data into $BU_FOLDER\"\n\
             mkdir \"$BU_FOLDER\"\n\
             rsync -azvp --exclude='backup*' {}.mat $BU_FOLDER\n\
             rsync -azvp --exclude='backup*' --exclude='*.mat' --exclude='*ongoing*' {output_dir}/* $BU_FOLDER\n",
            t_file.display()
        );
        if backup {
            postrun.push_str(&format!(
                "rsync -azvp --exclude='backup*' {output_dir}/* $BU_FOLDER\n"
            ));
        }

        // cancel the remaining chained jobs once the ongoing log reports the
        // simulation as effectively finished
        // TODO: take the cancel command from the scheduler table once a
        // non-Slurm machine needs chained jobs
        postrun.push_str(&format!(
            "\n\
             if (( $(cat {output_dir}/{LOG_PREFIX}.ongoing.out | grep '% ' | tail -n 1 \
             | awk '{{print {column}}}') >= 99 ))\n\
             then\n\
             \tscancel $(cat {output_dir}/jobs.txt)\n\
             fi\n",
            column = log_percentage_column(options.version)
        ));

        assemble_sections(&[
            ScriptSection::new("preamble", preamble),
            ScriptSection::new("run", run),
            ScriptSection::new("stitcher", stitcher),
            ScriptSection::new("postrun", postrun),
        ])
    }

    /// Directory lifecycle for one run.
    ///
    /// Fresh runs create the output directory, stepping aside to a numbered
    /// sibling when it already exists. Restarts require an existing
    /// directory and apply the restart-copy policy; a directory that does
    /// not look like spice output is used anyway, with a warning.
    pub fn directory_io(
        &self,
        output_dir: &Path,
        options: &SpiceOptions,
        dry_run: bool,
        copy_mode: RestartCopyMode,
    ) -> Result<PathBuf, RestartError> {
        if !self.restart_mode(options).is_restart() {
            let mut resolved = output_dir.to_path_buf();
            if resolved.is_dir() {
                warn!(
                    "{} already exists, searching for the next available similar directory",
                    resolved.display()
                );
                resolved = next_available_dir(&resolved);
            }
            info!("using directory {}", resolved.display());
            if !dry_run {
                fs::create_dir_all(&resolved).map_err(RestartError::Io)?;
            }
            return Ok(resolved);
        }

        if output_dir.is_dir() {
            if !self.is_own_output_dir(output_dir) {
                warn!(
                    "directory {} doesn't look like a spice simulation output folder, \
                     continuing anyway",
                    output_dir.display()
                );
            }
            copy_on_restart(output_dir, dry_run, copy_mode)
        } else if output_dir.exists() {
            Err(ConfigError::RestartTargetNotADirectory(output_dir.to_path_buf()).into())
        } else {
            Err(NotFoundError::RestartTarget(output_dir.to_path_buf()).into())
        }
    }

    /// Fingerprint of a finished or running spice output directory: exactly
    /// one result `.mat` (not a `t-` file, not a `.2d.mat` slice), exactly
    /// one un-numbered `t-` file, and at least one more numbered `t-` file
    /// beside it.
    pub fn is_own_output_dir(&self, directory: &Path) -> bool {
        static MAT: Lazy<GlobMatcher> =
            Lazy::new(|| Glob::new("*.mat").unwrap().compile_matcher());
        static T_MAT: Lazy<GlobMatcher> =
            Lazy::new(|| Glob::new("t-*.mat").unwrap().compile_matcher());

        let Ok(entries) = fs::read_dir(directory) else {
            return false;
        };
        let names = entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();

        let result_files = names
            .iter()
            .filter(|name| MAT.is_match(name) && !name.starts_with("t-") && !name.ends_with(".2d.mat"))
            .count();
        let t_files = names
            .iter()
            .filter(|name| T_MAT.is_match(name))
            .collect::<Vec<_>>();
        let unnumbered_t_files = t_files
            .iter()
            .filter(|name| {
                let stem = name.trim_end_matches(".mat");
                let mut tail = stem.chars().rev();
                let last_two_digits = matches!(
                    (tail.next(), tail.next()),
                    (Some(a), Some(b)) if a.is_ascii_digit() && b.is_ascii_digit()
                );
                !last_two_digits
            })
            .count();

        result_files == 1 && unnumbered_t_files == 1 && t_files.len() > 1
    }

    pub fn copy_executable(
        &self,
        output_dir: &Path,
        call: &mut CallParams,
        dry_run: bool,
    ) -> Result<(), io::Error> {
        let file_name = call
            .executable
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "executable has no file name"))?
            .to_owned();
        let local_bin = output_dir.join(EXE_COPY_SUBFOLDER);
        let target = local_bin.join(&file_name);

        if !dry_run {
            fs::create_dir_all(&local_bin)?;
            fs::copy(&call.executable, &target)?;
        }
        call.executable = target;
        Ok(())
    }
}

fn is_power_of_two(value: i64) -> bool {
    value > 0 && value & (value - 1) == 0
}
