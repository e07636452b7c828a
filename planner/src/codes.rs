pub mod spice;

#[cfg(test)]
mod spice_test;

use crate::{
    config::{ConfigError, NotFoundError},
    input::InputDeck,
    machine::Machine,
    restart::{RestartCopyMode, RestartError},
    scan::ScanParameter,
};
use std::path::{Path, PathBuf};

/// Stem of the per-run log files (`log.out`, `log.err`, `log.ongoing.out`).
pub const LOG_PREFIX: &str = "log";

/// How a run picks up from an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    /// Fresh run.
    None,
    /// Restart from particle information only.
    Soft,
    /// Restart from all available information, including diagnostics.
    Full,
}

impl RestartMode {
    pub fn is_restart(self) -> bool {
        !matches!(self, RestartMode::None)
    }
}

/// Everything the body generator needs to know about one invocation of the
/// simulation binary. Owned by a single orchestrator run and updated as scan
/// variants are processed.
#[derive(Debug, Clone)]
pub struct CallParams {
    pub cpus_total: u32,
    pub executable: PathBuf,
    pub executable_dir: PathBuf,
    pub output_dir: PathBuf,
    pub input_file: PathBuf,
    /// Per-node task counts for arbitrary rank placement; absent for a
    /// plain even launch.
    pub node_distribution: Option<String>,
}

/// Typed option set of the selected simulation code, produced once at the
/// config boundary.
#[derive(Debug, Clone)]
pub enum CodeOptions {
    Spice(spice::SpiceOptions),
}

/// The supported simulation codes.
///
/// Deliberately an enum rather than trait objects, so adding a code means
/// adding a variant and the compiler walks every dispatch site.
#[derive(Debug, Clone)]
pub enum Codes {
    Spice(spice::Spice),
}

impl Codes {
    pub fn load(name: &str) -> Result<Self, ConfigError> {
        match name {
            "spice" => Ok(Self::Spice(spice::Spice)),
            _ => Err(ConfigError::UnsupportedCode(name.to_owned())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Spice(_) => "spice",
        }
    }

    /// Code-specific option validation, run before anything touches disk.
    pub fn validate_options(&self, options: &CodeOptions) -> Result<(), ConfigError> {
        match (self, options) {
            (Self::Spice(code), CodeOptions::Spice(options)) => code.validate_options(options),
        }
    }

    pub fn restart_mode(&self, options: &CodeOptions) -> RestartMode {
        match (self, options) {
            (Self::Spice(code), CodeOptions::Spice(options)) => code.restart_mode(options),
        }
    }

    /// Validate the simulation input deck against the options and requested
    /// resources.
    pub fn verify_input_deck(
        &self,
        deck: &InputDeck,
        options: &CodeOptions,
        cpus_total: u32,
    ) -> Result<(), ConfigError> {
        match (self, options) {
            (Self::Spice(code), CodeOptions::Spice(options)) => {
                code.verify_input_deck(deck, options, cpus_total)
            }
        }
    }

    pub fn is_parameter_scan(&self, input_file: &Path) -> Result<bool, ConfigError> {
        match self {
            Self::Spice(code) => code.is_parameter_scan(input_file),
        }
    }

    /// The scan descriptors found in the deck, plus the deck itself for
    /// per-variant rewriting.
    pub fn scanning_parameters(
        &self,
        input_file: &Path,
    ) -> Result<(Vec<ScanParameter>, InputDeck), ConfigError> {
        match self {
            Self::Spice(code) => code.scanning_parameters(input_file),
        }
    }

    /// Shell text between the scheduler header and the end of the script.
    pub fn render_body(
        &self,
        machine: &Machine,
        call: &CallParams,
        options: &CodeOptions,
        multi_submission: bool,
        safe_job_time: bool,
        backup: bool,
    ) -> String {
        match (self, options) {
            (Self::Spice(code), CodeOptions::Spice(options)) => {
                code.render_body(machine, call, options, multi_submission, safe_job_time, backup)
            }
        }
    }

    /// Resolve (and on fresh runs create) the directory the run executes in,
    /// applying the restart-copy policy when the options ask for a restart.
    pub fn directory_io(
        &self,
        output_dir: &Path,
        options: &CodeOptions,
        dry_run: bool,
        copy_mode: RestartCopyMode,
    ) -> Result<PathBuf, RestartError> {
        match (self, options) {
            (Self::Spice(code), CodeOptions::Spice(options)) => {
                code.directory_io(output_dir, options, dry_run, copy_mode)
            }
        }
    }

    /// Heuristic: does `directory` look like this code's own output?
    pub fn is_own_output_dir(&self, directory: &Path) -> bool {
        match self {
            Self::Spice(code) => code.is_own_output_dir(directory),
        }
    }

    /// Copy the executable into the output directory and repoint
    /// `call.executable` at the copy.
    pub fn copy_executable(
        &self,
        output_dir: &Path,
        call: &mut CallParams,
        dry_run: bool,
    ) -> Result<(), std::io::Error> {
        match self {
            Self::Spice(code) => code.copy_executable(output_dir, call, dry_run),
        }
    }
}

/// A named piece of a job script. Bodies are assembled from an ordered list
/// of these instead of ad hoc concatenation, so a render can be checked for
/// duplicate or empty sections before the text is joined.
#[derive(Debug, Clone)]
pub struct ScriptSection {
    pub name: &'static str,
    pub text: String,
}

impl ScriptSection {
    pub fn new(name: &'static str, text: String) -> Self {
        Self { name, text }
    }
}

/// Join sections in order, skipping empty ones.
pub fn assemble_sections(sections: &[ScriptSection]) -> String {
    debug_assert!(
        sections
            .iter()
            .map(|section| section.name)
            .collect::<std::collections::BTreeSet<_>>()
            .len()
            == sections.len(),
        "script sections must have unique names"
    );

    sections
        .iter()
        .filter(|section| !section.text.is_empty())
        .map(|section| section.text.as_str())
        .collect::<String>()
}

/// Existence checks shared by the codes: input decks are required even on
/// dry runs, executables only when something will actually be submitted.
pub fn check_files(
    input_file: &Path,
    executable: &Path,
    dry_run: bool,
) -> Result<(), NotFoundError> {
    if !input_file.is_file() {
        return Err(NotFoundError::InputFile(input_file.to_path_buf()));
    }
    if !dry_run && !executable.is_file() {
        return Err(NotFoundError::Executable(executable.to_path_buf()));
    }
    Ok(())
}
