use crate::{
    codes::{check_files, CallParams, CodeOptions, Codes, LOG_PREFIX},
    config::{ConfigError, NotFoundError, SubmitConfig},
    input::InputDeck,
    machine::{Machine, Walltime},
    restart::{RestartCopyMode, RestartError},
    scan::{self, ScanError, ScanVariant},
    scheduler::{Param, ParameterError, Scheduler, SubmissionParams},
};
use std::{fs, io, path::PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum PlanError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error(transparent)]
    Parameter(#[from] ParameterError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Restart(#[from] RestartError),
    #[error("failed to stage files into the output directory")]
    Io(#[from] io::Error),
}

/// Caller-selected behaviour for one planning run.
#[derive(Debug, Clone, Copy)]
pub struct PlanOptions {
    /// Resolve and render everything, but never touch the filesystem or
    /// submit.
    pub dry_run: bool,
    /// Split walltime against the 90% threshold instead of the hard
    /// maximum.
    pub safe_job_time: bool,
    /// Mirror the whole output directory in the post-run backup, not just
    /// the latest result file.
    pub backup: bool,
    pub restart_copy_mode: RestartCopyMode,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            safe_job_time: true,
            backup: true,
            restart_copy_mode: RestartCopyMode::default(),
        }
    }
}

/// One rendered submission script. `path` is set unless this was a dry run.
#[derive(Debug, Clone)]
pub struct JobScript {
    pub path: Option<PathBuf>,
    pub text: String,
    /// Chained scripts are submitted with the scheduler's dependency
    /// arguments pointing at the previous job id.
    pub chained: bool,
}

/// Everything one scan variant needs for submission and bookkeeping.
#[derive(Debug, Clone)]
pub struct VariantPlan {
    /// Scan label; `None` for a plain, un-scanned run.
    pub label: Option<String>,
    pub job_name: String,
    pub output_dir: PathBuf,
    pub scripts: Vec<JobScript>,
}

/// The full result of planning: per-variant script sets plus what the caller
/// needs to drive the batch-submit binary.
#[derive(Debug)]
pub struct SubmissionPlan {
    pub machine_name: String,
    pub submit_command: &'static str,
    pub n_jobs: u32,
    pub variants: Vec<VariantPlan>,
    scheduler: &'static Scheduler,
}

impl SubmissionPlan {
    /// Arguments chaining a submission after `previous_job_id`.
    pub fn dependency_args(&self, previous_job_id: &str) -> Vec<String> {
        self.scheduler.dependency_args(previous_job_id)
    }
}

/// Composes capacity model, scan expander, restart manager and the
/// scheduler/code renderers into a submission plan. All validation runs
/// before the first filesystem mutation.
pub struct Orchestrator<'a> {
    machine: &'a Machine,
    code: Codes,
    options: PlanOptions,
}

impl<'a> Orchestrator<'a> {
    pub fn new(machine: &'a Machine, code: Codes, options: PlanOptions) -> Self {
        Self {
            machine,
            code,
            options,
        }
    }

    pub fn plan(&self, config: &SubmitConfig) -> Result<SubmissionPlan, PlanError> {
        let scheduler = self.machine.scheduler.scheduler();
        let code_options = config.code_options()?;

        // resource arithmetic and option validation, nothing on disk yet
        let (nodes, cpus_per_node) = self
            .machine
            .resolve_layout(config.scheduler.n_cpus, config.scheduler.nodes)?;
        let requested: Walltime = config.scheduler.walltime.parse()?;
        let (walltime, n_jobs) = self.resolve_walltime(requested);
        let mut params = self.submission_params(config, scheduler, nodes, cpus_per_node, walltime);

        self.code.validate_options(&code_options)?;
        check_files(
            &config.code.input,
            &config.code.executable,
            self.options.dry_run,
        )?;
        if !config.code.bin.is_dir() {
            return Err(NotFoundError::ExecutableDir(config.code.bin.clone()).into());
        }

        let (scan_params, deck) = self.code.scanning_parameters(&config.code.input)?;
        self.code
            .verify_input_deck(&deck, &code_options, config.scheduler.n_cpus)?;

        let node_distribution = if config.scheduler.isolate_first_node {
            Some(
                self.machine
                    .isolated_first_node_distribution(config.scheduler.n_cpus, nodes)?,
            )
        } else {
            None
        };

        let variants = scan::expand(&scan_params, config.code.scan_dims)?;

        // first filesystem mutation: restart resolution and staging
        let output_dir = self.code.directory_io(
            &config.code.output,
            &code_options,
            self.options.dry_run,
            self.options.restart_copy_mode,
        )?;
        if !self.options.dry_run {
            fs::copy(
                &config.code.input,
                output_dir.join(staged_file_name(&config.code.input, "input.inp")),
            )?;
            if let Some(source) = &config.source_path {
                fs::copy(source, output_dir.join(staged_file_name(source, "submit.yml")))?;
            }
        }

        let mut call = CallParams {
            cpus_total: config.scheduler.n_cpus,
            executable: config.code.executable.clone(),
            executable_dir: config.code.bin.clone(),
            output_dir: output_dir.clone(),
            input_file: config.code.input.clone(),
            node_distribution,
        };
        if config.code.copy_exe {
            self.code
                .copy_executable(&output_dir, &mut call, self.options.dry_run)?;
        }

        let job_name = config.scheduler.job_name.clone();
        let mut plans = Vec::new();
        if variants.is_empty() {
            plans.push(self.plan_variant(
                scheduler,
                &code_options,
                &mut params,
                &mut call,
                &job_name,
                None,
                None,
                n_jobs,
            )?);
        } else {
            info!(
                "submitting a parameter scan with {} variant(s)",
                variants.len()
            );
            for variant in &variants {
                plans.push(self.plan_variant(
                    scheduler,
                    &code_options,
                    &mut params,
                    &mut call,
                    &job_name,
                    Some(variant),
                    Some(&deck),
                    n_jobs,
                )?);
            }
        }

        Ok(SubmissionPlan {
            machine_name: self.machine.name.clone(),
            submit_command: scheduler.submit_command,
            n_jobs,
            variants: plans,
            scheduler,
        })
    }

    /// Pin the per-job walltime to the machine maximum when the request has
    /// to be split across chained jobs.
    fn resolve_walltime(&self, requested: Walltime) -> (Walltime, u32) {
        let n_jobs = self
            .machine
            .n_jobs_for_walltime(requested, self.options.safe_job_time);
        if n_jobs == 1 {
            return (requested, 1);
        }

        let max = self
            .machine
            .max_job_time
            .expect("splitting only happens on bounded machines");
        warn!(
            "walltime requested ({requested}) exceeds the {}maximum for a single job on {} \
             ({max}hrs); the job will be split into {n_jobs}, each requesting {max}:00:00",
            if self.options.safe_job_time { "safe " } else { "" },
            self.machine.name
        );
        (Walltime::from_hours(u64::from(max)), n_jobs)
    }

    /// The canonical parameter set, with memory clamped to the machine and
    /// options the target scheduler does not support dropped with a warning.
    fn submission_params(
        &self,
        config: &SubmitConfig,
        scheduler: &Scheduler,
        nodes: u32,
        cpus_per_node: u32,
        walltime: Walltime,
    ) -> SubmissionParams {
        let mut params = SubmissionParams::new();
        params.insert(Param::JobName, &config.scheduler.job_name);
        params.insert(Param::Nodes, nodes);
        params.insert(Param::CpusPerNode, cpus_per_node);
        params.insert(Param::Walltime, walltime);

        let optional = [
            (Param::Queue, config.scheduler.queue.clone()),
            (Param::Qos, config.scheduler.qos.clone()),
            (Param::Account, config.scheduler.account.clone()),
            (Param::Email, config.scheduler.email.clone()),
            (Param::EmailEvents, config.scheduler.email_events.clone()),
        ];
        for (param, value) in optional {
            let Some(value) = value else { continue };
            if scheduler.supports(param) {
                params.insert(param, value);
            } else {
                warn!(
                    "parameter '{}' is not implemented for {} on {}, ignoring it for this run",
                    param.label(),
                    scheduler.name,
                    self.machine.name
                );
            }
        }

        if let Some(memory) = config.scheduler.memory {
            let available = self.machine.memory_per_node * nodes;
            let granted = if memory > available {
                warn!(
                    "requested memory ({memory}GB) exceeds the {available}GB available on \
                     {nodes} node(s) of {}; submitting with {available}GB instead",
                    self.machine.name
                );
                available
            } else {
                memory
            };
            if scheduler.supports(Param::Memory) {
                params.insert(Param::Memory, granted);
            }
        }

        if params.contains(Param::Email) && !params.contains(Param::EmailEvents) {
            params.insert(Param::EmailEvents, scheduler.default_email_events);
        }

        params
    }

    fn plan_variant(
        &self,
        scheduler: &Scheduler,
        code_options: &CodeOptions,
        params: &mut SubmissionParams,
        call: &mut CallParams,
        base_job_name: &str,
        variant: Option<&ScanVariant>,
        deck: Option<&InputDeck>,
        n_jobs: u32,
    ) -> Result<VariantPlan, PlanError> {
        let base_output_dir = call.output_dir.clone();
        let (job_name, output_dir, label) = match variant {
            Some(variant) => {
                let output_dir = base_output_dir.join(&variant.label);
                if !self.options.dry_run {
                    fs::create_dir_all(&output_dir)?;
                }

                let mut deck = deck.expect("scan variants carry a deck").clone();
                for (section, parameter, value) in &variant.assignments {
                    deck.set(section, parameter, value);
                }
                let input_file = output_dir.join("input.inp");
                if !self.options.dry_run {
                    deck.write(&input_file).map_err(ConfigError::from)?;
                }

                call.output_dir = output_dir.clone();
                call.input_file = input_file;
                (
                    format!("{base_job_name}_{}", variant.label),
                    output_dir,
                    Some(variant.label.clone()),
                )
            }
            None => (base_job_name.to_owned(), base_output_dir.clone(), None),
        };

        params.insert(Param::JobName, &job_name);
        params.insert(Param::OutLog, output_dir.join(format!("{LOG_PREFIX}.out")).display());
        params.insert(Param::ErrLog, output_dir.join(format!("{LOG_PREFIX}.err")).display());

        let header = scheduler.render(params)?;
        let modules = self.machine.module_block();

        if n_jobs > 1 && scheduler.dependency_args("0").is_empty() {
            warn!(
                "{} has no job-dependency mechanism; chained scripts will start \
                 immediately when submitted",
                scheduler.name
            );
        }

        let mut scripts = Vec::new();
        for index in 0..n_jobs {
            let chained = index > 0;
            let body = self.code.render_body(
                self.machine,
                call,
                code_options,
                chained,
                self.options.safe_job_time,
                self.options.backup,
            );
            let text = format!("{header}{modules}{body}");

            let path = if self.options.dry_run {
                None
            } else {
                let path = output_dir.join(format!("submit_{index}{}", scheduler.script_ext));
                fs::write(&path, &text)?;
                Some(path)
            };
            scripts.push(JobScript {
                path,
                text,
                chained,
            });
        }

        // restore the base directory for the next variant
        call.output_dir = base_output_dir;
        Ok(VariantPlan {
            label,
            job_name,
            output_dir,
            scripts,
        })
    }
}

fn staged_file_name(path: &std::path::Path, fallback: &str) -> std::ffi::OsString {
    path.file_name()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| fallback.into())
}
