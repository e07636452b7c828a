mod codes;
mod config;
mod input;
mod machine;
mod orchestrator;
mod restart;
mod scan;
mod scheduler;
mod util;

#[cfg(test)]
mod restart_test;
#[cfg(test)]
mod util_test;

use crate::{
    codes::Codes,
    config::SubmitConfig,
    machine::MachineRegistry,
    orchestrator::{Orchestrator, PlanOptions, SubmissionPlan, VariantPlan},
    restart::RestartCopyMode,
};
use clap::Parser;
use std::{
    fs, io,
    path::PathBuf,
    process::{exit, Command, Stdio},
    str::FromStr,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::OptionExt;

/// Plan and submit batch-scheduler jobs for plasma simulation runs from a
/// single submit config.
#[derive(Parser, Debug)]
#[command(name = "spicerack", version)]
struct Cli {
    /// Submit config (YAML) with scheduler, code and code-option sections
    config_file: PathBuf,

    /// Resolve and render everything without touching disk or submitting
    #[arg(short, long)]
    dry_run: bool,

    /// Request the full machine maximum instead of the 90% safe walltime
    #[arg(short = 's', long)]
    no_safe_time: bool,

    /// Skip the full directory mirror in the post-run backup
    #[arg(short = 'b', long)]
    no_backup: bool,

    /// What to do with an existing output directory on restart
    #[arg(
        short,
        long,
        default_value = "new",
        value_parser = RestartCopyMode::from_str
    )]
    restart_copy_mode: RestartCopyMode,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match SubmitConfig::load(&cli.config_file) {
        Ok(config) => config,
        Err(error) => {
            error!("failed to load {}: {error}", cli.config_file.display());
            exit(1);
        }
    };

    let registry = MachineRegistry::builtin();
    if config.preflight_checks(&registry) {
        exit(1);
    }

    let machine = registry
        .get(&config.scheduler.machine)
        .expect("preflight verified the machine");
    let code = Codes::load(&config.code.code_name).expect("preflight verified the code");
    info!(
        "user {} submitting {} on machine {}",
        config.scheduler.user,
        code.name(),
        machine.name
    );

    let options = PlanOptions {
        dry_run: cli.dry_run,
        safe_job_time: !cli.no_safe_time,
        backup: !cli.no_backup,
        restart_copy_mode: cli.restart_copy_mode,
    };

    let plan = match Orchestrator::new(machine, code, options).plan(&config) {
        Ok(plan) => plan,
        Err(error) => {
            error!("{error}");
            exit(1);
        }
    };
    info!(
        "planned {} variant(s) of {} chained job(s) each on {}",
        plan.variants.len(),
        plan.n_jobs,
        plan.machine_name
    );

    if cli.dry_run {
        for variant in &plan.variants {
            for script in &variant.scripts {
                println!("Job script for {}:\n{}", variant.job_name, script.text);
            }
        }
        return;
    }

    for variant in &plan.variants {
        if let Err(error) = submit_variant(&plan, variant) {
            error!("submission of {} failed: {error}", variant.job_name);
            exit(1);
        }
    }
}

/// Drive the batch-submit binary for one variant's scripts, chaining each
/// script after its predecessor's job id, and record the ids in `jobs.txt`.
fn submit_variant(plan: &SubmissionPlan, variant: &VariantPlan) -> io::Result<()> {
    let mut jobs: Vec<String> = Vec::new();

    for script in &variant.scripts {
        let path = script
            .path
            .as_ref()
            .expect("non-dry plans write scripts to disk");

        let mut command = Command::new(plan.submit_command);
        if script.chained {
            let previous = jobs
                .last()
                .expect("chained scripts follow a first submission");
            command.args(plan.dependency_args(previous));
        }

        let output = command
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "{} exited with {}: {}",
                    plan.submit_command,
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }

        // both sbatch and qsub print the job id as the last token
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = stdout.split_whitespace().last().unwrap_or_log().to_owned();
        info!("submitted job number {job_id}");
        jobs.push(job_id);
    }

    let mut listing = jobs.join("\n");
    listing.push('\n');
    fs::write(variant.output_dir.join("jobs.txt"), listing)?;
    Ok(())
}
